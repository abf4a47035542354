//! Multi-chain withdrawal engine
//!
//! # WARNING
//! - This binary moves real funds. Point it at test networks first.
//! - The in-memory store it ships with is for demos; production wires
//!   the store traits to the platform database and secret manager.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use chain_custodian::chains::is_utxo_chain;
use chain_custodian::config::Config;
use chain_custodian::orchestrator::Orchestrator;
use chain_custodian::provider::EvmClient;
use chain_custodian::store::{LogNotifier, MemoryStore, PlainKeyVault};
use chain_custodian::utxo::backend::fee_rate_per_byte;

/// Multi-chain withdrawal engine
#[derive(Parser)]
#[command(name = "custodian")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the withdrawal scheduler (demo: in-memory store)
    Start,

    /// Check connectivity to every configured chain
    Health,

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chain_custodian=info".parse().unwrap()),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Start => start(config).await,
        Commands::Health => health(&config).await,
        Commands::Config => {
            println!("{}", config.masked_display());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Run the scheduler against the in-memory store until interrupted
async fn start(config: Config) -> Result<()> {
    if config.chains.is_empty() {
        warn!("No chains configured; the scheduler will idle");
    }

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        store.clone(),
        store,
        Arc::new(PlainKeyVault),
        Arc::new(LogNotifier),
    );

    info!("Starting withdrawal scheduler (ctrl-c to stop)");
    tokio::select! {
        _ = orchestrator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}

/// Probe every configured chain: block height for EVM providers, fee
/// estimation for UTXO backends.
async fn health(config: &Config) -> Result<()> {
    let mut failures = 0;
    for chain in config.chains.keys() {
        if is_utxo_chain(chain) {
            match fee_rate_per_byte(chain, config).await {
                Ok(rate) => info!(chain = %chain, rate_sat_per_byte = rate, "fee source OK"),
                Err(e) => {
                    error!(chain = %chain, error = %e, "fee source unreachable");
                    failures += 1;
                }
            }
        } else {
            match EvmClient::connect(chain, config) {
                Ok(client) if client.is_healthy().await => {
                    info!(chain = %chain, "provider OK");
                }
                Ok(_) => {
                    error!(chain = %chain, "provider unhealthy");
                    failures += 1;
                }
                Err(e) => {
                    error!(chain = %chain, error = %e, "provider connection failed");
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} chain(s) failed health checks");
    }
    info!("All configured chains healthy");
    Ok(())
}
