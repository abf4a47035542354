//! Configuration loading and validation

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::chains::TokenCapability;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Per-chain network endpoints, keyed by chain symbol ("ETH", "BTC", ...)
    #[serde(default)]
    pub chains: HashMap<String, ChainEndpoints>,
    /// Per-"CHAIN:CURRENCY" token entries ("ETH:USDC", ...)
    #[serde(default)]
    pub tokens: HashMap<String, TokenConfig>,
    #[serde(default)]
    pub evm: EvmConfig,
    #[serde(default)]
    pub utxo: UtxoConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Directory holding contract artifact JSON files (abi + bytecode)
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainEndpoints {
    pub rpc_url: String,
    #[serde(default)]
    pub wss_url: String,
    /// Block explorer API key for remote ABI lookup
    #[serde(default)]
    pub explorer_api_key: String,
    /// Network name recorded on ledger entries ("mainnet", "testnet")
    #[serde(default = "default_network")]
    pub network: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub contract_address: String,
    pub capability: TokenCapability,
    #[serde(default = "default_token_decimals")]
    pub decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmConfig {
    /// Multiplier over the network-suggested gas price, reduces stuck-tx risk
    #[serde(default = "default_gas_price_multiplier")]
    pub gas_price_multiplier: f64,
    #[serde(default = "default_confirmations")]
    pub confirmations: u32,
    /// Upper bound on a confirmation wait; on expiry the request stays pending
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    /// Timeout applied to every single RPC call
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

impl Default for EvmConfig {
    fn default() -> Self {
        Self {
            gas_price_multiplier: default_gas_price_multiplier(),
            confirmations: default_confirmations(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

/// Interchangeable UTXO chain-data backends
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UtxoBackendKind {
    Blockcypher,
    Haskoin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UtxoConfig {
    /// Read-path backend per chain; defaults to BlockCypher
    #[serde(default)]
    pub read_backend: HashMap<String, UtxoBackendKind>,
    /// Broadcast is pinned to one backend for consistent relay behavior
    #[serde(default = "default_broadcast_backend")]
    pub broadcast_backend: UtxoBackendKind,
    #[serde(default)]
    pub blockcypher_token: String,
    #[serde(default)]
    pub btc_testnet: bool,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Bounded polling for transactions not yet indexed by the backend
    #[serde(default = "default_not_found_max_attempts")]
    pub not_found_max_attempts: u32,
    #[serde(default = "default_not_found_retry_secs")]
    pub not_found_retry_secs: u64,
}

impl Default for UtxoConfig {
    fn default() -> Self {
        Self {
            read_backend: HashMap::new(),
            broadcast_backend: default_broadcast_backend(),
            blockcypher_token: String::new(),
            btc_testnet: false,
            http_timeout_secs: default_http_timeout_secs(),
            not_found_max_attempts: default_not_found_max_attempts(),
            not_found_retry_secs: default_not_found_retry_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// Default value functions
fn default_network() -> String {
    "mainnet".to_string()
}

fn default_token_decimals() -> u8 {
    18
}

fn default_gas_price_multiplier() -> f64 {
    1.2
}

fn default_confirmations() -> u32 {
    2
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

fn default_receipt_poll_interval_ms() -> u64 {
    2000
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

fn default_broadcast_backend() -> UtxoBackendKind {
    UtxoBackendKind::Blockcypher
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_not_found_max_attempts() -> u32 {
    10
}

fn default_not_found_retry_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_artifacts_dir() -> String {
    "artifacts".to_string()
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix CUSTODIAN_)
            .add_source(
                config::Environment::with_prefix("CUSTODIAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.evm.gas_price_multiplier < 1.0 {
            anyhow::bail!(
                "gas_price_multiplier must be >= 1.0, got {}",
                self.evm.gas_price_multiplier
            );
        }

        if self.evm.confirmations == 0 {
            anyhow::bail!("confirmations must be at least 1");
        }

        if self.scheduler.poll_interval_secs == 0 {
            anyhow::bail!("scheduler poll_interval_secs must be positive");
        }

        for (chain, endpoints) in &self.chains {
            if endpoints.rpc_url.is_empty() {
                anyhow::bail!("chain {} has an empty rpc_url", chain);
            }
        }

        for key in self.tokens.keys() {
            if key.split(':').count() != 2 {
                anyhow::bail!("token key {} must be CHAIN:CURRENCY", key);
            }
        }

        Ok(())
    }

    /// Look up the endpoints for a chain
    pub fn chain_endpoints(&self, chain: &str) -> Option<&ChainEndpoints> {
        self.chains.get(chain)
    }

    /// Look up the token entry for a (chain, currency) pair
    pub fn token(&self, chain: &str, currency: &str) -> Option<&TokenConfig> {
        self.tokens.get(&format!("{chain}:{currency}"))
    }

    /// Read backend for a UTXO chain, BlockCypher unless overridden
    pub fn utxo_read_backend(&self, chain: &str) -> UtxoBackendKind {
        self.utxo
            .read_backend
            .get(chain)
            .copied()
            .unwrap_or(UtxoBackendKind::Blockcypher)
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let mut out = String::from("Configuration:\n");
        for (chain, ep) in &self.chains {
            out.push_str(&format!(
                "  {}: rpc={} network={} explorer_key={}\n",
                chain,
                mask_url(&ep.rpc_url),
                ep.network,
                if ep.explorer_api_key.is_empty() {
                    "(not set)"
                } else {
                    "***"
                }
            ));
        }
        out.push_str(&format!(
            "  evm: gas_multiplier={} confirmations={} confirmation_timeout={}s\n",
            self.evm.gas_price_multiplier,
            self.evm.confirmations,
            self.evm.confirmation_timeout_secs
        ));
        out.push_str(&format!(
            "  utxo: broadcast={:?} blockcypher_token={}\n",
            self.utxo.broadcast_backend,
            if self.utxo.blockcypher_token.is_empty() {
                "(not set)"
            } else {
                "***"
            }
        ));
        out.push_str(&format!(
            "  scheduler: poll_interval={}s\n",
            self.scheduler.poll_interval_secs
        ));
        out
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chains: HashMap::new(),
            tokens: HashMap::new(),
            evm: EvmConfig::default(),
            utxo: UtxoConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
