//! EVM JSON-RPC access.
//!
//! One `EvmClient` per chain, built from the configured endpoint map. All
//! RPC calls run under a timeout so a stalled node cannot wedge the
//! withdrawal loop.

use std::sync::Arc;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionReceipt;
use alloy::signers::local::PrivateKeySigner;
use tokio::time::timeout;
use tracing::warn;

use crate::chains::{chain_spec, ChainFamily};
use crate::config::Config;
use crate::error::{Error, Result};

/// RPC client bound to one EVM chain
#[derive(Clone)]
pub struct EvmClient {
    provider: Arc<dyn Provider + Send + Sync>,
    chain: String,
    chain_id: u64,
    rpc_url: String,
    timeout_duration: Duration,
}

impl EvmClient {
    /// Connect to the configured endpoint for `chain`. Fails with a
    /// configuration error when the chain has no endpoint mapping or is
    /// not an EVM chain.
    pub fn connect(chain: &str, config: &Config) -> Result<Self> {
        let spec = chain_spec(chain)?;
        let chain_id = match spec.family {
            ChainFamily::Evm { chain_id } => chain_id,
            ChainFamily::Utxo { .. } => {
                return Err(Error::Config(format!("{chain} is not an EVM chain")))
            }
        };
        let endpoints = config
            .chain_endpoints(chain)
            .ok_or_else(|| Error::Config(format!("no endpoints configured for {chain}")))?;
        let rpc_url: url::Url = endpoints
            .rpc_url
            .parse()
            .map_err(|e| Error::Config(format!("invalid RPC URL for {chain}: {e}")))?;

        let provider: Arc<dyn Provider + Send + Sync> =
            Arc::new(ProviderBuilder::new().connect_http(rpc_url));

        Ok(Self {
            provider,
            chain: chain.to_string(),
            chain_id,
            rpc_url: endpoints.rpc_url.clone(),
            timeout_duration: Duration::from_secs(config.evm.rpc_timeout_secs),
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn provider(&self) -> &(dyn Provider + Send + Sync) {
        self.provider.as_ref()
    }

    /// Provider that signs and sends with the given key. Used for the
    /// hot-wallet and gas-payer send paths.
    pub fn with_signer(&self, signer: PrivateKeySigner) -> Result<Arc<dyn Provider + Send + Sync>> {
        let rpc_url: url::Url = self
            .rpc_url
            .parse()
            .map_err(|e| Error::Config(format!("invalid RPC URL for {}: {e}", self.chain)))?;
        let wallet = EthereumWallet::from(signer);
        Ok(Arc::new(
            ProviderBuilder::new().wallet(wallet).connect_http(rpc_url),
        ))
    }

    pub async fn get_block_number(&self) -> Result<u64> {
        self.rpc("get_block_number", self.provider.get_block_number())
            .await
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        self.rpc("get_balance", self.provider.get_balance(address))
            .await
    }

    pub async fn get_gas_price(&self) -> Result<u128> {
        self.rpc("get_gas_price", self.provider.get_gas_price())
            .await
    }

    pub async fn get_transaction_count(&self, address: Address) -> Result<u64> {
        self.rpc(
            "get_transaction_count",
            self.provider.get_transaction_count(address),
        )
        .await
    }

    /// Read-only contract call
    pub async fn call(&self, tx: alloy::rpc::types::TransactionRequest) -> Result<alloy::primitives::Bytes> {
        self.rpc("eth_call", self.provider.call(tx)).await
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> Result<Option<TransactionReceipt>> {
        self.rpc(
            "get_transaction_receipt",
            self.provider.get_transaction_receipt(tx_hash),
        )
        .await
    }

    /// Node answers and reports a nonzero head block
    pub async fn is_healthy(&self) -> bool {
        match self.get_block_number().await {
            Ok(block) => block > 0,
            Err(e) => {
                warn!(chain = %self.chain, error = %e, "provider health check failed");
                false
            }
        }
    }

    // Provider read methods return lazy builders (`RpcWithBlock`,
    // `EthCall`) that are IntoFuture rather than Future.
    async fn rpc<T, F, E>(&self, label: &str, fut: F) -> Result<T>
    where
        F: std::future::IntoFuture<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        match timeout(self.timeout_duration, fut.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Rpc(format!("{}: {label}: {e}", self.chain))),
            Err(_) => Err(Error::Rpc(format!(
                "{}: {label}: timed out after {:?}",
                self.chain, self.timeout_duration
            ))),
        }
    }
}

impl std::fmt::Debug for EvmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmClient")
            .field("chain", &self.chain)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .finish()
    }
}

/// Configured websocket endpoint for a chain
pub fn wss_url(chain: &str, config: &Config) -> Result<String> {
    let endpoints = config
        .chain_endpoints(chain)
        .ok_or_else(|| Error::Config(format!("no endpoints configured for {chain}")))?;
    if endpoints.wss_url.is_empty() {
        return Err(Error::Config(format!(
            "no websocket endpoint configured for {chain}"
        )));
    }
    Ok(endpoints.wss_url.clone())
}

/// Parse a user-supplied recipient before anything touches the network
pub fn parse_address(address: &str) -> Result<Address> {
    address
        .parse()
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}
