//! Chain-data backends for the UTXO chains.
//!
//! Two interchangeable HTTP backends, BlockCypher and Haskoin, are
//! normalized into one canonical transaction shape here so nothing
//! downstream branches on the provider. Broadcast is pinned to a single
//! backend regardless of the read path so relay behavior stays
//! consistent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::chains::chain_spec;
use crate::config::{Config, UtxoBackendKind};
use crate::error::{Error, Result};

const BLOCKCYPHER_API: &str = "https://api.blockcypher.com/v1";
const HASKOIN_API: &str = "https://api.haskoin.com";
const MEMPOOL_SPACE_FEES: &str = "https://mempool.space/api/v1/fee/recommended";

/// One output of a canonical chain transaction
#[derive(Debug, Clone)]
pub struct ChainTxOutput {
    pub addresses: Vec<String>,
    pub script: String,
    pub value_sats: u64,
    pub spent_by: Option<String>,
}

/// Provider-independent transaction view
#[derive(Debug, Clone)]
pub struct ChainTx {
    pub hash: String,
    pub block_height: Option<u64>,
    pub confirmations: u64,
    pub outputs: Vec<ChainTxOutput>,
}

impl ChainTx {
    /// Position and data of the first output paying `address`
    pub fn output_to(&self, address: &str) -> Option<(u32, &ChainTxOutput)> {
        self.outputs
            .iter()
            .enumerate()
            .find(|(_, out)| out.addresses.iter().any(|a| a == address))
            .map(|(i, out)| (i as u32, out))
    }
}

/// Per-address history entry, the summary shape address endpoints return
#[derive(Debug, Clone)]
pub struct AddressTx {
    pub hash: String,
    pub block_height: Option<u64>,
    pub value_sats: u64,
    pub spent: bool,
    pub confirmations: u64,
}

/// Read and relay operations against one chain-data provider
#[async_trait]
pub trait UtxoBackend: Send + Sync {
    /// Confirmed address balance in satoshis
    async fn fetch_balance(&self, address: &str) -> Result<u64>;

    /// Transaction history for an address, as the provider orders it
    async fn fetch_transactions(&self, address: &str) -> Result<Vec<AddressTx>>;

    /// One transaction; NotFound maps to a retryable error upstream
    async fn fetch_transaction(&self, tx_hash: &str) -> Result<ChainTx>;

    /// Raw transaction hex, needed for legacy PSBT inputs
    async fn fetch_raw_transaction(&self, tx_hash: &str) -> Result<String>;

    /// Relay a signed raw transaction, returns the txid
    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String>;
}

fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.utxo.http_timeout_secs))
        .build()
        .map_err(|e| Error::Internal(format!("http client: {e}")))
}

/// Read-path backend for a chain, honoring the configured override
pub fn backend_for(chain: &str, config: &Config) -> Result<Arc<dyn UtxoBackend>> {
    match config.utxo_read_backend(chain) {
        UtxoBackendKind::Blockcypher => Ok(Arc::new(BlockCypherBackend::new(chain, config)?)),
        UtxoBackendKind::Haskoin => Ok(Arc::new(HaskoinBackend::new(chain, config)?)),
    }
}

/// Broadcast backend, pinned by configuration rather than per-chain
pub fn broadcast_backend_for(chain: &str, config: &Config) -> Result<Arc<dyn UtxoBackend>> {
    match config.utxo.broadcast_backend {
        UtxoBackendKind::Blockcypher => Ok(Arc::new(BlockCypherBackend::new(chain, config)?)),
        UtxoBackendKind::Haskoin => Ok(Arc::new(HaskoinBackend::new(chain, config)?)),
    }
}

/// Poll for a transaction the backend may not have indexed yet. Gives up
/// after the configured attempt budget so a dropped broadcast cannot spin
/// forever.
pub async fn fetch_transaction_bounded(
    backend: &dyn UtxoBackend,
    tx_hash: &str,
    config: &Config,
) -> Result<ChainTx> {
    let max_attempts = config.utxo.not_found_max_attempts.max(1);
    let delay = Duration::from_secs(config.utxo.not_found_retry_secs);

    for attempt in 1..=max_attempts {
        match backend.fetch_transaction(tx_hash).await {
            Ok(tx) => return Ok(tx),
            Err(e) if attempt < max_attempts => {
                debug!(tx_hash, attempt, error = %e, "transaction not indexed yet, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(tx_hash, attempts = max_attempts, error = %e, "giving up on transaction lookup");
            }
        }
    }
    Err(Error::NotFoundTimeout {
        attempts: max_attempts,
    })
}

/// Fee rate in satoshis per byte.
///
/// BTC uses mempool.space's half-hour tier; the other chains use
/// BlockCypher's medium fee, published per kilobyte.
pub async fn fee_rate_per_byte(chain: &str, config: &Config) -> Result<f64> {
    let client = http_client(config)?;
    if chain == "BTC" {
        #[derive(Deserialize)]
        struct Recommended {
            #[serde(rename = "halfHourFee")]
            half_hour_fee: f64,
        }
        let fees: Recommended = client
            .get(MEMPOOL_SPACE_FEES)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("mempool.space: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Rpc(format!("mempool.space: {e}")))?;
        return Ok(fees.half_hour_fee);
    }

    #[derive(Deserialize)]
    struct ChainInfo {
        #[serde(default)]
        medium_fee_per_kb: f64,
    }
    let url = format!("{BLOCKCYPHER_API}/{}/main", chain.to_lowercase());
    let info: ChainInfo = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Rpc(format!("blockcypher fee rate: {e}")))?
        .json()
        .await
        .map_err(|e| Error::Rpc(format!("blockcypher fee rate: {e}")))?;
    Ok(info.medium_fee_per_kb / 1024.0)
}

// ---------------------------------------------------------------------------
// BlockCypher
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BlockCypherBackend {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl BlockCypherBackend {
    pub fn new(chain: &str, config: &Config) -> Result<Self> {
        chain_spec(chain)?;
        let network = match chain {
            "BTC" if config.utxo.btc_testnet => "btc/test3".to_string(),
            _ => format!("{}/main", chain.to_lowercase()),
        };
        Ok(Self {
            http: http_client(config)?,
            base: format!("{BLOCKCYPHER_API}/{network}"),
            token: config.utxo.blockcypher_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        if self.token.is_empty() {
            format!("{}{path}", self.base)
        } else {
            let sep = if path.contains('?') { '&' } else { '?' };
            format!("{}{path}{sep}token={}", self.base, self.token)
        }
    }
}

#[derive(Debug, Deserialize)]
struct BcBalance {
    #[serde(default)]
    final_balance: u64,
}

#[derive(Debug, Deserialize)]
struct BcOutput {
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    script: String,
    value: u64,
    #[serde(default)]
    spent_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BcTxRef {
    tx_hash: String,
    #[serde(default)]
    block_height: i64,
    value: u64,
    #[serde(default)]
    spent: bool,
    #[serde(default)]
    confirmations: u64,
}

impl From<BcTxRef> for AddressTx {
    fn from(txref: BcTxRef) -> Self {
        AddressTx {
            hash: txref.tx_hash,
            block_height: (txref.block_height >= 0).then_some(txref.block_height as u64),
            value_sats: txref.value,
            spent: txref.spent,
            confirmations: txref.confirmations,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BcTx {
    hash: String,
    #[serde(default)]
    block_height: i64,
    #[serde(default)]
    confirmations: u64,
    #[serde(default)]
    outputs: Vec<BcOutput>,
    #[serde(default)]
    hex: Option<String>,
}

impl From<BcTx> for ChainTx {
    fn from(tx: BcTx) -> Self {
        ChainTx {
            hash: tx.hash,
            // BlockCypher reports -1 for unconfirmed transactions
            block_height: (tx.block_height >= 0).then_some(tx.block_height as u64),
            confirmations: tx.confirmations,
            outputs: tx
                .outputs
                .into_iter()
                .map(|o| ChainTxOutput {
                    addresses: o.addresses,
                    script: o.script,
                    value_sats: o.value,
                    spent_by: o.spent_by,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl UtxoBackend for BlockCypherBackend {
    async fn fetch_balance(&self, address: &str) -> Result<u64> {
        let url = self.url(&format!("/addrs/{address}/balance"));
        let balance: BcBalance = get_json(&self.http, &url).await?;
        Ok(balance.final_balance)
    }

    async fn fetch_transactions(&self, address: &str) -> Result<Vec<AddressTx>> {
        #[derive(Deserialize)]
        struct AddrResponse {
            #[serde(default)]
            txrefs: Vec<BcTxRef>,
        }
        let url = self.url(&format!("/addrs/{address}"));
        let response: AddrResponse = get_json(&self.http, &url).await?;
        Ok(response.txrefs.into_iter().map(Into::into).collect())
    }

    async fn fetch_transaction(&self, tx_hash: &str) -> Result<ChainTx> {
        let url = self.url(&format!("/txs/{tx_hash}"));
        let tx: BcTx = get_json(&self.http, &url).await?;
        Ok(tx.into())
    }

    async fn fetch_raw_transaction(&self, tx_hash: &str) -> Result<String> {
        let url = self.url(&format!("/txs/{tx_hash}?includeHex=true"));
        let tx: BcTx = get_json(&self.http, &url).await?;
        tx.hex
            .ok_or_else(|| Error::Rpc(format!("no hex in response for {tx_hash}")))
    }

    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct PushedTx {
            hash: String,
        }
        #[derive(Deserialize)]
        struct PushResponse {
            tx: Option<PushedTx>,
            #[serde(default)]
            error: String,
        }

        let url = self.url("/txs/push");
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "tx": raw_hex }))
            .send()
            .await
            .map_err(|e| Error::Broadcast(format!("blockcypher push: {e}")))?;
        let status = response.status();
        let body: PushResponse = response
            .json()
            .await
            .map_err(|e| Error::Broadcast(format!("blockcypher push: {e}")))?;

        if !status.is_success() {
            return Err(Error::Broadcast(format!(
                "blockcypher push rejected ({status}): {}",
                body.error
            )));
        }
        body.tx
            .map(|t| t.hash)
            .ok_or_else(|| Error::Broadcast("relay returned no transaction id".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Haskoin
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HaskoinBackend {
    http: reqwest::Client,
    base: String,
}

impl HaskoinBackend {
    pub fn new(chain: &str, config: &Config) -> Result<Self> {
        if chain != "BTC" {
            return Err(Error::Config(format!(
                "haskoin backend only serves BTC, not {chain}"
            )));
        }
        let network = if config.utxo.btc_testnet { "btctest" } else { "btc" };
        Ok(Self {
            http: http_client(config)?,
            base: format!("{HASKOIN_API}/{network}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct HkBalance {
    #[serde(default)]
    confirmed: u64,
    #[serde(default)]
    unconfirmed: i64,
}

#[derive(Debug, Deserialize)]
struct HkBlock {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct HkSpender {
    txid: String,
}

#[derive(Debug, Deserialize)]
struct HkOutput {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    pkscript: String,
    value: u64,
    #[serde(default)]
    spender: Option<HkSpender>,
}

#[derive(Debug, Deserialize)]
struct HkTx {
    txid: String,
    #[serde(default)]
    block: Option<HkBlock>,
    #[serde(default)]
    outputs: Vec<HkOutput>,
}

impl From<HkTx> for ChainTx {
    fn from(tx: HkTx) -> Self {
        let confirmations = if tx.block.is_some() { 1 } else { 0 };
        ChainTx {
            hash: tx.txid,
            block_height: tx.block.map(|b| b.height),
            confirmations,
            outputs: tx
                .outputs
                .into_iter()
                .map(|o| ChainTxOutput {
                    addresses: o.address.into_iter().collect(),
                    script: o.pkscript,
                    value_sats: o.value,
                    spent_by: o.spender.map(|s| s.txid),
                })
                .collect(),
        }
    }
}

impl From<HkTx> for AddressTx {
    fn from(tx: HkTx) -> Self {
        let value_sats = tx.outputs.iter().map(|o| o.value).sum();
        let spent = tx.outputs.iter().any(|o| o.spender.is_some());
        AddressTx {
            hash: tx.txid,
            block_height: tx.block.as_ref().map(|b| b.height),
            value_sats,
            spent,
            confirmations: if tx.block.is_some() { 1 } else { 0 },
        }
    }
}

#[async_trait]
impl UtxoBackend for HaskoinBackend {
    async fn fetch_balance(&self, address: &str) -> Result<u64> {
        let url = format!("{}/address/{address}/balance", self.base);
        let balance: HkBalance = get_json(&self.http, &url).await?;
        let total = balance.confirmed as i64 + balance.unconfirmed;
        Ok(total.max(0) as u64)
    }

    async fn fetch_transactions(&self, address: &str) -> Result<Vec<AddressTx>> {
        let url = format!("{}/address/{address}/transactions/full", self.base);
        let txs: Vec<HkTx> = get_json(&self.http, &url).await?;
        Ok(txs.into_iter().map(AddressTx::from).collect())
    }

    async fn fetch_transaction(&self, tx_hash: &str) -> Result<ChainTx> {
        let url = format!("{}/transaction/{tx_hash}", self.base);
        let tx: HkTx = get_json(&self.http, &url).await?;
        Ok(tx.into())
    }

    async fn fetch_raw_transaction(&self, tx_hash: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct RawResponse {
            result: Option<String>,
        }
        let url = format!("{}/transaction/{tx_hash}/raw", self.base);
        let raw: RawResponse = get_json(&self.http, &url).await?;
        raw.result
            .ok_or_else(|| Error::Rpc(format!("no hex in response for {tx_hash}")))
    }

    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct PostResponse {
            txid: String,
        }
        let url = format!("{}/transactions", self.base);
        let response = self
            .http
            .post(&url)
            .body(raw_hex.to_string())
            .send()
            .await
            .map_err(|e| Error::Broadcast(format!("haskoin relay: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Broadcast(format!(
                "haskoin relay rejected: {}",
                response.status()
            )));
        }
        let posted: PostResponse = response
            .json()
            .await
            .map_err(|e| Error::Broadcast(format!("haskoin relay: {e}")))?;
        Ok(posted.txid)
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Rpc(format!("GET {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Rpc(format!("GET {url}: {}", response.status())));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Rpc(format!("GET {url}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blockcypher_normalization_keeps_unconfirmed_height_empty() {
        let tx = BcTx {
            hash: "abc".into(),
            block_height: -1,
            confirmations: 0,
            outputs: vec![BcOutput {
                addresses: vec!["1BoatSLRHtKNngkdXEeobR76b53LETtpyT".into()],
                script: "76a914".into(),
                value: 5000,
                spent_by: None,
            }],
            hex: None,
        };
        let canonical: ChainTx = tx.into();
        assert_eq!(canonical.block_height, None);
        assert_eq!(canonical.outputs[0].value_sats, 5000);
    }

    #[test]
    fn test_haskoin_normalization_maps_spender() {
        let tx = HkTx {
            txid: "def".into(),
            block: Some(HkBlock { height: 840000 }),
            outputs: vec![HkOutput {
                address: Some("1BoatSLRHtKNngkdXEeobR76b53LETtpyT".into()),
                pkscript: "76a914".into(),
                value: 7000,
                spender: Some(HkSpender { txid: "ghi".into() }),
            }],
        };
        let canonical: ChainTx = tx.into();
        assert_eq!(canonical.block_height, Some(840000));
        assert_eq!(canonical.outputs[0].spent_by.as_deref(), Some("ghi"));
        assert_eq!(canonical.confirmations, 1);
    }

    #[test]
    fn test_blockcypher_txref_normalization() {
        let summary: AddressTx = BcTxRef {
            tx_hash: "abc".into(),
            block_height: -1,
            value: 12_000,
            spent: true,
            confirmations: 0,
        }
        .into();
        assert_eq!(summary.block_height, None);
        assert_eq!(summary.value_sats, 12_000);
        assert!(summary.spent);
    }

    #[test]
    fn test_haskoin_address_tx_sums_outputs() {
        let summary: AddressTx = HkTx {
            txid: "def".into(),
            block: Some(HkBlock { height: 840000 }),
            outputs: vec![
                HkOutput {
                    address: Some("a".into()),
                    pkscript: "76a914".into(),
                    value: 4_000,
                    spender: None,
                },
                HkOutput {
                    address: Some("b".into()),
                    pkscript: "76a914".into(),
                    value: 1_000,
                    spender: Some(HkSpender { txid: "ghi".into() }),
                },
            ],
        }
        .into();
        assert_eq!(summary.value_sats, 5_000);
        assert!(summary.spent);
        assert_eq!(summary.block_height, Some(840000));
    }

    #[test]
    fn test_output_lookup_by_address() {
        let tx = ChainTx {
            hash: "abc".into(),
            block_height: None,
            confirmations: 0,
            outputs: vec![
                ChainTxOutput {
                    addresses: vec!["recipient".into()],
                    script: "aa".into(),
                    value_sats: 100,
                    spent_by: None,
                },
                ChainTxOutput {
                    addresses: vec!["change".into()],
                    script: "bb".into(),
                    value_sats: 50,
                    spent_by: None,
                },
            ],
        };
        let (index, out) = tx.output_to("change").unwrap();
        assert_eq!(index, 1);
        assert_eq!(out.value_sats, 50);
        assert!(tx.output_to("missing").is_none());
    }

    #[test]
    fn test_haskoin_refuses_non_btc() {
        let config = Config::default();
        let err = HaskoinBackend::new("DOGE", &config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_blockcypher_token_appended() {
        let mut config = Config::default();
        config.utxo.blockcypher_token = "tok".into();
        let backend = BlockCypherBackend::new("BTC", &config).unwrap();
        let url = backend.url("/txs/abc?includeHex=true");
        assert!(url.ends_with("&token=tok"));
        let url = backend.url("/txs/abc");
        assert!(url.ends_with("?token=tok"));
    }
}
