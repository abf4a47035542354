//! Deposit-address watching over the BlockCypher websocket feed.
//!
//! One socket per watched address. The subscription asks for
//! unconfirmed-tx events and tears the socket down after the first
//! matching transaction, so a watch is single-shot; callers re-arm it if
//! they want the next deposit too.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// First unconfirmed transaction seen for a watched address
#[derive(Debug, Clone, Deserialize)]
pub struct UnconfirmedTx {
    pub hash: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub total: u64,
}

pub type WatchCallback = Arc<dyn Fn(UnconfirmedTx) + Send + Sync>;

/// Registry of live address watches, keyed by `chain_address`
#[derive(Default)]
pub struct AddressWatcher {
    sockets: Arc<DashMap<String, JoinHandle<()>>>,
}

impl AddressWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured websocket endpoint when the chain has one, otherwise
    /// the public BlockCypher socket.
    fn socket_url(chain: &str, config: &Config) -> String {
        if let Ok(url) = crate::provider::wss_url(chain, config) {
            return url;
        }
        let network = match chain {
            "BTC" if config.utxo.btc_testnet => "test3",
            _ => "main",
        };
        format!(
            "wss://socket.blockcypher.com/v1/{}/{}?token={}",
            chain.to_lowercase(),
            network,
            config.utxo.blockcypher_token
        )
    }

    /// Start watching `address`; the callback fires once, on the first
    /// unconfirmed transaction, then the socket closes itself.
    pub fn watch(
        &self,
        chain: &str,
        address: &str,
        config: &Config,
        callback: WatchCallback,
    ) -> Result<()> {
        let key = watch_key(chain, address);
        // Entries whose task already ended must not block a re-arm
        self.sockets.retain(|_, handle| !handle.is_finished());
        if self.sockets.contains_key(&key) {
            debug!(chain, address, "watch already active");
            return Ok(());
        }

        let url = Self::socket_url(chain, config);
        let chain = chain.to_string();
        let address = address.to_string();
        let sockets = Arc::clone(&self.sockets);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = run_watch(&url, &chain, &address, callback).await {
                error!(chain, address, error = %e, "address watch ended with error");
            }
            // The socket is gone either way; free the registry slot
            sockets.remove(&task_key);
        });
        self.sockets.insert(key, handle);
        Ok(())
    }

    /// Tear down the watch for one address, if any
    pub fn cancel(&self, chain: &str, address: &str) {
        if let Some((_, handle)) = self.sockets.remove(&watch_key(chain, address)) {
            handle.abort();
            info!(chain, address, "address watch cancelled");
        } else {
            debug!(chain, address, "no active watch to cancel");
        }
    }

    pub fn active_watches(&self) -> usize {
        self.sockets.retain(|_, handle| !handle.is_finished());
        self.sockets.len()
    }
}

fn watch_key(chain: &str, address: &str) -> String {
    format!("{chain}_{address}")
}

async fn run_watch(
    url: &str,
    chain: &str,
    address: &str,
    callback: WatchCallback,
) -> Result<()> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| Error::Rpc(format!("blockcypher socket: {e}")))?;
    info!(chain, address, "address watch connected");

    let (mut write, mut read) = ws_stream.split();
    let subscribe = serde_json::json!({ "event": "unconfirmed-tx", "address": address });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| Error::Rpc(format!("blockcypher subscribe: {e}")))?;

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<UnconfirmedTx>(&text) {
                    Ok(tx) if !tx.hash.is_empty() => {
                        info!(chain, address, hash = %tx.hash, "unconfirmed deposit seen");
                        callback(tx);
                        // Single-shot: first match closes the socket
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    Ok(_) => debug!(chain, address, "socket message without hash"),
                    Err(e) => debug!(chain, address, error = %e, "unparseable socket message"),
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = write.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => {
                warn!(chain, address, "socket closed by server before a match");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Rpc(format!("blockcypher socket: {e}"))),
        }
    }
    Ok(())
}
