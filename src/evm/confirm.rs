//! Bounded confirmation waits for EVM transactions.

use std::time::Duration;

use alloy::primitives::TxHash;
use tokio::time::{interval, timeout};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::EvmClient;

/// Poll for the receipt until the required confirmation depth is reached.
///
/// Returns the inclusion block number. A reverted transaction fails the
/// withdrawal; an expired wait returns [`Error::ConfirmationTimeout`] and
/// leaves the request for the next scheduler pass.
pub async fn wait_for_confirmation(
    client: &EvmClient,
    tx_hash: TxHash,
    config: &Config,
) -> Result<u64> {
    let required = config.evm.confirmations as u64;
    let timeout_secs = config.evm.confirmation_timeout_secs;
    let poll_interval = Duration::from_millis(config.evm.receipt_poll_interval_ms);

    let result = timeout(Duration::from_secs(timeout_secs), async {
        let mut ticker = interval(poll_interval);
        loop {
            ticker.tick().await;

            let receipt = match client.get_transaction_receipt(tx_hash).await? {
                Some(r) => r,
                None => {
                    debug!(%tx_hash, "transaction pending");
                    continue;
                }
            };

            if !receipt.status() {
                return Err(Error::Broadcast(format!(
                    "transaction reverted on-chain: {tx_hash}"
                )));
            }

            let current_block = client.get_block_number().await?;
            let tx_block = receipt.block_number.unwrap_or(current_block);
            let confirmations = current_block.saturating_sub(tx_block) + 1;

            if confirmations >= required {
                return Ok(tx_block);
            }

            debug!(
                %tx_hash,
                confirmations,
                required,
                "waiting for confirmations"
            );
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::ConfirmationTimeout(timeout_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainEndpoints;

    #[tokio::test]
    async fn test_unreachable_node_surfaces_rpc_error_not_hang() {
        let mut config = Config::default();
        config.evm.rpc_timeout_secs = 1;
        config.evm.confirmation_timeout_secs = 3;
        config.evm.receipt_poll_interval_ms = 100;
        config.chains.insert(
            "ETH".to_string(),
            ChainEndpoints {
                // Reserved TEST-NET-1 block, nothing listens there
                rpc_url: "http://192.0.2.1:8545".to_string(),
                wss_url: String::new(),
                explorer_api_key: String::new(),
                network: "mainnet".to_string(),
            },
        );

        let client = EvmClient::connect("ETH", &config).unwrap();
        let err = wait_for_confirmation(&client, TxHash::ZERO, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(_)));
    }
}
