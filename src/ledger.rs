//! Private ledger: off-chain differences between a wallet's recorded
//! balance and what its on-chain addresses actually hold.
//!
//! Pooled funding (UTXO selection across wallets, alternate-wallet EVM
//! sends) moves coins that belong to one wallet on behalf of another.
//! The ledger records the difference per (wallet, index, currency,
//! chain, network) so the books reconcile without moving funds back.

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Wallet;
use crate::store::WalletStore;

/// Network label recorded on ledger rows for a chain
pub fn ledger_network(chain: &str, config: &Config) -> String {
    config
        .chain_endpoints(chain)
        .map(|ep| ep.network.clone())
        .unwrap_or_else(|| "mainnet".to_string())
}

/// Spendable balance: the wallet's recorded balance plus its off-chain
/// difference on this chain.
pub async fn total_available(
    store: &dyn WalletStore,
    wallet: &Wallet,
    chain: &str,
) -> Result<f64> {
    let key = store.get_wallet_key_data(&wallet.id, chain).await?;
    let entry = store
        .get_ledger_entry(&wallet.id, key.index, &wallet.currency, chain)
        .await?;
    let total = wallet.balance + entry.map(|e| e.offchain_difference).unwrap_or(0.0);
    Ok(round_ledger_units(total, chain))
}

/// Record a funding difference. Positive `delta` means the wallet is
/// owed funds on-chain; negative means it fronted funds for another
/// wallet's withdrawal.
pub async fn update_private_ledger(
    store: &dyn WalletStore,
    wallet_id: &str,
    index: u32,
    currency: &str,
    chain: &str,
    delta: f64,
    config: &Config,
) -> Result<()> {
    if delta == 0.0 {
        return Ok(());
    }
    if !delta.is_finite() {
        return Err(Error::Internal(format!("non-finite ledger delta: {delta}")));
    }
    let network = ledger_network(chain, config);
    debug!(wallet_id, index, currency, chain, %network, delta, "ledger upsert");
    store
        .upsert_ledger_entry(wallet_id, index, currency, chain, &network, delta)
        .await
}

fn round_ledger_units(value: f64, chain: &str) -> f64 {
    // UTXO chains settle at 8 decimal places
    if crate::chains::is_utxo_chain(chain) {
        (value * 1e8).round() / 1e8
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainAddress, WalletKeyData};
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn seed_wallet() -> Wallet {
        let mut addresses = HashMap::new();
        addresses.insert(
            "BTC".to_string(),
            ChainAddress {
                address: "1BoatSLRHtKNngkdXEeobR76b53LETtpyT".into(),
                balance: 1.0,
            },
        );
        Wallet {
            id: "w1".into(),
            user_id: "u1".into(),
            currency: "BTC".into(),
            balance: 1.0,
            addresses,
        }
    }

    async fn seed_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_wallet(seed_wallet()).await;
        store
            .insert_key_data(WalletKeyData {
                wallet_id: "w1".into(),
                currency: "BTC".into(),
                chain: "BTC".into(),
                index: 3,
                balance: 1.0,
                encrypted_data: "{}".into(),
            })
            .await;
        store
    }

    #[tokio::test]
    async fn test_total_available_includes_offchain_difference() {
        let store = seed_store().await;
        let config = Config::default();
        let wallet = seed_wallet();

        let base = total_available(&store, &wallet, "BTC").await.unwrap();
        assert!((base - 1.0).abs() < 1e-9);

        update_private_ledger(&store, "w1", 3, "BTC", "BTC", 0.25, &config)
            .await
            .unwrap();
        let with_credit = total_available(&store, &wallet, "BTC").await.unwrap();
        assert!((with_credit - 1.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_deltas_accumulate_on_one_row() {
        let store = seed_store().await;
        let config = Config::default();

        update_private_ledger(&store, "w1", 3, "BTC", "BTC", -0.5, &config)
            .await
            .unwrap();
        update_private_ledger(&store, "w1", 3, "BTC", "BTC", 0.2, &config)
            .await
            .unwrap();

        let entry = store
            .get_ledger_entry("w1", 3, "BTC", "BTC")
            .await
            .unwrap()
            .unwrap();
        assert!((entry.offchain_difference - (-0.3)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_delta_writes_nothing() {
        let store = seed_store().await;
        let config = Config::default();
        update_private_ledger(&store, "w1", 3, "BTC", "BTC", 0.0, &config)
            .await
            .unwrap();
        assert!(store
            .get_ledger_entry("w1", 3, "BTC", "BTC")
            .await
            .unwrap()
            .is_none());
    }
}
