//! External collaborator interfaces: transaction store, wallet store,
//! key vault and notification hook.
//!
//! The engine never talks to a database or secret manager directly; it is
//! handed implementations of these traits. The in-memory implementations
//! below back the test suite and the demo binary, and they enforce the
//! two invariants the engine relies on: wallet balance and request status
//! mutate in one atomic unit, and a UTXO flips unspent -> spent exactly
//! once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{
    CustodialWallet, MasterWallet, NotifyKind, PrivateLedgerEntry, RequestStatus, Utxo,
    UtxoStatus, Wallet, WalletKeyData, WithdrawalRequest,
};

/// Fields a status transition may touch
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub status: Option<RequestStatus>,
    pub reference_id: Option<String>,
    pub description: Option<String>,
}

/// Pending-withdrawal queue and status transitions
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// All PENDING withdrawal requests for one chain
    async fn find_pending_withdrawals(&self, chain: &str) -> Result<Vec<WithdrawalRequest>>;

    async fn get_transaction(&self, id: &str) -> Result<Option<WithdrawalRequest>>;

    async fn update_transaction(&self, id: &str, patch: TransactionPatch) -> Result<()>;

    /// Mark COMPLETED with the on-chain reference, atomically with any
    /// bookkeeping the implementation keeps alongside the request.
    async fn complete_request(&self, id: &str, reference_id: &str, description: &str)
        -> Result<()>;

    /// Fail the request and credit `amount + fee` back to the originating
    /// wallet in one atomic unit. Returns false when the request was no
    /// longer PENDING (refund already happened); the caller must not try
    /// again.
    async fn fail_and_refund(&self, id: &str, description: &str) -> Result<bool>;
}

/// Direction of a balance mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Add,
    Subtract,
}

/// Wallets, key material records, custodial pool, UTXO set and the
/// private ledger
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_wallet(&self, id: &str) -> Result<Wallet>;

    async fn get_wallet_by_user_and_currency(
        &self,
        user_id: &str,
        currency: &str,
    ) -> Result<Wallet>;

    /// Atomic balance mutation; Subtract below zero is rejected
    async fn update_wallet_balance(
        &self,
        wallet_id: &str,
        chain: &str,
        amount: f64,
        direction: Direction,
    ) -> Result<()>;

    /// Encrypted key record for one (wallet, chain) pair
    async fn get_wallet_key_data(&self, wallet_id: &str, chain: &str)
        -> Result<WalletKeyData>;

    /// Another wallet on the same (currency, chain) whose recorded balance
    /// covers `min_balance`; used for alternate-wallet funding.
    async fn find_alternative_wallet_key(
        &self,
        currency: &str,
        chain: &str,
        min_balance: f64,
        exclude_wallet_id: &str,
    ) -> Result<Option<WalletKeyData>>;

    async fn decrement_wallet_key_balance(
        &self,
        wallet_id: &str,
        chain: &str,
        amount: f64,
    ) -> Result<()>;

    async fn get_master_wallet(&self, chain: &str) -> Result<MasterWallet>;

    async fn get_active_custodial_wallets(&self, chain: &str) -> Result<Vec<CustodialWallet>>;

    /// All unspent outputs for a chain, largest first
    async fn list_unspent(&self, chain: &str) -> Result<Vec<Utxo>>;

    /// Claim-at-flip guard: flips every listed UTXO unspent -> spent, and
    /// fails the whole batch if any of them was already spent.
    async fn mark_utxos_spent(&self, ids: &[String]) -> Result<()>;

    async fn insert_utxo(&self, utxo: Utxo) -> Result<()>;

    async fn get_ledger_entry(
        &self,
        wallet_id: &str,
        index: u32,
        currency: &str,
        chain: &str,
    ) -> Result<Option<PrivateLedgerEntry>>;

    /// Upsert: increments `offchain_difference` by `delta` on an existing
    /// entry, otherwise creates one holding `delta`.
    async fn upsert_ledger_entry(
        &self,
        wallet_id: &str,
        index: u32,
        currency: &str,
        chain: &str,
        network: &str,
        delta: f64,
    ) -> Result<()>;
}

/// Decrypted key material
#[derive(Clone, serde::Deserialize)]
pub struct DecryptedKey {
    pub private_key: String,
}

impl std::fmt::Debug for DecryptedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is never printed
        f.debug_struct("DecryptedKey").finish_non_exhaustive()
    }
}

/// Secret store boundary; the single key-handling audit surface
#[async_trait]
pub trait KeyVault: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> Result<DecryptedKey>;
}

/// User-facing notification hook
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, title: &str, message: &str, kind: NotifyKind);
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    transactions: HashMap<String, WithdrawalRequest>,
    wallets: HashMap<String, Wallet>,
    key_data: Vec<WalletKeyData>,
    master_wallets: HashMap<String, MasterWallet>,
    custodial_wallets: Vec<CustodialWallet>,
    utxos: HashMap<String, Utxo>,
    ledger: Vec<PrivateLedgerEntry>,
}

/// Process-scoped store backing tests and the demo binary. One mutex over
/// the whole state gives the same atomicity a database transaction would.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_transaction(&self, request: WithdrawalRequest) {
        let mut state = self.state.lock().await;
        state.transactions.insert(request.id.clone(), request);
    }

    pub async fn insert_wallet(&self, wallet: Wallet) {
        let mut state = self.state.lock().await;
        state.wallets.insert(wallet.id.clone(), wallet);
    }

    pub async fn insert_key_data(&self, data: WalletKeyData) {
        let mut state = self.state.lock().await;
        state.key_data.push(data);
    }

    pub async fn insert_master_wallet(&self, wallet: MasterWallet) {
        let mut state = self.state.lock().await;
        state.master_wallets.insert(wallet.chain.clone(), wallet);
    }

    pub async fn insert_custodial_wallet(&self, wallet: CustodialWallet) {
        let mut state = self.state.lock().await;
        state.custodial_wallets.push(wallet);
    }

    pub async fn seed_utxo(&self, utxo: Utxo) {
        let mut state = self.state.lock().await;
        state.utxos.insert(utxo.id.clone(), utxo);
    }

    pub async fn utxo(&self, id: &str) -> Option<Utxo> {
        let state = self.state.lock().await;
        state.utxos.get(id).cloned()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn find_pending_withdrawals(&self, chain: &str) -> Result<Vec<WithdrawalRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.status == RequestStatus::Pending && t.chain == chain)
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<WithdrawalRequest>> {
        let state = self.state.lock().await;
        Ok(state.transactions.get(id).cloned())
    }

    async fn update_transaction(&self, id: &str, patch: TransactionPatch) -> Result<()> {
        let mut state = self.state.lock().await;
        let tx = state
            .transactions
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("transaction not found: {id}")))?;
        if let Some(status) = patch.status {
            tx.status = status;
        }
        if let Some(reference_id) = patch.reference_id {
            tx.reference_id = Some(reference_id);
        }
        if let Some(description) = patch.description {
            tx.description = Some(description);
        }
        Ok(())
    }

    async fn complete_request(
        &self,
        id: &str,
        reference_id: &str,
        description: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let tx = state
            .transactions
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("transaction not found: {id}")))?;
        tx.status = RequestStatus::Completed;
        tx.reference_id = Some(reference_id.to_string());
        tx.description = Some(description.to_string());
        Ok(())
    }

    async fn fail_and_refund(&self, id: &str, description: &str) -> Result<bool> {
        let mut state = self.state.lock().await;

        let (wallet_id, chain, refund) = {
            let tx = state
                .transactions
                .get_mut(id)
                .ok_or_else(|| Error::Store(format!("transaction not found: {id}")))?;
            // Status guard: refund happens exactly once
            if tx.status != RequestStatus::Pending {
                return Ok(false);
            }
            tx.status = RequestStatus::Failed;
            tx.description = Some(description.to_string());
            (tx.wallet_id.clone(), tx.chain.clone(), tx.total_debit())
        };

        let wallet = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| Error::WalletNotFound(wallet_id.clone()))?;
        wallet.balance = round_units(wallet.balance + refund);
        if let Some(entry) = wallet.addresses.get_mut(&chain) {
            entry.balance = round_units(entry.balance + refund);
        }
        Ok(true)
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn get_wallet(&self, id: &str) -> Result<Wallet> {
        let state = self.state.lock().await;
        state
            .wallets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WalletNotFound(id.to_string()))
    }

    async fn get_wallet_by_user_and_currency(
        &self,
        user_id: &str,
        currency: &str,
    ) -> Result<Wallet> {
        let state = self.state.lock().await;
        state
            .wallets
            .values()
            .find(|w| w.user_id == user_id && w.currency == currency)
            .cloned()
            .ok_or_else(|| Error::WalletNotFound(format!("{user_id}/{currency}")))
    }

    async fn update_wallet_balance(
        &self,
        wallet_id: &str,
        chain: &str,
        amount: f64,
        direction: Direction,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let wallet = state
            .wallets
            .get_mut(wallet_id)
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;

        let new_balance = match direction {
            Direction::Add => wallet.balance + amount,
            Direction::Subtract => {
                let b = wallet.balance - amount;
                if b < 0.0 {
                    return Err(Error::InsufficientFunds {
                        available: wallet.balance,
                        required: amount,
                    });
                }
                b
            }
        };
        wallet.balance = round_units(new_balance);

        if let Some(entry) = wallet.addresses.get_mut(chain) {
            entry.balance = round_units(match direction {
                Direction::Add => entry.balance + amount,
                Direction::Subtract => entry.balance - amount,
            });
        }
        Ok(())
    }

    async fn get_wallet_key_data(
        &self,
        wallet_id: &str,
        chain: &str,
    ) -> Result<WalletKeyData> {
        let state = self.state.lock().await;
        state
            .key_data
            .iter()
            .find(|d| d.wallet_id == wallet_id && d.chain == chain)
            .cloned()
            .ok_or_else(|| Error::Store(format!("key data not found: {wallet_id}/{chain}")))
    }

    async fn find_alternative_wallet_key(
        &self,
        currency: &str,
        chain: &str,
        min_balance: f64,
        exclude_wallet_id: &str,
    ) -> Result<Option<WalletKeyData>> {
        let state = self.state.lock().await;
        Ok(state
            .key_data
            .iter()
            .find(|d| {
                d.currency == currency
                    && d.chain == chain
                    && d.wallet_id != exclude_wallet_id
                    && d.balance >= min_balance
            })
            .cloned())
    }

    async fn decrement_wallet_key_balance(
        &self,
        wallet_id: &str,
        chain: &str,
        amount: f64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .key_data
            .iter_mut()
            .find(|d| d.wallet_id == wallet_id && d.chain == chain)
            .ok_or_else(|| Error::Store(format!("key data not found: {wallet_id}/{chain}")))?;
        entry.balance = round_units(entry.balance - amount);
        Ok(())
    }

    async fn get_master_wallet(&self, chain: &str) -> Result<MasterWallet> {
        let state = self.state.lock().await;
        state
            .master_wallets
            .get(chain)
            .cloned()
            .ok_or_else(|| Error::Config(format!("master wallet not found for {chain}")))
    }

    async fn get_active_custodial_wallets(&self, chain: &str) -> Result<Vec<CustodialWallet>> {
        let state = self.state.lock().await;
        Ok(state
            .custodial_wallets
            .iter()
            .filter(|w| w.chain == chain && w.active)
            .cloned()
            .collect())
    }

    async fn list_unspent(&self, chain: &str) -> Result<Vec<Utxo>> {
        let state = self.state.lock().await;
        let mut utxos: Vec<Utxo> = state
            .utxos
            .values()
            .filter(|u| u.status == UtxoStatus::Unspent)
            .filter(|u| {
                state
                    .key_data
                    .iter()
                    .any(|d| d.wallet_id == u.wallet_id && d.chain == chain)
            })
            .cloned()
            .collect();
        // Largest-first minimizes input count
        utxos.sort_by(|a, b| b.amount.cmp(&a.amount));
        Ok(utxos)
    }

    async fn mark_utxos_spent(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        // Validate the whole claim before flipping anything
        for id in ids {
            match state.utxos.get(id) {
                Some(u) if u.status == UtxoStatus::Unspent => {}
                Some(_) => {
                    return Err(Error::Store(format!("utxo already spent: {id}")));
                }
                None => return Err(Error::Store(format!("utxo not found: {id}"))),
            }
        }
        for id in ids {
            if let Some(u) = state.utxos.get_mut(id) {
                u.status = UtxoStatus::Spent;
            }
        }
        Ok(())
    }

    async fn insert_utxo(&self, utxo: Utxo) -> Result<()> {
        let mut state = self.state.lock().await;
        state.utxos.insert(utxo.id.clone(), utxo);
        Ok(())
    }

    async fn get_ledger_entry(
        &self,
        wallet_id: &str,
        index: u32,
        currency: &str,
        chain: &str,
    ) -> Result<Option<PrivateLedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .find(|e| {
                e.wallet_id == wallet_id
                    && e.index == index
                    && e.currency == currency
                    && e.chain == chain
            })
            .cloned())
    }

    async fn upsert_ledger_entry(
        &self,
        wallet_id: &str,
        index: u32,
        currency: &str,
        chain: &str,
        network: &str,
        delta: f64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.ledger.iter_mut().find(|e| {
            e.wallet_id == wallet_id
                && e.index == index
                && e.currency == currency
                && e.chain == chain
                && e.network == network
        }) {
            entry.offchain_difference = round_units(entry.offchain_difference + delta);
        } else {
            state.ledger.push(PrivateLedgerEntry {
                wallet_id: wallet_id.to_string(),
                index,
                currency: currency.to_string(),
                chain: chain.to_string(),
                network: network.to_string(),
                offchain_difference: delta,
            });
        }
        Ok(())
    }
}

/// Key vault whose ciphertexts are the decrypted payload itself.
/// Stands in for the platform secret store in tests and demos.
#[derive(Clone, Default)]
pub struct PlainKeyVault;

#[async_trait]
impl KeyVault for PlainKeyVault {
    async fn decrypt(&self, ciphertext: &str) -> Result<DecryptedKey> {
        serde_json::from_str(ciphertext)
            .map_err(|e| Error::Decryption(format!("malformed key payload: {e}")))
    }
}

/// Notifier that only logs; delivery is someone else's job
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, title: &str, message: &str, kind: NotifyKind) {
        info!(user_id, title, message, ?kind, "user notification");
    }
}

/// Balances are kept to 8 decimal places, the finest precision any
/// supported chain uses off-chain.
fn round_units(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pending_request(id: &str, wallet_id: &str, amount: f64, fee: f64) -> WithdrawalRequest {
        WithdrawalRequest {
            id: id.into(),
            user_id: "u1".into(),
            wallet_id: wallet_id.into(),
            currency: "BTC".into(),
            chain: "BTC".into(),
            amount,
            fee,
            to_address: "1BoatSLRHtKNngkdXEeobR76b53LETtpyT".into(),
            status: RequestStatus::Pending,
            reference_id: None,
            description: None,
            created_at: Utc::now(),
        }
    }

    fn wallet(id: &str, balance: f64) -> Wallet {
        let mut addresses = HashMap::new();
        addresses.insert(
            "BTC".to_string(),
            crate::model::ChainAddress {
                address: "1BoatSLRHtKNngkdXEeobR76b53LETtpyT".into(),
                balance,
            },
        );
        Wallet {
            id: id.into(),
            user_id: "u1".into(),
            currency: "BTC".into(),
            balance,
            addresses,
        }
    }

    fn utxo(id: &str, amount: u64) -> Utxo {
        Utxo {
            id: id.into(),
            wallet_id: "w1".into(),
            transaction_id: format!("tx-{id}"),
            index: 0,
            amount,
            script: "76a914...88ac".into(),
            status: UtxoStatus::Unspent,
        }
    }

    #[tokio::test]
    async fn test_refund_happens_exactly_once() {
        let store = MemoryStore::new();
        store.insert_wallet(wallet("w1", 1.0)).await;
        store
            .insert_transaction(pending_request("r1", "w1", 0.5, 0.001))
            .await;

        assert!(store.fail_and_refund("r1", "broadcast failed").await.unwrap());
        let w = store.get_wallet("w1").await.unwrap();
        assert!((w.balance - 1.501).abs() < 1e-9);

        // Second attempt is rejected by the status guard
        assert!(!store.fail_and_refund("r1", "again").await.unwrap());
        let w = store.get_wallet("w1").await.unwrap();
        assert!((w.balance - 1.501).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_balance_and_status_mutate_atomically() {
        let store = MemoryStore::new();
        store.insert_wallet(wallet("w1", 1.0)).await;
        store
            .insert_transaction(pending_request("r1", "w1", 0.5, 0.0))
            .await;

        store.fail_and_refund("r1", "failed").await.unwrap();
        let tx = store.get_transaction("r1").await.unwrap().unwrap();
        let w = store.get_wallet("w1").await.unwrap();
        assert_eq!(tx.status, RequestStatus::Failed);
        assert!((w.balance - 1.5).abs() < 1e-9);
        // Chain sub-balance credited too
        assert!((w.addresses["BTC"].balance - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_subtract_below_zero_rejected() {
        let store = MemoryStore::new();
        store.insert_wallet(wallet("w1", 0.3)).await;
        let err = store
            .update_wallet_balance("w1", "BTC", 0.5, Direction::Subtract)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        // Balance untouched on rejection
        let w = store.get_wallet("w1").await.unwrap();
        assert!((w.balance - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_list_unspent_largest_first() {
        let store = MemoryStore::new();
        store
            .insert_key_data(WalletKeyData {
                wallet_id: "w1".into(),
                currency: "BTC".into(),
                chain: "BTC".into(),
                index: 0,
                balance: 1.0,
                encrypted_data: "{}".into(),
            })
            .await;
        store.seed_utxo(utxo("a", 10_000_000)).await;
        store.seed_utxo(utxo("b", 50_000_000)).await;
        store.seed_utxo(utxo("c", 30_000_000)).await;

        let unspent = store.list_unspent("BTC").await.unwrap();
        let amounts: Vec<u64> = unspent.iter().map(|u| u.amount).collect();
        assert_eq!(amounts, vec![50_000_000, 30_000_000, 10_000_000]);
    }

    #[tokio::test]
    async fn test_utxo_spent_flip_is_exactly_once() {
        let store = MemoryStore::new();
        store.seed_utxo(utxo("a", 100)).await;
        store.seed_utxo(utxo("b", 200)).await;

        store
            .mark_utxos_spent(&["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(store.utxo("a").await.unwrap().status, UtxoStatus::Spent);

        // A second claim on an already spent output fails the whole batch
        store.seed_utxo(utxo("c", 300)).await;
        let err = store
            .mark_utxos_spent(&["c".into(), "a".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        // And leaves the untouched member unspent
        assert_eq!(store.utxo("c").await.unwrap().status, UtxoStatus::Unspent);
    }

    #[tokio::test]
    async fn test_alternative_wallet_needs_covering_balance() {
        let key = |wallet_id: &str, balance: f64| WalletKeyData {
            wallet_id: wallet_id.into(),
            currency: "USDT".into(),
            chain: "ETH".into(),
            index: 0,
            balance,
            encrypted_data: "{}".into(),
        };
        let store = MemoryStore::new();
        store.insert_key_data(key("w1", 0.5)).await;
        store.insert_key_data(key("w2", 3.0)).await;
        store.insert_key_data(key("w3", 80.0)).await;

        // The requesting wallet is never its own fallback
        let alt = store
            .find_alternative_wallet_key("USDT", "ETH", 50.0, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alt.wallet_id, "w3");

        assert!(store
            .find_alternative_wallet_key("USDT", "ETH", 500.0, "w1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_alternative_wallet_key("USDT", "BSC", 1.0, "w1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ledger_upsert_increments_existing() {
        let store = MemoryStore::new();
        store
            .upsert_ledger_entry("w1", 0, "USDT", "ETH", "mainnet", 25.0)
            .await
            .unwrap();
        store
            .upsert_ledger_entry("w1", 0, "USDT", "ETH", "mainnet", -10.0)
            .await
            .unwrap();

        let entry = store
            .get_ledger_entry("w1", 0, "USDT", "ETH")
            .await
            .unwrap()
            .unwrap();
        assert!((entry.offchain_difference - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_plain_vault_rejects_garbage() {
        let vault = PlainKeyVault;
        assert!(vault.decrypt("not-json").await.is_err());
        let key = vault
            .decrypt(r#"{"private_key":"L1aW4aubDFB7yfras2S1mN3bqg9nwySY8nkoLmJebSLD5BWv3ENZ"}"#)
            .await
            .unwrap();
        assert!(!key.private_key.is_empty());
    }
}
