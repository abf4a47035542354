//! Core data model: withdrawal requests, wallets, UTXOs and the private ledger.
//!
//! Everything here is a plain serde type; persistence lives behind the
//! store traits in [`crate::store`]. Requests and UTXOs are never deleted,
//! they only transition status (audit trail).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a withdrawal request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// A user withdrawal accepted by the platform, awaiting on-chain settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub currency: String,
    pub chain: String,
    /// Amount in standard units (e.g. whole BTC, whole tokens)
    pub amount: f64,
    /// Flat platform fee in standard units, charged on top of `amount`
    pub fee: f64,
    pub to_address: String,
    pub status: RequestStatus,
    /// On-chain transaction id once settled
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    /// Total the originating wallet must cover: amount plus platform fee
    pub fn total_debit(&self) -> f64 {
        self.amount + self.fee
    }
}

/// Per-chain address entry inside a wallet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainAddress {
    pub address: String,
    /// Sub-balance attributed to this chain, standard units
    pub balance: f64,
}

/// Off-chain authoritative wallet record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    pub currency: String,
    /// Authoritative off-chain balance, standard units
    pub balance: f64,
    /// Per-chain deposit address and sub-balance
    pub addresses: HashMap<String, ChainAddress>,
}

impl Wallet {
    pub fn chain_address(&self, chain: &str) -> Option<&ChainAddress> {
        self.addresses.get(chain)
    }
}

/// Hot-wallet key material tied to one (wallet, chain) pair.
/// `encrypted_data` holds a ciphertext the key vault can open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletKeyData {
    pub wallet_id: String,
    pub currency: String,
    pub chain: String,
    pub index: u32,
    pub balance: f64,
    pub encrypted_data: String,
}

/// Platform-deployed contract wallet holding pooled EVM balances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodialWallet {
    pub id: String,
    pub chain: String,
    pub address: String,
    pub active: bool,
}

/// Gas payer and primary funds source for a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterWallet {
    pub chain: String,
    pub address: String,
    pub encrypted_data: String,
}

/// Spend state of a tracked unspent output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtxoStatus {
    Unspent,
    Spent,
}

/// A tracked unspent transaction output. Flips unspent -> spent exactly
/// once, only after its consuming broadcast is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub id: String,
    pub wallet_id: String,
    pub transaction_id: String,
    pub index: u32,
    /// Value in satoshis
    pub amount: u64,
    pub script: String,
    pub status: UtxoStatus,
}

/// Bridges settlement latency when one wallet lends funds to another.
/// `offchain_difference` is the gap between the recorded balance and the
/// true spendable balance for this (wallet, chain) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateLedgerEntry {
    pub wallet_id: String,
    pub index: u32,
    pub currency: String,
    pub chain: String,
    pub network: String,
    pub offchain_difference: f64,
}

/// Notification severity forwarded to the user-facing hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Success,
    Failure,
}
