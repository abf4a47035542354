//! UTXO settlement: chain-data backends, the PSBT transaction engine and
//! the deposit-address watcher.

pub mod backend;
pub mod builder;
pub mod watch;

pub use backend::{backend_for, broadcast_backend_for, ChainTx, UtxoBackend};
pub use builder::{plan_transaction, select_utxos, TxPlan, UtxoWithdrawer};
pub use watch::AddressWatcher;
