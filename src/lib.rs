//! Multi-chain withdrawal engine
//!
//! Settles user withdrawal requests on-chain across EVM and UTXO
//! networks. EVM payouts pick a strategy per token (gasless permit
//! transfers, pooled custodial contract wallets, or plain native sends);
//! UTXO payouts build, sign and broadcast P2PKH transactions from a
//! tracked output set. A private ledger keeps wallet books consistent
//! when one wallet's on-chain funds cover another's withdrawal.

pub mod chains;
pub mod config;
pub mod contracts;
pub mod error;
pub mod evm;
pub mod gas;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod store;
pub mod utxo;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
