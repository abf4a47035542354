//! Native coin withdrawals: a plain value transfer from a hot wallet.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::signers::local::PrivateKeySigner;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::evm::permit::base_units_to_f64;
use crate::evm::{confirm, send_call, to_base_units};
use crate::provider::EvmClient;

/// Send `amount` native units from the signing wallet to `recipient`.
///
/// The sender must cover value plus gas; the shortfall error carries the
/// standard-unit balance so the caller can try an alternate wallet.
pub async fn execute(
    client: &EvmClient,
    config: &Config,
    sender_signer: &PrivateKeySigner,
    recipient: Address,
    amount: f64,
) -> Result<TxHash> {
    let value = to_base_units(amount, 18)?;
    let sender = sender_signer.address();

    let balance = client.get_balance(sender).await?;
    if balance < value {
        return Err(Error::InsufficientFunds {
            available: base_units_to_f64(balance, 18),
            required: amount,
        });
    }

    let tx_hash = send_call(client, sender_signer, recipient, Bytes::new(), value, config).await?;
    confirm::wait_for_confirmation(client, tx_hash, config).await?;
    info!(chain = %client.chain(), %tx_hash, %recipient, amount, "native withdrawal settled");
    Ok(tx_hash)
}
