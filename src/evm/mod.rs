//! EVM withdrawal strategies.
//!
//! Three send paths share this module: permit tokens (EIP-2612),
//! custodial-pool tokens and native coin transfers. `strategy` picks the
//! path from the token capability table and owns the alternate-wallet
//! fallback; `confirm` bounds every receipt wait.

pub mod confirm;
pub mod custodial;
pub mod native;
pub mod permit;
pub mod strategy;

pub use strategy::{EvmOutcome, EvmWithdrawer};

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gas;
use crate::provider::EvmClient;

/// Estimate, price, sign and broadcast one contract call or value
/// transfer. All three strategies send through here.
pub(crate) async fn send_call(
    client: &EvmClient,
    signer: &PrivateKeySigner,
    to: Address,
    calldata: Bytes,
    value: U256,
    config: &Config,
) -> Result<TxHash> {
    let from = signer.address();
    let gas_price = gas::adjusted_gas_price(client, config).await?;

    let tx = TransactionRequest::default()
        .with_from(from)
        .with_to(to)
        .with_input(calldata)
        .with_value(value)
        .with_chain_id(client.chain_id());
    let gas_limit = gas::estimate_gas(client, tx.clone()).await?;
    let tx = tx.with_gas_limit(gas_limit).with_gas_price(gas_price);

    let provider = client.with_signer(signer.clone())?;
    let pending = provider
        .send_transaction(tx)
        .await
        .map_err(|e| Error::Broadcast(format!("{}: {e}", client.chain())))?;
    let tx_hash = *pending.tx_hash();
    debug!(chain = %client.chain(), %tx_hash, %from, %to, "transaction broadcast");
    Ok(tx_hash)
}

/// Convert a standard-unit amount to base units without going through
/// floating point multiplication at full scale. The amount is rendered
/// at the token's precision first so 18-decimal tokens do not lose
/// low-order digits.
pub fn to_base_units(amount: f64, decimals: u8) -> Result<U256> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(Error::Internal(format!("invalid amount: {amount}")));
    }
    let rendered = format!("{amount:.prec$}", prec = decimals as usize);
    let (whole, frac) = match rendered.split_once('.') {
        Some((w, f)) => (w, f),
        None => (rendered.as_str(), ""),
    };
    let digits = format!("{whole}{frac:0<width$}", width = decimals as usize);
    U256::from_str_radix(digits.trim_start_matches('0'), 10)
        .or_else(|_| if digits.chars().all(|c| c == '0') {
            Ok(U256::ZERO)
        } else {
            Err(Error::Internal(format!("amount out of range: {amount}")))
        })
}
