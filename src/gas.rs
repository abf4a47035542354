//! Gas pricing and estimation for the EVM send paths.

use alloy::primitives::U256;
use alloy::rpc::types::TransactionRequest;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::EvmClient;

/// Network-suggested gas price with the configured safety multiplier
pub async fn adjusted_gas_price(client: &EvmClient, config: &Config) -> Result<u128> {
    let gas_price = client.get_gas_price().await?;
    Ok((gas_price as f64 * config.evm.gas_price_multiplier) as u128)
}

/// Estimate the gas limit for a call. A failing estimate means the call
/// would revert, so this is fatal for the withdrawal rather than retryable.
pub async fn estimate_gas(client: &EvmClient, tx: TransactionRequest) -> Result<u64> {
    client
        .provider()
        .estimate_gas(tx)
        .await
        .map_err(|e| Error::GasEstimation(format!("{}: {e}", client.chain())))
}

/// Reserve the gas payer must hold before a two-transaction permit flow
/// starts. Double the single-transaction cost covers both the permit()
/// and the following transferFrom().
pub fn required_gas_reserve(gas_limit: u64, gas_price: u128) -> U256 {
    U256::from(gas_limit) * U256::from(gas_price) * U256::from(2u8)
}

/// Checks the payer balance against [`required_gas_reserve`]
pub fn check_gas_reserve(balance: U256, gas_limit: u64, gas_price: u128) -> Result<()> {
    let required = required_gas_reserve(gas_limit, gas_price);
    if balance < required {
        return Err(Error::InsufficientGasFunds {
            required: required.try_into().unwrap_or(u128::MAX),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_reserve_doubles_single_tx_cost() {
        let reserve = required_gas_reserve(60_000, 20_000_000_000);
        assert_eq!(reserve, U256::from(60_000u128 * 20_000_000_000 * 2));
    }

    #[test]
    fn test_check_gas_reserve_boundary() {
        let limit = 21_000;
        let price = 1_000_000_000u128;
        let exact = required_gas_reserve(limit, price);
        assert!(check_gas_reserve(exact, limit, price).is_ok());
        let err = check_gas_reserve(exact - U256::from(1u8), limit, price).unwrap_err();
        assert!(matches!(err, Error::InsufficientGasFunds { .. }));
    }
}
