//! Permit-token withdrawals (EIP-2612).
//!
//! The user's deposit wallet never holds gas. Its key signs an off-chain
//! EIP-712 permit approving the master wallet as spender, and the master
//! wallet submits both the `permit()` and the following `transferFrom()`,
//! paying gas for both.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol_types::{eip712_domain, SolCall, SolStruct};
use tracing::info;

use crate::chains::timestamp_secs;
use crate::config::Config;
use crate::contracts::{IERC20Permit, Permit};
use crate::error::{Error, Result};
use crate::evm::{confirm, send_call, to_base_units};
use crate::gas;
use crate::provider::EvmClient;

/// Seconds a signed permit stays valid. Long enough to cover both
/// transactions even under confirmation delays.
const PERMIT_VALIDITY_SECS: u64 = 4200;

/// v, r, s components as `permit()` expects them
pub struct PermitSignature {
    pub v: u8,
    pub r: B256,
    pub s: B256,
    pub deadline: U256,
}

/// Sign the EIP-712 permit payload with the owner key and verify the
/// signature recovers to the owner before it goes anywhere near a node.
pub async fn sign_permit(
    owner_signer: &PrivateKeySigner,
    token_name: &str,
    chain_id: u64,
    token: Address,
    spender: Address,
    value: U256,
    nonce: U256,
    deadline: U256,
) -> Result<PermitSignature> {
    let owner = owner_signer.address();
    let domain = eip712_domain! {
        name: token_name.to_string(),
        version: "1",
        chain_id: chain_id,
        verifying_contract: token,
    };
    let permit = Permit {
        owner,
        spender,
        value,
        nonce,
        deadline,
    };
    let digest = permit.eip712_signing_hash(&domain);

    let signature = owner_signer
        .sign_hash(&digest)
        .await
        .map_err(|e| Error::Internal(format!("permit signing failed: {e}")))?;

    verify_recovered_owner(&signature, &digest, owner)?;

    Ok(PermitSignature {
        v: 27 + signature.v() as u8,
        r: B256::from(signature.r()),
        s: B256::from(signature.s()),
        deadline,
    })
}

/// Reject a signature that does not recover to the expected owner.
/// Nothing downstream may broadcast on a mismatch.
fn verify_recovered_owner(
    signature: &alloy::primitives::Signature,
    digest: &B256,
    owner: Address,
) -> Result<()> {
    let recovered = signature
        .recover_address_from_prehash(digest)
        .map_err(|e| Error::Internal(format!("permit recovery failed: {e}")))?;
    if recovered != owner {
        return Err(Error::SignatureMismatch {
            recovered: recovered.to_string(),
            expected: owner.to_string(),
        });
    }
    Ok(())
}

/// Execute a permit-token withdrawal. Returns the `transferFrom` hash,
/// which is what lands on the user's statement.
pub async fn execute(
    client: &EvmClient,
    config: &Config,
    token: Address,
    decimals: u8,
    owner_signer: &PrivateKeySigner,
    payer_signer: &PrivateKeySigner,
    recipient: Address,
    amount: f64,
) -> Result<TxHash> {
    let owner = owner_signer.address();
    let spender = payer_signer.address();
    let value = to_base_units(amount, decimals)?;

    // Owner must actually hold the tokens before we spend gas
    let balance = token_balance(client, token, owner).await?;
    if balance < value {
        return Err(Error::InsufficientFunds {
            available: base_units_to_f64(balance, decimals),
            required: amount,
        });
    }

    let token_name = read_token_name(client, token).await?;
    let nonce = read_nonce(client, token, owner).await?;
    let deadline = U256::from(timestamp_secs() + PERMIT_VALIDITY_SECS);

    let sig = sign_permit(
        owner_signer,
        &token_name,
        client.chain_id(),
        token,
        spender,
        value,
        nonce,
        deadline,
    )
    .await?;

    let permit_calldata = Bytes::from(
        IERC20Permit::permitCall {
            owner,
            spender,
            value,
            deadline,
            v: sig.v,
            r: sig.r,
            s: sig.s,
        }
        .abi_encode(),
    );

    // The payer fronts gas for two transactions; require the full reserve
    // up front so the flow cannot strand a consumed permit nonce.
    let gas_price = gas::adjusted_gas_price(client, config).await?;
    let permit_gas = gas::estimate_gas(
        client,
        alloy::rpc::types::TransactionRequest::default()
            .with_from(spender)
            .with_to(token)
            .with_input(permit_calldata.clone()),
    )
    .await?;
    let payer_balance = client.get_balance(spender).await?;
    gas::check_gas_reserve(payer_balance, permit_gas, gas_price)?;

    let permit_hash = send_call(client, payer_signer, token, permit_calldata, U256::ZERO, config).await?;
    confirm::wait_for_confirmation(client, permit_hash, config).await?;
    info!(chain = %client.chain(), %permit_hash, %owner, "permit confirmed");

    let transfer_calldata = Bytes::from(
        IERC20Permit::transferFromCall {
            from: owner,
            to: recipient,
            amount: value,
        }
        .abi_encode(),
    );
    let transfer_hash =
        send_call(client, payer_signer, token, transfer_calldata, U256::ZERO, config).await?;
    confirm::wait_for_confirmation(client, transfer_hash, config).await?;
    info!(chain = %client.chain(), %transfer_hash, %recipient, "permit withdrawal settled");

    Ok(transfer_hash)
}

pub(crate) async fn token_balance(
    client: &EvmClient,
    token: Address,
    owner: Address,
) -> Result<U256> {
    let data = Bytes::from(IERC20Permit::balanceOfCall { owner }.abi_encode());
    let raw = client
        .call(
            alloy::rpc::types::TransactionRequest::default()
                .with_to(token)
                .with_input(data),
        )
        .await?;
    IERC20Permit::balanceOfCall::abi_decode_returns(&raw)
        .map_err(|e| Error::Rpc(format!("balanceOf decode: {e}")))
}

async fn read_token_name(client: &EvmClient, token: Address) -> Result<String> {
    let data = Bytes::from(IERC20Permit::nameCall {}.abi_encode());
    let raw = client
        .call(
            alloy::rpc::types::TransactionRequest::default()
                .with_to(token)
                .with_input(data),
        )
        .await?;
    IERC20Permit::nameCall::abi_decode_returns(&raw)
        .map_err(|e| Error::Rpc(format!("name decode: {e}")))
}

async fn read_nonce(client: &EvmClient, token: Address, owner: Address) -> Result<U256> {
    let data = Bytes::from(IERC20Permit::noncesCall { owner }.abi_encode());
    let raw = client
        .call(
            alloy::rpc::types::TransactionRequest::default()
                .with_to(token)
                .with_input(data),
        )
        .await?;
    IERC20Permit::noncesCall::abi_decode_returns(&raw)
        .map_err(|e| Error::Rpc(format!("nonces decode: {e}")))
}

pub(crate) fn base_units_to_f64(value: U256, decimals: u8) -> f64 {
    let divisor = 10f64.powi(decimals as i32);
    let truncated: u128 = value.try_into().unwrap_or(u128::MAX);
    truncated as f64 / divisor
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[tokio::test]
    async fn test_permit_signature_recovers_to_owner() {
        let signer: PrivateKeySigner = TEST_KEY.parse().unwrap();
        let sig = sign_permit(
            &signer,
            "USD Coin",
            1,
            address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
            U256::from(1_000_000u64),
            U256::ZERO,
            U256::from(1_900_000_000u64),
        )
        .await
        .unwrap();
        assert!(sig.v == 27 || sig.v == 28);
    }

    #[tokio::test]
    async fn test_permit_signature_binds_to_token_contract() {
        let signer: PrivateKeySigner = TEST_KEY.parse().unwrap();
        let common = |token| {
            sign_permit(
                &signer,
                "USD Coin",
                1,
                token,
                address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
                U256::from(1u64),
                U256::ZERO,
                U256::from(1_900_000_000u64),
            )
        };
        let a = common(address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"))
            .await
            .unwrap();
        let b = common(address!("dAC17F958D2ee523a2206206994597C13D831ec7"))
            .await
            .unwrap();
        // Different verifying contract must yield a different signature
        assert!(a.r != b.r || a.s != b.s);
    }

    #[tokio::test]
    async fn test_foreign_signature_is_rejected() {
        let signer: PrivateKeySigner = TEST_KEY.parse().unwrap();
        let digest = B256::repeat_byte(0x42);
        let sig = signer.sign_hash(&digest).await.unwrap();
        let stranger = address!("dAC17F958D2ee523a2206206994597C13D831ec7");
        let err = verify_recovered_owner(&sig, &digest, stranger).unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch { .. }));
        assert!(verify_recovered_owner(&sig, &digest, signer.address()).is_ok());
    }

    #[test]
    fn test_base_units_to_f64() {
        let half = base_units_to_f64(U256::from(500_000_000_000_000_000u128), 18);
        assert!((half - 0.5).abs() < 1e-9);
    }
}
