//! Custodial-pool withdrawals for tokens without permit support.
//!
//! Deposits for these tokens are swept into per-chain custodial wallet
//! contracts owned by the master wallet. A withdrawal scans the active
//! pool for one contract holding enough balance and spends from it.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use tracing::{debug, info};

use crate::config::Config;
use crate::contracts::{ArtifactStore, ICustodialWallet};
use crate::error::{Error, Result};
use crate::evm::{confirm, send_call};
use crate::model::CustodialWallet;
use crate::provider::{parse_address, EvmClient};

/// What the custodial contract is asked to pay out
#[derive(Debug, Clone, Copy)]
pub enum CustodialAsset {
    Native,
    Token(Address),
}

/// First active pool contract whose balance covers `needed`
pub async fn find_funded_wallet(
    client: &EvmClient,
    pool: &[CustodialWallet],
    asset: CustodialAsset,
    needed: U256,
) -> Result<CustodialWallet> {
    for wallet in pool {
        let contract = parse_address(&wallet.address)?;
        let balance = custodial_balance(client, contract, asset).await?;
        debug!(chain = %client.chain(), contract = %wallet.address, %balance, "custodial balance");
        if balance >= needed {
            return Ok(wallet.clone());
        }
    }
    Err(Error::NoCustodialFunds(client.chain().to_string()))
}

pub async fn custodial_balance(
    client: &EvmClient,
    contract: Address,
    asset: CustodialAsset,
) -> Result<U256> {
    let data = match asset {
        CustodialAsset::Native => {
            Bytes::from(ICustodialWallet::getNativeBalanceCall {}.abi_encode())
        }
        CustodialAsset::Token(token) => {
            Bytes::from(ICustodialWallet::getTokenBalanceCall { token }.abi_encode())
        }
    };
    let raw = client
        .call(
            TransactionRequest::default()
                .with_to(contract)
                .with_input(data),
        )
        .await?;
    let balance = match asset {
        CustodialAsset::Native => {
            ICustodialWallet::getNativeBalanceCall::abi_decode_returns(&raw)
                .map_err(|e| Error::Rpc(format!("getNativeBalance decode: {e}")))?
        }
        CustodialAsset::Token(_) => {
            ICustodialWallet::getTokenBalanceCall::abi_decode_returns(&raw)
                .map_err(|e| Error::Rpc(format!("getTokenBalance decode: {e}")))?
        }
    };
    Ok(balance)
}

/// Pay out `value` base units from the funded pool contract
pub async fn execute(
    client: &EvmClient,
    config: &Config,
    pool: &[CustodialWallet],
    master_signer: &PrivateKeySigner,
    asset: CustodialAsset,
    recipient: Address,
    value: U256,
) -> Result<TxHash> {
    let funded = find_funded_wallet(client, pool, asset, value).await?;
    let contract = parse_address(&funded.address)?;

    let calldata = match asset {
        CustodialAsset::Native => Bytes::from(
            ICustodialWallet::transferNativeCall {
                to: recipient,
                amount: value,
            }
            .abi_encode(),
        ),
        CustodialAsset::Token(token) => Bytes::from(
            ICustodialWallet::transferTokensCall {
                token,
                to: recipient,
                amount: value,
            }
            .abi_encode(),
        ),
    };

    let tx_hash = send_call(client, master_signer, contract, calldata, U256::ZERO, config).await?;
    confirm::wait_for_confirmation(client, tx_hash, config).await?;
    info!(
        chain = %client.chain(),
        %tx_hash,
        contract = %funded.address,
        %recipient,
        "custodial withdrawal settled"
    );
    Ok(tx_hash)
}

/// Deploy a fresh custodial wallet contract and return its address
pub async fn deploy(
    client: &EvmClient,
    config: &Config,
    artifacts: &ArtifactStore,
    master_signer: &PrivateKeySigner,
) -> Result<Address> {
    let artifact = artifacts.load("wallet", "CustodialWallet")?;
    let code = artifact.bytecode.trim_start_matches("0x");
    let bytecode = alloy::primitives::hex::decode(code)
        .map_err(|e| Error::ArtifactNotFound(format!("CustodialWallet bytecode: {e}")))?;

    let gas_price = crate::gas::adjusted_gas_price(client, config).await?;
    let tx = TransactionRequest::default()
        .with_from(master_signer.address())
        .with_deploy_code(Bytes::from(bytecode))
        .with_chain_id(client.chain_id());
    let gas_limit = crate::gas::estimate_gas(client, tx.clone()).await?;
    let tx = tx.with_gas_limit(gas_limit).with_gas_price(gas_price);

    let provider = client.with_signer(master_signer.clone())?;
    let pending = provider
        .send_transaction(tx)
        .await
        .map_err(|e| Error::Broadcast(format!("{}: deploy: {e}", client.chain())))?;
    let tx_hash = *pending.tx_hash();
    confirm::wait_for_confirmation(client, tx_hash, config).await?;

    let receipt = client
        .get_transaction_receipt(tx_hash)
        .await?
        .ok_or_else(|| Error::Rpc(format!("deploy receipt vanished: {tx_hash}")))?;
    let address = receipt
        .contract_address
        .ok_or_else(|| Error::Rpc(format!("deploy produced no contract address: {tx_hash}")))?;
    info!(chain = %client.chain(), %address, %tx_hash, "custodial wallet deployed");
    Ok(address)
}
