//! Strategy selection and the alternate-wallet fallback for EVM
//! withdrawals.
//!
//! The capability table in the token config decides the send path. When
//! the user's own deposit wallet cannot fund a permit or native
//! withdrawal, another hot wallet with sufficient recorded balance steps
//! in and the difference is written to the private ledger by the caller.

use std::sync::Arc;

use alloy::primitives::TxHash;
use alloy::signers::local::PrivateKeySigner;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::chains::TokenCapability;
use crate::config::{Config, TokenConfig};
use crate::error::{Error, Result};
use crate::evm::{custodial, native, permit, to_base_units};
use crate::model::{WalletKeyData, WithdrawalRequest};
use crate::provider::{parse_address, EvmClient};
use crate::store::{KeyVault, WalletStore};

/// Result of a settled EVM withdrawal
#[derive(Debug, Clone)]
pub struct EvmOutcome {
    pub tx_hash: String,
    /// Set when a wallet other than the user's own funded the send
    pub alternative_wallet: Option<WalletKeyData>,
}

/// How a (chain, currency) pair gets paid out
pub fn select_capability(token: Option<&TokenConfig>) -> TokenCapability {
    token
        .map(|t| t.capability)
        .unwrap_or(TokenCapability::Native)
}

pub struct EvmWithdrawer {
    config: Arc<Config>,
    wallets: Arc<dyn WalletStore>,
    vault: Arc<dyn KeyVault>,
    clients: DashMap<String, EvmClient>,
}

impl EvmWithdrawer {
    pub fn new(config: Arc<Config>, wallets: Arc<dyn WalletStore>, vault: Arc<dyn KeyVault>) -> Self {
        Self {
            config,
            wallets,
            vault,
            clients: DashMap::new(),
        }
    }

    fn client(&self, chain: &str) -> Result<EvmClient> {
        if let Some(client) = self.clients.get(chain) {
            return Ok(client.clone());
        }
        let client = EvmClient::connect(chain, &self.config)?;
        self.clients.insert(chain.to_string(), client.clone());
        Ok(client)
    }

    async fn signer_for(&self, key: &WalletKeyData) -> Result<PrivateKeySigner> {
        let decrypted = self.vault.decrypt(&key.encrypted_data).await?;
        decrypted
            .private_key
            .trim_start_matches("0x")
            .parse()
            .map_err(|_| Error::Decryption(format!("unusable key for wallet {}", key.wallet_id)))
    }

    async fn master_signer(&self, chain: &str) -> Result<PrivateKeySigner> {
        let master = self.wallets.get_master_wallet(chain).await?;
        let decrypted = self.vault.decrypt(&master.encrypted_data).await?;
        decrypted
            .private_key
            .trim_start_matches("0x")
            .parse()
            .map_err(|_| Error::Decryption(format!("unusable master key for {chain}")))
    }

    /// Settle one EVM withdrawal request on-chain
    pub async fn withdraw(&self, request: &WithdrawalRequest) -> Result<EvmOutcome> {
        // Destination is validated before any network traffic
        let recipient = parse_address(&request.to_address)?;
        let client = self.client(&request.chain)?;
        let token = self.config.token(&request.chain, &request.currency).cloned();

        match select_capability(token.as_ref()) {
            TokenCapability::Permit => {
                let token = token.ok_or_else(|| {
                    Error::Config("permit path requires a token entry".to_string())
                })?;
                self.withdraw_permit(&client, request, &token, recipient).await
            }
            TokenCapability::Custodial => {
                let token = token.ok_or_else(|| {
                    Error::Config("custodial path requires a token entry".to_string())
                })?;
                self.withdraw_custodial(&client, request, &token, recipient).await
            }
            TokenCapability::Native => self.withdraw_native(&client, request, recipient).await,
        }
    }

    async fn withdraw_permit(
        &self,
        client: &EvmClient,
        request: &WithdrawalRequest,
        token: &TokenConfig,
        recipient: alloy::primitives::Address,
    ) -> Result<EvmOutcome> {
        let token_address = parse_address(&token.contract_address)?;
        let payer = self.master_signer(&request.chain).await?;
        let primary = self
            .wallets
            .get_wallet_key_data(&request.wallet_id, &request.chain)
            .await?;
        let owner = self.signer_for(&primary).await?;

        match permit::execute(
            client,
            &self.config,
            token_address,
            token.decimals,
            &owner,
            &payer,
            recipient,
            request.amount,
        )
        .await
        {
            Ok(tx_hash) => Ok(EvmOutcome {
                tx_hash: format_hash(tx_hash),
                alternative_wallet: None,
            }),
            Err(e @ Error::InsufficientFunds { .. }) => {
                let Some(alternative) = self
                    .alternative_key(request, &primary)
                    .await?
                else {
                    return Err(e);
                };
                let owner = self.signer_for(&alternative).await?;
                let tx_hash = permit::execute(
                    client,
                    &self.config,
                    token_address,
                    token.decimals,
                    &owner,
                    &payer,
                    recipient,
                    request.amount,
                )
                .await?;
                Ok(EvmOutcome {
                    tx_hash: format_hash(tx_hash),
                    alternative_wallet: Some(alternative),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn withdraw_custodial(
        &self,
        client: &EvmClient,
        request: &WithdrawalRequest,
        token: &TokenConfig,
        recipient: alloy::primitives::Address,
    ) -> Result<EvmOutcome> {
        let asset = if token.contract_address.is_empty() {
            custodial::CustodialAsset::Native
        } else {
            custodial::CustodialAsset::Token(parse_address(&token.contract_address)?)
        };
        let value = to_base_units(request.amount, token.decimals)?;
        let pool = self
            .wallets
            .get_active_custodial_wallets(&request.chain)
            .await?;
        let master = self.master_signer(&request.chain).await?;

        let tx_hash =
            custodial::execute(client, &self.config, &pool, &master, asset, recipient, value)
                .await?;
        Ok(EvmOutcome {
            tx_hash: format_hash(tx_hash),
            alternative_wallet: None,
        })
    }

    async fn withdraw_native(
        &self,
        client: &EvmClient,
        request: &WithdrawalRequest,
        recipient: alloy::primitives::Address,
    ) -> Result<EvmOutcome> {
        let primary = self
            .wallets
            .get_wallet_key_data(&request.wallet_id, &request.chain)
            .await?;
        let sender = self.signer_for(&primary).await?;

        match native::execute(client, &self.config, &sender, recipient, request.amount).await {
            Ok(tx_hash) => Ok(EvmOutcome {
                tx_hash: format_hash(tx_hash),
                alternative_wallet: None,
            }),
            Err(e @ Error::InsufficientFunds { .. }) => {
                let Some(alternative) = self
                    .alternative_key(request, &primary)
                    .await?
                else {
                    return Err(e);
                };
                let sender = self.signer_for(&alternative).await?;
                let tx_hash =
                    native::execute(client, &self.config, &sender, recipient, request.amount)
                        .await?;
                Ok(EvmOutcome {
                    tx_hash: format_hash(tx_hash),
                    alternative_wallet: Some(alternative),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn alternative_key(
        &self,
        request: &WithdrawalRequest,
        primary: &WalletKeyData,
    ) -> Result<Option<WalletKeyData>> {
        let found = self
            .wallets
            .find_alternative_wallet_key(
                &request.currency,
                &request.chain,
                request.amount,
                &primary.wallet_id,
            )
            .await?;
        match &found {
            Some(alt) => info!(
                request_id = %request.id,
                alternative_wallet = %alt.wallet_id,
                "primary wallet underfunded, falling back to alternative wallet"
            ),
            None => warn!(
                request_id = %request.id,
                "primary wallet underfunded and no alternative wallet qualifies"
            ),
        }
        Ok(found)
    }
}

fn format_hash(tx_hash: TxHash) -> String {
    format!("{tx_hash:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::TokenCapability;

    fn token(capability: TokenCapability) -> TokenConfig {
        TokenConfig {
            contract_address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into(),
            capability,
            decimals: 6,
        }
    }

    #[test]
    fn test_capability_selection() {
        assert_eq!(
            select_capability(Some(&token(TokenCapability::Permit))),
            TokenCapability::Permit
        );
        assert_eq!(
            select_capability(Some(&token(TokenCapability::Custodial))),
            TokenCapability::Custodial
        );
        // No token entry means the chain's own coin
        assert_eq!(select_capability(None), TokenCapability::Native);
    }
}
