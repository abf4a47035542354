//! Withdrawal orchestrator
//!
//! Pulls PENDING withdrawal requests off the store on a fixed interval,
//! groups them by chain, and drives each through the EVM or UTXO
//! settlement path. Chains run in parallel; within a chain requests are
//! serialized through a per-chain mutex so UTXO selection and the spent
//! flip never interleave with another withdrawal on the same coin set.
//!
//! Failure handling per request:
//! - refundable errors mark the request FAILED and credit amount + fee
//!   back to the originating wallet exactly once
//! - confirmation timeouts leave the request PENDING for the next pass
//! - an RPC outage aborts the rest of the chain's batch
//! - anything else is logged and left PENDING for operator attention

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::chains::{is_utxo_chain, supported_chains};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::evm::EvmWithdrawer;
use crate::ledger;
use crate::model::{NotifyKind, WalletKeyData, WithdrawalRequest};
use crate::retry::RetryPolicy;
use crate::store::{KeyVault, Notifier, TransactionStore, WalletStore};
use crate::utxo::UtxoWithdrawer;

/// Result of one settled request
struct Settlement {
    reference_id: String,
    /// Set when a wallet other than the user's own funded the send
    alternative: Option<WalletKeyData>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    transactions: Arc<dyn TransactionStore>,
    wallets: Arc<dyn WalletStore>,
    notifier: Arc<dyn Notifier>,
    evm: EvmWithdrawer,
    utxo: UtxoWithdrawer,
    retry: RetryPolicy,
    chain_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        transactions: Arc<dyn TransactionStore>,
        wallets: Arc<dyn WalletStore>,
        vault: Arc<dyn KeyVault>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let retry = RetryPolicy::new(&config.retry);
        let evm = EvmWithdrawer::new(config.clone(), wallets.clone(), vault.clone());
        let utxo = UtxoWithdrawer::new(config.clone(), wallets.clone(), vault);
        Self {
            config,
            transactions,
            wallets,
            notifier,
            evm,
            utxo,
            retry,
            chain_locks: DashMap::new(),
        }
    }

    /// Zero-delay retries, for tests
    #[cfg(test)]
    fn with_immediate_retry(mut self, max_attempts: u32) -> Self {
        self.retry = RetryPolicy::immediate(max_attempts);
        self
    }

    /// Run the scheduler until the task is dropped
    pub async fn run(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.scheduler.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.scheduler.poll_interval_secs,
            "withdrawal scheduler started"
        );
        loop {
            ticker.tick().await;
            let settled = self.process_once().await;
            if settled > 0 {
                info!(settled, "scheduler pass complete");
            }
        }
    }

    /// One scheduler pass: every chain in parallel. Returns the number of
    /// requests settled on-chain.
    pub async fn process_once(&self) -> usize {
        let passes = supported_chains().map(|chain| async move {
            match self.process_chain(chain).await {
                Ok(n) => n,
                Err(e) => {
                    error!(chain, error = %e, "chain batch aborted");
                    0
                }
            }
        });
        join_all(passes).await.into_iter().sum()
    }

    /// Settle every pending request on one chain, serially. An RPC error
    /// escaping a request aborts the remainder of the batch: the chain's
    /// provider is down and the rest would fail the same way.
    pub async fn process_chain(&self, chain: &str) -> Result<usize> {
        let pending = self.transactions.find_pending_withdrawals(chain).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(chain, count = pending.len(), "processing pending withdrawals");

        let lock = self.chain_lock(chain);
        let mut settled = 0;
        for request in &pending {
            // Held across selection and the spent flip
            let _guard = lock.lock().await;
            match self.settle(request).await {
                Ok(settlement) => {
                    self.finish(request, settlement).await?;
                    settled += 1;
                }
                Err(e) if e.is_refundable() => {
                    self.refund(request, &e).await?;
                }
                Err(Error::ConfirmationTimeout(secs)) => {
                    // The send may still land; re-checked next pass
                    warn!(
                        request_id = %request.id,
                        timeout_secs = secs,
                        "confirmation timed out, request stays pending"
                    );
                }
                Err(e @ Error::Rpc(_)) => return Err(e),
                Err(e) => {
                    error!(request_id = %request.id, error = %e, "withdrawal failed, left pending");
                }
            }
        }
        Ok(settled)
    }

    fn chain_lock(&self, chain: &str) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(chain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Funds check, then the chain-family dispatch. Transient errors go
    /// through the retry policy before escaping.
    async fn settle(&self, request: &WithdrawalRequest) -> Result<Settlement> {
        let wallet = self.wallets.get_wallet(&request.wallet_id).await?;
        let available =
            ledger::total_available(self.wallets.as_ref(), &wallet, &request.chain).await?;
        let required = request.total_debit();
        if available < required {
            return Err(Error::InsufficientFunds {
                available,
                required,
            });
        }

        if is_utxo_chain(&request.chain) {
            let txid = self
                .retry
                .run("utxo_withdraw", || self.utxo.withdraw(request))
                .await?;
            Ok(Settlement {
                reference_id: txid,
                alternative: None,
            })
        } else {
            let outcome = self
                .retry
                .run("evm_withdraw", || self.evm.withdraw(request))
                .await?;
            Ok(Settlement {
                reference_id: outcome.tx_hash,
                alternative: outcome.alternative_wallet,
            })
        }
    }

    /// Completion bookkeeping: status flip, lender compensation on the
    /// private ledger, user notification. The wallet was debited when the
    /// request was accepted, so no balance change happens here.
    async fn finish(&self, request: &WithdrawalRequest, settlement: Settlement) -> Result<()> {
        // Lender compensation lands first: the request may only read as
        // completed once the loan is already on the books.
        if let Some(alt) = &settlement.alternative {
            self.wallets
                .decrement_wallet_key_balance(&alt.wallet_id, &request.chain, request.amount)
                .await?;
            ledger::update_private_ledger(
                self.wallets.as_ref(),
                &alt.wallet_id,
                alt.index,
                &request.currency,
                &request.chain,
                -request.amount,
                &self.config,
            )
            .await?;
        }

        let description = format!(
            "Withdrawal of {} {} to {}",
            request.amount, request.currency, request.to_address
        );
        self.transactions
            .complete_request(&request.id, &settlement.reference_id, &description)
            .await?;

        info!(
            request_id = %request.id,
            reference_id = %settlement.reference_id,
            "withdrawal completed"
        );
        self.notifier
            .notify(
                &request.user_id,
                "Withdrawal Processed",
                &format!(
                    "Your withdrawal of {} {} has been processed.",
                    request.amount, request.currency
                ),
                NotifyKind::Success,
            )
            .await;
        Ok(())
    }

    /// One refund per request: the store's status guard makes a second
    /// call a no-op, so a crash between refund and notify cannot credit
    /// the wallet twice.
    async fn refund(&self, request: &WithdrawalRequest, cause: &Error) -> Result<()> {
        let refunded = self
            .transactions
            .fail_and_refund(&request.id, &format!("Withdrawal failed: {cause}"))
            .await?;
        if !refunded {
            warn!(request_id = %request.id, "refund skipped, request no longer pending");
            return Ok(());
        }
        warn!(request_id = %request.id, error = %cause, "withdrawal failed and refunded");
        self.notifier
            .notify(
                &request.user_id,
                "Withdrawal Failed",
                &format!(
                    "Your withdrawal of {} {} has failed.",
                    request.amount, request.currency
                ),
                NotifyKind::Failure,
            )
            .await;
        Ok(())
    }
}
