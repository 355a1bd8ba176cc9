//! Bounded retry around one chain-mutating action.
//!
//! Every attempt re-checks that the target is still open, estimates gas,
//! submits and waits for a successful receipt. Transient failures back off
//! exponentially; permanent ones stop immediately.

use super::diagnostics::DiagnosticsReporter;
use super::ledger::ExecutionLedger;
use super::stats::KeeperStats;
use crate::chain::{
    with_timeout, ActionKey, ChainClient, ChainError, ChainResult, KeeperAction, Receipt,
};
use crate::config::{Config, RetryConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base × 2^(attempt−1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Who asked for the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trigger {
    /// A monitor loop.
    Automatic,
    /// An operator command. Ignores failure marks.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionOutcome {
    /// Mined with a successful receipt.
    Confirmed,
    /// Target was no longer open; nothing to do.
    Stale,
    /// Another execution holds the key.
    InFlight,
    /// Permanent failure.
    Rejected,
    /// Every attempt failed transiently.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub key: ActionKey,
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub outcome: ExecutionOutcome,
    pub attempts: u32,
}

impl ExecutionResult {
    fn without_submission(key: ActionKey, outcome: ExecutionOutcome, attempts: u32) -> Self {
        Self {
            key,
            success: false,
            tx_hash: None,
            error: None,
            outcome,
            attempts,
        }
    }

    fn failed(key: ActionKey, outcome: ExecutionOutcome, attempts: u32, err: &ChainError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::without_submission(key, outcome, attempts)
        }
    }
}

enum AttemptOutcome {
    Confirmed(Receipt),
    Stale,
}

/// Runs keeper actions under the ledger's per-id lock.
pub struct RetryExecutor {
    chain: Arc<dyn ChainClient>,
    ledger: Arc<ExecutionLedger>,
    stats: Arc<KeeperStats>,
    policy: RetryPolicy,
    call_timeout: Duration,
    /// Bound on one submission, receipt wait included.
    submit_timeout: Duration,
    max_gas_price: u128,
    /// Logs balances before and after each execution when set.
    diagnostics: Option<Arc<DiagnosticsReporter>>,
}

impl RetryExecutor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Arc<ExecutionLedger>,
        stats: Arc<KeeperStats>,
        config: &Config,
    ) -> Self {
        let call_timeout = config.retry.call_timeout();
        Self {
            chain,
            ledger,
            stats,
            policy: RetryPolicy::from_config(&config.retry),
            call_timeout,
            submit_timeout: call_timeout + config.retry.receipt_timeout(),
            max_gas_price: u128::from(config.gas.max_gas_price_wei),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, reporter: Arc<DiagnosticsReporter>) -> Self {
        self.diagnostics = Some(reporter);
        self
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }

    /// Execute `action`, retrying transient failures.
    ///
    /// The key stays locked until this returns, so a concurrent call for the
    /// same key gets [`ExecutionOutcome::InFlight`] without touching the chain.
    pub async fn execute(&self, action: KeeperAction, trigger: Trigger) -> ExecutionResult {
        let key = action.key();
        let Some(_guard) = self.ledger.try_acquire(key) else {
            return ExecutionResult::without_submission(key, ExecutionOutcome::InFlight, 0);
        };

        if let Some(reporter) = &self.diagnostics {
            reporter.log_balances(&format!("before {}", action)).await;
        }
        let result = self.run(action, trigger).await;
        if let Some(reporter) = &self.diagnostics {
            reporter
                .log_balances(&format!("after {} ({:?})", action, result.outcome))
                .await;
        }
        result
    }

    /// Attempt loop; the caller holds the key.
    async fn run(&self, action: KeeperAction, trigger: Trigger) -> ExecutionResult {
        let key = action.key();
        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(&action).await {
                Ok(AttemptOutcome::Confirmed(receipt)) => {
                    self.record_success(&action);
                    self.ledger.clear_failed(key);
                    info!(
                        %action,
                        tx_hash = %receipt.tx_hash,
                        block = ?receipt.block_number,
                        gas_used = ?receipt.gas_used,
                        attempt,
                        "✅ [EXECUTOR] Action confirmed"
                    );
                    return ExecutionResult {
                        key,
                        success: true,
                        tx_hash: Some(receipt.tx_hash),
                        error: None,
                        outcome: ExecutionOutcome::Confirmed,
                        attempts: attempt,
                    };
                }
                Ok(AttemptOutcome::Stale) => {
                    debug!(%action, attempt, "Target no longer open, skipping");
                    return ExecutionResult::without_submission(
                        key,
                        ExecutionOutcome::Stale,
                        attempt,
                    );
                }
                Err(e) if e.is_transient() => {
                    if attempt < max_attempts {
                        let delay = self.policy.delay_for(attempt);
                        warn!(
                            %action,
                            attempt,
                            max_attempts,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(%action, attempt, error = %e, "Transient failure on last attempt");
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    // A rejection caused by someone else closing the target is not ours.
                    if let Ok(false) = self.target_open(&action).await {
                        debug!(%action, error = %e, "Rejected after target closed, skipping");
                        return ExecutionResult::without_submission(
                            key,
                            ExecutionOutcome::Stale,
                            attempt,
                        );
                    }

                    self.stats.record_failure();
                    if trigger == Trigger::Automatic {
                        self.ledger.mark_failed(key, e.to_string());
                    }
                    error!(%action, attempt, error = %e, "❌ [EXECUTOR] Permanent failure");
                    return ExecutionResult::failed(key, ExecutionOutcome::Rejected, attempt, &e);
                }
            }
        }

        self.stats.record_failure();
        let err = last_error.unwrap_or_else(|| ChainError::Transport("no attempts made".into()));
        error!(%action, attempts = max_attempts, error = %err, "❌ [EXECUTOR] Retries exhausted");
        ExecutionResult::failed(key, ExecutionOutcome::Exhausted, max_attempts, &err)
    }

    async fn attempt(&self, action: &KeeperAction) -> ChainResult<AttemptOutcome> {
        if !self.target_open(action).await? {
            return Ok(AttemptOutcome::Stale);
        }

        let gas = with_timeout(self.call_timeout, self.chain.estimate_gas(action)).await?;
        if gas.gas_price > self.max_gas_price {
            return Err(ChainError::GasPriceTooHigh {
                current: gas.gas_price,
                cap: self.max_gas_price,
            });
        }

        debug!(%action, gas_limit = gas.gas_limit, gas_price = %gas.gas_price, "Submitting");
        let receipt = with_timeout(self.submit_timeout, self.chain.submit(action, &gas)).await?;

        if receipt.is_success() {
            Ok(AttemptOutcome::Confirmed(receipt))
        } else {
            Err(ChainError::ReceiptFailed {
                tx_hash: receipt.tx_hash,
            })
        }
    }

    /// Whether the action's target is still open on chain.
    async fn target_open(&self, action: &KeeperAction) -> ChainResult<bool> {
        let open = match action {
            KeeperAction::ExecuteOrder(id) => with_timeout(self.call_timeout, self.chain.order(*id))
                .await?
                .map(|o| o.is_open()),
            KeeperAction::LiquidatePosition(id) => {
                with_timeout(self.call_timeout, self.chain.position(*id))
                    .await?
                    .map(|p| p.is_open())
            }
        };
        Ok(open.unwrap_or(false))
    }

    fn record_success(&self, action: &KeeperAction) {
        match action {
            KeeperAction::ExecuteOrder(_) => self.stats.record_order_executed(),
            KeeperAction::LiquidatePosition(_) => self.stats.record_position_liquidated(),
        }
    }
}
