//! Keeper core.
//!
//! This module provides:
//! - Order and position monitors that decide what to submit
//! - A retry executor guarded by a per-id execution ledger
//! - Read-only diagnostics
//! - The controller that owns the loops and their lifecycle

pub mod controller;
pub mod diagnostics;
pub mod ledger;
pub mod orders;
pub mod positions;
pub mod retry;
pub mod stats;

pub use controller::{KeeperController, KeeperError, OrderView, PositionView};
pub use diagnostics::{DiagnosticsReport, DiagnosticsReporter};
pub use ledger::{ExecutionLedger, InFlightGuard};
pub use orders::{should_execute, OrderDecision, OrderMonitor};
pub use positions::{pnl_ratio, LiquidationDecision, PositionMonitor};
pub use retry::{ExecutionOutcome, ExecutionResult, RetryExecutor, RetryPolicy, Trigger};
pub use stats::{ConfigSnapshot, KeeperState, KeeperStats, KeeperStatus, StatsSnapshot};

use serde::Serialize;

/// What a monitor did with one order or position in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DecisionAction {
    /// Condition not met.
    Hold,
    /// Submitted through the retry executor.
    Execute(ExecutionResult),
    SkippedNoPrice,
    /// Another execution already holds the id.
    InFlight,
    /// Closed before submission.
    Stale,
    ReadFailed(String),
}

impl DecisionAction {
    pub fn from_execution(result: ExecutionResult) -> Self {
        match result.outcome {
            ExecutionOutcome::InFlight => DecisionAction::InFlight,
            ExecutionOutcome::Stale => DecisionAction::Stale,
            _ => DecisionAction::Execute(result),
        }
    }
}
