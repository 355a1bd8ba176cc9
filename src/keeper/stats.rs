//! Keeper counters and the status report built from them.

use crate::config::Config;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by every loop.
#[derive(Debug, Default)]
pub struct KeeperStats {
    orders_checked: AtomicU64,
    positions_checked: AtomicU64,
    orders_executed: AtomicU64,
    positions_liquidated: AtomicU64,
    execution_failures: AtomicU64,
    diagnostics_runs: AtomicU64,
}

impl KeeperStats {
    /// One completed order cycle.
    pub fn record_order_cycle(&self) {
        self.orders_checked.fetch_add(1, Ordering::Relaxed);
    }

    /// One completed position cycle.
    pub fn record_position_cycle(&self) {
        self.positions_checked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_executed(&self) {
        self.orders_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_position_liquidated(&self) {
        self.positions_liquidated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.execution_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_diagnostics_run(&self) {
        self.diagnostics_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            orders_checked: self.orders_checked.load(Ordering::Relaxed),
            positions_checked: self.positions_checked.load(Ordering::Relaxed),
            orders_executed: self.orders_executed.load(Ordering::Relaxed),
            positions_liquidated: self.positions_liquidated.load(Ordering::Relaxed),
            execution_failures: self.execution_failures.load(Ordering::Relaxed),
            diagnostics_runs: self.diagnostics_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub orders_checked: u64,
    pub positions_checked: u64,
    pub orders_executed: u64,
    pub positions_liquidated: u64,
    pub execution_failures: u64,
    pub diagnostics_runs: u64,
}

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeeperState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for KeeperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeeperState::Stopped => "stopped",
            KeeperState::Starting => "starting",
            KeeperState::Running => "running",
            KeeperState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Settings reported alongside the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub order_check_interval_secs: u64,
    pub position_check_interval_secs: u64,
    pub diagnostics_interval_secs: u64,
    pub liquidation_threshold: i64,
    pub max_orders_per_batch: usize,
    pub order_execution_enabled: bool,
    pub position_liquidation_enabled: bool,
    pub diagnostics_enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl From<&Config> for ConfigSnapshot {
    fn from(config: &Config) -> Self {
        Self {
            order_check_interval_secs: config.keeper.order_check_interval_secs,
            position_check_interval_secs: config.keeper.position_check_interval_secs,
            diagnostics_interval_secs: config.keeper.diagnostics_interval_secs,
            liquidation_threshold: config.keeper.liquidation_threshold,
            max_orders_per_batch: config.keeper.max_orders_per_batch,
            order_execution_enabled: config.keeper.enable_order_execution,
            position_liquidation_enabled: config.keeper.enable_position_liquidation,
            diagnostics_enabled: config.keeper.enable_diagnostics,
            max_attempts: config.retry.max_attempts,
            base_delay_ms: config.retry.base_delay_ms,
            max_delay_ms: config.retry.max_delay_ms,
        }
    }
}

/// Point-in-time view of the keeper.
#[derive(Debug, Clone, Serialize)]
pub struct KeeperStatus {
    pub keeper_address: String,
    /// Set once `initialize` has verified the node.
    pub network_id: Option<u64>,
    pub state: KeeperState,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: StatsSnapshot,
    pub config: ConfigSnapshot,
}
