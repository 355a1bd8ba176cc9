//! Keeper controller: owns the monitor loops and the operator surface.
//!
//! Lifecycle is `Stopped → Starting → Running → Stopping → Stopped`. Each
//! enabled module runs in its own task on a fixed interval; stopping
//! cancels the shared token and waits for every task and every in-flight
//! submission to finish.

use super::diagnostics::{DiagnosticsReport, DiagnosticsReporter};
use super::ledger::ExecutionLedger;
use super::orders::{should_execute, OrderMonitor};
use super::positions::{is_liquidatable, pnl_ratio, PositionMonitor};
use super::retry::{ExecutionResult, RetryExecutor, Trigger};
use super::stats::{ConfigSnapshot, KeeperState, KeeperStats, KeeperStatus};
use crate::chain::{
    with_timeout, ActionKey, ChainClient, ChainError, KeeperAction, Order, OrderStatus, Position,
    TokenPair,
};
use crate::config::Config;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("keeper is already running")]
    AlreadyRunning,

    #[error("keeper is not running")]
    NotRunning,

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("{0} not found")]
    NotFound(ActionKey),

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// An order with its live evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub mark_price: Option<Decimal>,
    /// `None` when the order is closed or has no price.
    pub should_execute: Option<bool>,
    /// Why automatic execution gave up on this order.
    pub failure_reason: Option<String>,
}

/// A position with its live evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub mark_price: Option<Decimal>,
    pub pnl_ratio: Option<Decimal>,
    pub liquidation_candidate: bool,
    /// Why automatic liquidation gave up on this position.
    pub failure_reason: Option<String>,
}

struct Lifecycle {
    state: KeeperState,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

pub struct KeeperController {
    config: Config,
    chain: Arc<dyn ChainClient>,
    executor: Arc<RetryExecutor>,
    orders: Arc<OrderMonitor>,
    positions: Arc<PositionMonitor>,
    diagnostics: Arc<DiagnosticsReporter>,
    stats: Arc<KeeperStats>,
    network_id: OnceLock<u64>,
    lifecycle: Mutex<Lifecycle>,
}

impl KeeperController {
    pub fn new(config: Config, chain: Arc<dyn ChainClient>) -> Self {
        let stats = Arc::new(KeeperStats::default());
        let call_timeout = config.retry.call_timeout();
        let diagnostics = Arc::new(DiagnosticsReporter::new(
            Arc::clone(&chain),
            Arc::clone(&stats),
            config.token_list(),
            call_timeout,
        ));
        let mut executor = RetryExecutor::new(
            Arc::clone(&chain),
            ExecutionLedger::new(),
            Arc::clone(&stats),
            &config,
        );
        if config.keeper.enable_diagnostics {
            executor = executor.with_diagnostics(Arc::clone(&diagnostics));
        }
        let executor = Arc::new(executor);
        let orders = Arc::new(OrderMonitor::new(
            Arc::clone(&chain),
            Arc::clone(&executor),
            Arc::clone(&stats),
            config.keeper.max_orders_per_batch,
            call_timeout,
        ));
        let positions = Arc::new(PositionMonitor::new(
            Arc::clone(&chain),
            Arc::clone(&executor),
            Arc::clone(&stats),
            config.keeper.liquidation_threshold,
            call_timeout,
        ));

        Self {
            config,
            chain,
            executor,
            orders,
            positions,
            diagnostics,
            stats,
            network_id: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: KeeperState::Stopped,
                cancel: None,
                tasks: Vec::new(),
                started_at: None,
            }),
        }
    }

    /// Verify the node and router before anything runs.
    pub async fn initialize(&self) -> Result<u64, KeeperError> {
        let timeout = self.config.retry.call_timeout();

        let chain_id = with_timeout(timeout, self.chain.chain_id())
            .await
            .map_err(|e| KeeperError::Initialization(format!("cannot reach node: {}", e)))?;

        if let Some(expected) = self.config.chain.expected_chain_id {
            if expected != chain_id {
                return Err(KeeperError::Initialization(format!(
                    "connected to chain {} but expected {}",
                    chain_id, expected
                )));
            }
        }

        let reachable = with_timeout(timeout, self.chain.contracts_reachable())
            .await
            .map_err(|e| KeeperError::Initialization(format!("router check failed: {}", e)))?;
        if !reachable {
            return Err(KeeperError::Initialization(format!(
                "router contract not found at {}",
                self.config.chain.router_address
            )));
        }

        // Re-initializing against the same node keeps the first id.
        let _ = self.network_id.set(chain_id);

        info!(
            chain_id,
            keeper = %self.chain.keeper_address(),
            router = %self.config.chain.router_address,
            "✅ Connected to chain"
        );
        Ok(chain_id)
    }

    /// Spawn the enabled loops.
    pub fn start(&self) -> Result<(), KeeperError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state != KeeperState::Stopped {
            return Err(KeeperError::AlreadyRunning);
        }
        lifecycle.state = KeeperState::Starting;

        let cancel = CancellationToken::new();
        let keeper = &self.config.keeper;
        let mut tasks = Vec::new();

        if keeper.enable_order_execution {
            let monitor = Arc::clone(&self.orders);
            tasks.push(spawn_loop(
                "orders",
                Duration::from_secs(keeper.order_check_interval_secs),
                cancel.clone(),
                move |token| {
                    let monitor = Arc::clone(&monitor);
                    async move {
                        if let Err(e) = monitor.check_orders(&token).await {
                            error!(error = %e, "🚨 Order cycle failed");
                        }
                    }
                },
            ));
        }

        if keeper.enable_position_liquidation {
            let monitor = Arc::clone(&self.positions);
            tasks.push(spawn_loop(
                "positions",
                Duration::from_secs(keeper.position_check_interval_secs),
                cancel.clone(),
                move |token| {
                    let monitor = Arc::clone(&monitor);
                    async move {
                        if let Err(e) = monitor.check_positions(&token).await {
                            error!(error = %e, "🚨 Position cycle failed");
                        }
                    }
                },
            ));
        }

        if keeper.enable_diagnostics {
            let reporter = Arc::clone(&self.diagnostics);
            tasks.push(spawn_loop(
                "diagnostics",
                Duration::from_secs(keeper.diagnostics_interval_secs),
                cancel.clone(),
                move |_| {
                    let reporter = Arc::clone(&reporter);
                    async move {
                        let report = reporter.snapshot().await;
                        DiagnosticsReporter::log_report(&report);
                    }
                },
            ));
        }

        if tasks.is_empty() {
            warn!("All keeper modules are disabled, nothing will be monitored");
        }

        info!(
            loops = tasks.len(),
            orders = keeper.enable_order_execution,
            positions = keeper.enable_position_liquidation,
            diagnostics = keeper.enable_diagnostics,
            "🚀 Keeper started"
        );

        lifecycle.cancel = Some(cancel);
        lifecycle.tasks = tasks;
        lifecycle.started_at = Some(Utc::now());
        lifecycle.state = KeeperState::Running;
        Ok(())
    }

    /// Cancel the loops and wait for them and any in-flight submission.
    ///
    /// Tasks still running after `shutdown_timeout` are aborted.
    pub async fn stop(&self) -> Result<(), KeeperError> {
        let (cancel, tasks) = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != KeeperState::Running {
                return Err(KeeperError::NotRunning);
            }
            lifecycle.state = KeeperState::Stopping;
            (lifecycle.cancel.take(), std::mem::take(&mut lifecycle.tasks))
        };

        info!(in_flight = self.executor.ledger().in_flight_count(), "🛑 Stopping keeper");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let timeout = Duration::from_secs(self.config.keeper.shutdown_timeout_secs);
        let abort_handles: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let ledger = Arc::clone(self.executor.ledger());

        let drained = tokio::time::timeout(timeout, async move {
            for result in join_all(tasks).await {
                if let Err(e) = result {
                    error!(error = %e, "Keeper loop ended abnormally");
                }
            }
            ledger.wait_idle().await;
        })
        .await;

        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.state = KeeperState::Stopped;
            lifecycle.started_at = None;
        }

        match drained {
            Ok(()) => {
                info!("👋 Keeper stopped");
                Ok(())
            }
            Err(_) => {
                for handle in abort_handles {
                    handle.abort();
                }
                error!(timeout_secs = timeout.as_secs(), "Shutdown timed out, loops aborted");
                Err(KeeperError::ShutdownTimeout(timeout))
            }
        }
    }

    pub fn state(&self) -> KeeperState {
        lock(&self.lifecycle).state
    }

    pub fn status(&self) -> KeeperStatus {
        let lifecycle = lock(&self.lifecycle);
        KeeperStatus {
            keeper_address: self.chain.keeper_address().to_string(),
            network_id: self.network_id.get().copied(),
            state: lifecycle.state,
            running: lifecycle.state == KeeperState::Running,
            started_at: lifecycle.started_at,
            stats: self.stats.snapshot(),
            config: ConfigSnapshot::from(&self.config),
        }
    }

    /// Every order with its current price and trigger evaluation.
    ///
    /// Open orders that automatic execution rejected are reported as
    /// [`OrderStatus::Failed`].
    pub async fn all_orders(&self) -> Result<Vec<OrderView>, KeeperError> {
        let timeout = self.config.retry.call_timeout();
        let orders = with_timeout(timeout, self.chain.all_orders()).await?;
        let ledger = self.executor.ledger();

        let mut views = Vec::with_capacity(orders.len());
        for mut order in orders {
            let failure_reason = if order.is_open() {
                ledger.failed_reason(ActionKey::Order(order.id))
            } else {
                None
            };
            if failure_reason.is_some() {
                order.status = OrderStatus::Failed;
            }

            let mark_price = if order.is_open() {
                self.price_or_none(&order.pair(), order.id).await
            } else {
                None
            };
            views.push(OrderView {
                should_execute: mark_price.map(|p| should_execute(&order, p)),
                mark_price,
                order,
                failure_reason,
            });
        }
        Ok(views)
    }

    /// Every position with its current price and PnL.
    pub async fn all_positions(&self) -> Result<Vec<PositionView>, KeeperError> {
        let timeout = self.config.retry.call_timeout();
        let positions = with_timeout(timeout, self.chain.all_positions()).await?;
        let threshold = self.positions.threshold();

        let mut views = Vec::with_capacity(positions.len());
        for position in positions {
            let mark_price = if position.is_open() {
                self.price_or_none(&position.pair(), position.id).await
            } else {
                None
            };
            let pnl = mark_price.and_then(|p| pnl_ratio(&position, p));
            let failure_reason = if position.is_open() {
                self.executor
                    .ledger()
                    .failed_reason(ActionKey::Position(position.id))
            } else {
                None
            };
            views.push(PositionView {
                failure_reason,
                liquidation_candidate: position.is_open()
                    && pnl.map(|p| is_liquidatable(p, threshold)).unwrap_or(false),
                pnl_ratio: pnl,
                mark_price,
                position,
            });
        }
        Ok(views)
    }

    /// Execute an order on operator request, regardless of failure marks.
    pub async fn manual_execute_order(&self, id: u64) -> Result<ExecutionResult, KeeperError> {
        info!(order_id = id, "🔧 Manual execution requested");
        let timeout = self.config.retry.call_timeout();
        if with_timeout(timeout, self.chain.order(id)).await?.is_none() {
            return Err(KeeperError::NotFound(ActionKey::Order(id)));
        }
        Ok(self
            .executor
            .execute(KeeperAction::ExecuteOrder(id), Trigger::Manual)
            .await)
    }

    /// Liquidate a position on operator request, regardless of failure marks.
    pub async fn manual_liquidate_position(
        &self,
        id: u64,
    ) -> Result<ExecutionResult, KeeperError> {
        info!(position_id = id, "🔧 Manual liquidation requested");
        let timeout = self.config.retry.call_timeout();
        if with_timeout(timeout, self.chain.position(id)).await?.is_none() {
            return Err(KeeperError::NotFound(ActionKey::Position(id)));
        }
        Ok(self
            .executor
            .execute(KeeperAction::LiquidatePosition(id), Trigger::Manual)
            .await)
    }

    /// Take and log a diagnostics snapshot now.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let report = self.diagnostics.snapshot().await;
        DiagnosticsReporter::log_report(&report);
        report
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        self.executor.ledger()
    }

    async fn price_or_none(&self, pair: &TokenPair, id: u64) -> Option<Decimal> {
        let timeout = self.config.retry.call_timeout();
        match with_timeout(timeout, self.chain.mark_price(pair)).await {
            Ok(price) => price,
            Err(e) => {
                debug!(id, %pair, error = %e, "Price read failed");
                None
            }
        }
    }
}

/// Run `tick` every `period` until `cancel` fires.
///
/// The first tick fires immediately. A tick in progress always runs to
/// completion; cancellation is only observed between ticks.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(loop_name = name, period_secs = period.as_secs(), "Loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tick(cancel.clone()).await;
        }

        debug!(loop_name = name, "Loop stopped");
    })
}

/// Lifecycle fields are plain data, so a poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{order_fixture, position_fixture, MOCK_TOKEN};
    use crate::chain::{MockChainClient, OrderKind, PositionStatus, TradeSide};
    use crate::keeper::retry::ExecutionOutcome;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.keeper.enable_diagnostics = false;
        config.keeper.shutdown_timeout_secs = 10;
        config
    }

    fn controller_for(chain: &Arc<MockChainClient>, config: Config) -> KeeperController {
        KeeperController::new(config, chain.clone())
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let chain = Arc::new(MockChainClient::new());
        let controller = controller_for(&chain, test_config());

        assert!(matches!(
            controller.stop().await,
            Err(KeeperError::NotRunning)
        ));

        controller.start().unwrap();
        assert_eq!(controller.state(), KeeperState::Running);
        assert!(controller.status().running);
        assert!(matches!(
            controller.start(),
            Err(KeeperError::AlreadyRunning)
        ));

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), KeeperState::Stopped);
        assert!(controller.status().started_at.is_none());

        // A stopped keeper can be started again.
        controller.start().unwrap();
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_checks_chain_and_router() {
        let chain = Arc::new(MockChainClient::new());
        let mut config = test_config();
        config.chain.expected_chain_id = Some(1);
        let controller = controller_for(&chain, config);
        assert!(matches!(
            controller.initialize().await,
            Err(KeeperError::Initialization(_))
        ));

        chain.set_chain_id(1).await;
        chain.set_reachable(false).await;
        assert!(matches!(
            controller.initialize().await,
            Err(KeeperError::Initialization(_))
        ));

        chain.set_reachable(true).await;
        assert_eq!(controller.initialize().await.unwrap(), 1);
        assert_eq!(controller.status().network_id, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_liquidation() {
        let chain = Arc::new(MockChainClient::new().with_submit_delay(Duration::from_secs(3)));
        chain
            .add_position(position_fixture(1, TradeSide::Long, dec!(100), 5))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(20)).await;
        let controller = controller_for(&chain, test_config());

        controller.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.ledger().is_in_flight(ActionKey::Position(1)));

        controller.stop().await.unwrap();

        assert!(!controller.ledger().is_in_flight(ActionKey::Position(1)));
        assert_eq!(
            chain.position_status(1).await,
            Some(PositionStatus::Liquidated)
        );

        // No cycle runs after stop.
        let checked = controller.status().stats.positions_checked;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.status().stats.positions_checked, checked);
        assert_eq!(chain.submissions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_call_during_loop_execution_is_in_flight() {
        let chain = Arc::new(MockChainClient::new().with_submit_delay(Duration::from_secs(3)));
        chain
            .add_position(position_fixture(1, TradeSide::Long, dec!(100), 5))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(20)).await;
        let controller = controller_for(&chain, test_config());

        controller.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let manual = controller.manual_liquidate_position(1).await.unwrap();
        assert_eq!(manual.outcome, ExecutionOutcome::InFlight);

        controller.stop().await.unwrap();
        assert_eq!(chain.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_execution_ignores_failure_mark() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_order(order_fixture(1, OrderKind::Limit, TradeSide::Long, dec!(100)))
            .await;
        let controller = controller_for(&chain, test_config());
        controller
            .ledger()
            .mark_failed(ActionKey::Order(1), "execution reverted");

        let result = controller.manual_execute_order(1).await.unwrap();

        assert!(result.success);
        assert!(!controller.ledger().is_failed(ActionKey::Order(1)));
        assert_eq!(controller.status().stats.orders_executed, 1);
    }

    #[tokio::test]
    async fn test_manual_unknown_id_is_not_found() {
        let chain = Arc::new(MockChainClient::new());
        let controller = controller_for(&chain, test_config());

        assert!(matches!(
            controller.manual_execute_order(42).await,
            Err(KeeperError::NotFound(ActionKey::Order(42)))
        ));
        assert!(matches!(
            controller.manual_liquidate_position(7).await,
            Err(KeeperError::NotFound(ActionKey::Position(7)))
        ));
    }

    #[tokio::test]
    async fn test_views_carry_live_evaluation() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_order(order_fixture(1, OrderKind::StopLoss, TradeSide::Short, dec!(50)))
            .await;
        chain
            .add_position(position_fixture(1, TradeSide::Long, dec!(100), 5))
            .await;
        chain
            .add_position(position_fixture(2, TradeSide::Short, dec!(100), 2))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(20)).await;
        let controller = controller_for(&chain, test_config());

        let orders = controller.all_orders().await.unwrap();
        assert_eq!(orders[0].mark_price, Some(dec!(20)));
        assert_eq!(orders[0].should_execute, Some(true));

        let positions = controller.all_positions().await.unwrap();
        assert_eq!(positions[0].pnl_ratio, Some(dec!(-400)));
        assert!(positions[0].liquidation_candidate);
        assert_eq!(positions[1].pnl_ratio, Some(dec!(160)));
        assert!(!positions[1].liquidation_candidate);

        // Read-only: nothing was submitted.
        assert!(chain.submissions().await.is_empty());
    }

    #[tokio::test]
    async fn test_diagnostics_counts_runs() {
        let chain = Arc::new(MockChainClient::new());
        let controller = controller_for(&chain, test_config());

        let report = controller.diagnostics().await;

        assert_eq!(report.keeper_address, chain.keeper_address());
        assert_eq!(controller.status().stats.diagnostics_runs, 1);
    }

    #[tokio::test]
    async fn test_rejected_order_shown_as_failed() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_order(order_fixture(1, OrderKind::Limit, TradeSide::Long, dec!(100)))
            .await;
        chain
            .add_order(order_fixture(2, OrderKind::Limit, TradeSide::Long, dec!(100)))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(120)).await;
        let controller = controller_for(&chain, test_config());
        controller
            .ledger()
            .mark_failed(ActionKey::Order(1), "execution reverted: bad route");

        let orders = controller.all_orders().await.unwrap();

        assert_eq!(orders[0].order.status, OrderStatus::Failed);
        assert_eq!(
            orders[0].failure_reason.as_deref(),
            Some("execution reverted: bad route")
        );
        assert_eq!(orders[0].should_execute, None);
        assert_eq!(orders[1].order.status, OrderStatus::Open);
        assert_eq!(orders[1].failure_reason, None);
        assert_eq!(orders[1].should_execute, Some(false));
        // Still open on chain; only the view changes.
        assert_eq!(chain.order_status(1).await, Some(OrderStatus::Open));
    }
}
