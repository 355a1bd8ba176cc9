//! Order monitor: evaluates open limit and stop-loss orders against the
//! oracle and executes the ones whose trigger holds.

use super::ledger::ExecutionLedger;
use super::retry::{RetryExecutor, Trigger};
use super::stats::KeeperStats;
use super::DecisionAction;
use crate::chain::{
    with_timeout, ActionKey, ChainClient, ChainResult, KeeperAction, Order, OrderKind, TradeSide,
};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether `order` should execute at `price`.
pub fn should_execute(order: &Order, price: Decimal) -> bool {
    order.comparator.holds(price, order.trigger_price)
}

/// What one cycle decided for one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderDecision {
    pub order_id: u64,
    pub kind: OrderKind,
    pub side: TradeSide,
    pub price: Option<Decimal>,
    pub trigger_price: Decimal,
    pub action: DecisionAction,
}

pub struct OrderMonitor {
    chain: Arc<dyn ChainClient>,
    executor: Arc<RetryExecutor>,
    ledger: Arc<ExecutionLedger>,
    stats: Arc<KeeperStats>,
    batch_size: usize,
    call_timeout: Duration,
    /// Highest id covered by the previous batch; 0 restarts from the first order.
    cursor: AtomicU64,
}

impl OrderMonitor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        executor: Arc<RetryExecutor>,
        stats: Arc<KeeperStats>,
        batch_size: usize,
        call_timeout: Duration,
    ) -> Self {
        let ledger = Arc::clone(executor.ledger());
        Self {
            chain,
            executor,
            ledger,
            stats,
            batch_size: batch_size.max(1),
            call_timeout,
            cursor: AtomicU64::new(0),
        }
    }

    /// Run one order cycle.
    ///
    /// Reads the next batch of open orders, prices them concurrently and then
    /// handles them one by one in ascending id order. Only the batch read can
    /// fail the cycle; per-order problems are recorded in the decision.
    pub async fn check_orders(&self, cancel: &CancellationToken) -> ChainResult<Vec<OrderDecision>> {
        let after_id = self.cursor.load(Ordering::SeqCst);
        let batch = with_timeout(
            self.call_timeout,
            self.chain.open_orders(after_id, self.batch_size),
        )
        .await?;

        // A short batch means the end was reached; wrap around next cycle.
        let next_cursor = match batch.last() {
            Some(last) if batch.len() >= self.batch_size => last.id,
            _ => 0,
        };
        self.cursor.store(next_cursor, Ordering::SeqCst);

        let orders: Vec<Order> = batch
            .into_iter()
            .filter(|order| {
                let failed = self.ledger.is_failed(ActionKey::Order(order.id));
                if failed {
                    debug!(order_id = order.id, "Skipping order marked failed");
                }
                !failed
            })
            .collect();

        let prices = join_all(orders.iter().map(|order| {
            let pair = order.pair();
            async move { with_timeout(self.call_timeout, self.chain.mark_price(&pair)).await }
        }))
        .await;

        let mut decisions = Vec::with_capacity(orders.len());
        let mut executed = 0usize;

        for (order, price) in orders.into_iter().zip(prices) {
            if cancel.is_cancelled() {
                debug!(remaining_from = order.id, "Shutdown requested, ending order batch");
                break;
            }

            let (price, action) = match price {
                Err(e) => {
                    warn!(order_id = order.id, error = %e, "⚠️ Price read failed");
                    (None, DecisionAction::ReadFailed(e.to_string()))
                }
                Ok(None) => {
                    debug!(order_id = order.id, pair = %order.pair(), "No price available");
                    (None, DecisionAction::SkippedNoPrice)
                }
                Ok(Some(price)) if should_execute(&order, price) => {
                    info!(
                        order_id = order.id,
                        kind = %order.kind,
                        side = %order.side,
                        %price,
                        trigger = %order.trigger_price,
                        comparator = %order.comparator,
                        "🎯 [ORDERS] Trigger met, executing"
                    );
                    let result = self
                        .executor
                        .execute(KeeperAction::ExecuteOrder(order.id), Trigger::Automatic)
                        .await;
                    if result.success {
                        executed += 1;
                    }
                    (Some(price), DecisionAction::from_execution(result))
                }
                Ok(Some(price)) => (Some(price), DecisionAction::Hold),
            };

            decisions.push(OrderDecision {
                order_id: order.id,
                kind: order.kind,
                side: order.side,
                price,
                trigger_price: order.trigger_price,
                action,
            });
        }

        self.stats.record_order_cycle();
        if executed > 0 {
            info!(executed, "📊 [ORDERS] Executed orders this cycle");
        }

        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{order_fixture, ScriptedSubmit, MOCK_TOKEN};
    use crate::chain::{ChainError, MockChainClient, OrderStatus};
    use crate::config::Config;
    use crate::keeper::retry::ExecutionOutcome;
    use rust_decimal_macros::dec;

    fn monitor_for(chain: &Arc<MockChainClient>, batch_size: usize) -> OrderMonitor {
        let config = Config::default();
        let stats = Arc::new(KeeperStats::default());
        let executor = Arc::new(RetryExecutor::new(
            chain.clone(),
            ExecutionLedger::new(),
            Arc::clone(&stats),
            &config,
        ));
        OrderMonitor::new(
            chain.clone(),
            executor,
            stats,
            batch_size,
            config.retry.call_timeout(),
        )
    }

    #[test]
    fn test_should_execute_truth_table() {
        let price_below = dec!(95);
        let price_at = dec!(100);
        let price_above = dec!(105);

        let cases = [
            (OrderKind::Limit, TradeSide::Long, [true, true, false]),
            (OrderKind::Limit, TradeSide::Short, [false, true, true]),
            (OrderKind::StopLoss, TradeSide::Long, [false, true, true]),
            (OrderKind::StopLoss, TradeSide::Short, [true, true, false]),
        ];

        for (kind, side, expected) in cases {
            let order = order_fixture(1, kind, side, dec!(100));
            let actual = [
                should_execute(&order, price_below),
                should_execute(&order, price_at),
                should_execute(&order, price_above),
            ];
            assert_eq!(actual, expected, "{} {}", kind, side);
        }
    }

    #[tokio::test]
    async fn test_executes_triggered_and_holds_others() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_order(order_fixture(1, OrderKind::Limit, TradeSide::Long, dec!(100)))
            .await;
        chain
            .add_order(order_fixture(2, OrderKind::Limit, TradeSide::Short, dec!(110)))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(99)).await;
        let monitor = monitor_for(&chain, 10);

        let decisions = monitor.check_orders(&CancellationToken::new()).await.unwrap();

        assert_eq!(decisions.len(), 2);
        assert!(matches!(
            &decisions[0].action,
            DecisionAction::Execute(r) if r.outcome == ExecutionOutcome::Confirmed
        ));
        assert_eq!(decisions[1].action, DecisionAction::Hold);
        assert_eq!(chain.order_status(1).await, Some(OrderStatus::Executed));
        assert_eq!(chain.order_status(2).await, Some(OrderStatus::Open));
        assert_eq!(monitor.stats.snapshot().orders_checked, 1);
    }

    #[tokio::test]
    async fn test_missing_price_is_skipped() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_order(order_fixture(1, OrderKind::StopLoss, TradeSide::Short, dec!(100)))
            .await;
        let monitor = monitor_for(&chain, 10);

        let decisions = monitor.check_orders(&CancellationToken::new()).await.unwrap();

        assert_eq!(decisions[0].action, DecisionAction::SkippedNoPrice);
        assert!(chain.submissions().await.is_empty());
        assert_eq!(monitor.stats.snapshot().execution_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_orders_skipped_and_cursor_advances() {
        let chain = Arc::new(MockChainClient::new());
        for id in 1..=3 {
            chain
                .add_order(order_fixture(id, OrderKind::Limit, TradeSide::Long, dec!(100)))
                .await;
        }
        chain.set_price(MOCK_TOKEN, dec!(90)).await;
        // Order 1 is rejected permanently on the first cycle.
        chain
            .fail_estimate(ChainError::Reverted("bad route".into()))
            .await;
        let monitor = monitor_for(&chain, 2);
        let cancel = CancellationToken::new();

        let first = monitor.check_orders(&cancel).await.unwrap();
        let ids: Vec<u64> = first.iter().map(|d| d.order_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(matches!(
            &first[0].action,
            DecisionAction::Execute(r) if r.outcome == ExecutionOutcome::Rejected
        ));

        let second = monitor.check_orders(&cancel).await.unwrap();
        let ids: Vec<u64> = second.iter().map(|d| d.order_id).collect();
        assert_eq!(ids, vec![3]);

        // Wrapped around: order 1 is still open but marked failed.
        let third = monitor.check_orders(&cancel).await.unwrap();
        assert!(third.is_empty());
        assert_eq!(chain.order_status(1).await, Some(OrderStatus::Open));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_batch() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_order(order_fixture(1, OrderKind::Limit, TradeSide::Long, dec!(100)))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(90)).await;
        let monitor = monitor_for(&chain, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let decisions = monitor.check_orders(&cancel).await.unwrap();

        assert!(decisions.is_empty());
        assert!(chain.submissions().await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_read_failure_fails_cycle() {
        let chain = Arc::new(MockChainClient::new());
        chain.fail_read("open_orders").await;
        let monitor = monitor_for(&chain, 10);

        let result = monitor.check_orders(&CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_executed_order_not_resubmitted_next_cycle() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_order(order_fixture(1, OrderKind::Limit, TradeSide::Long, dec!(100)))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(95)).await;
        let monitor = monitor_for(&chain, 10);
        let cancel = CancellationToken::new();

        let first = monitor.check_orders(&cancel).await.unwrap();
        let second = monitor.check_orders(&cancel).await.unwrap();

        assert!(matches!(&first[0].action, DecisionAction::Execute(r) if r.success));
        assert!(second.is_empty());
        assert_eq!(chain.submissions().await.len(), 1);
        assert_eq!(monitor.stats.snapshot().orders_checked, 2);
        assert_eq!(monitor.stats.snapshot().orders_executed, 1);
    }

    #[tokio::test]
    async fn test_price_read_failure_isolated_to_one_order() {
        let other_token = "0x0000000000000000000000000000000000000002";
        let chain = Arc::new(MockChainClient::new());
        let mut unreadable = order_fixture(1, OrderKind::Limit, TradeSide::Long, dec!(100));
        unreadable.token_out = other_token.to_string();
        chain.add_order(unreadable).await;
        chain
            .add_order(order_fixture(2, OrderKind::Limit, TradeSide::Long, dec!(100)))
            .await;
        chain.fail_price(other_token).await;
        chain.set_price(MOCK_TOKEN, dec!(95)).await;
        let monitor = monitor_for(&chain, 10);

        let decisions = monitor.check_orders(&CancellationToken::new()).await.unwrap();

        assert!(matches!(decisions[0].action, DecisionAction::ReadFailed(_)));
        assert!(matches!(&decisions[1].action, DecisionAction::Execute(r) if r.success));
        assert_eq!(chain.submissions().await, vec![KeeperAction::ExecuteOrder(2)]);
    }
}
