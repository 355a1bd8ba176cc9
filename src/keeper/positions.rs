//! Position monitor: liquidates leveraged positions whose loss crosses the
//! configured threshold.

use super::ledger::ExecutionLedger;
use super::retry::{RetryExecutor, Trigger};
use super::stats::KeeperStats;
use super::DecisionAction;
use crate::chain::{
    with_timeout, ActionKey, ChainClient, ChainResult, KeeperAction, Position, TradeSide,
};
use crate::utils::decimal::percent_change;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Leveraged PnL of `position` at `mark`, in percent.
///
/// `((mark − entry) / entry) × leverage × side`, where side is +1 for long
/// and −1 for short. `None` when the entry price is zero or the ratio does
/// not fit in a `Decimal`.
pub fn pnl_ratio(position: &Position, mark: Decimal) -> Option<Decimal> {
    percent_change(mark, position.entry_price)?
        .checked_mul(Decimal::from(position.leverage))?
        .checked_mul(position.side.sign())
}

/// Whether a position at `pnl` should be liquidated.
pub fn is_liquidatable(pnl: Decimal, threshold: Decimal) -> bool {
    pnl <= threshold
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiquidationDecision {
    pub position_id: u64,
    pub side: TradeSide,
    pub leverage: u32,
    pub mark_price: Option<Decimal>,
    pub pnl_ratio: Option<Decimal>,
    pub action: DecisionAction,
}

pub struct PositionMonitor {
    chain: Arc<dyn ChainClient>,
    executor: Arc<RetryExecutor>,
    ledger: Arc<ExecutionLedger>,
    stats: Arc<KeeperStats>,
    /// Negative percent.
    threshold: Decimal,
    call_timeout: Duration,
}

impl PositionMonitor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        executor: Arc<RetryExecutor>,
        stats: Arc<KeeperStats>,
        threshold: i64,
        call_timeout: Duration,
    ) -> Self {
        let ledger = Arc::clone(executor.ledger());
        Self {
            chain,
            executor,
            ledger,
            stats,
            threshold: Decimal::from(threshold),
            call_timeout,
        }
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Run one position cycle over every open position, ascending by id.
    pub async fn check_positions(
        &self,
        cancel: &CancellationToken,
    ) -> ChainResult<Vec<LiquidationDecision>> {
        let positions = with_timeout(self.call_timeout, self.chain.open_positions()).await?;

        let mut decisions = Vec::with_capacity(positions.len());
        let mut liquidated = 0usize;

        for position in positions {
            if cancel.is_cancelled() {
                debug!(remaining_from = position.id, "Shutdown requested, ending position batch");
                break;
            }
            if self.ledger.is_failed(ActionKey::Position(position.id)) {
                debug!(position_id = position.id, "Skipping position marked failed");
                continue;
            }

            let decision = self.evaluate(&position).await;
            if let DecisionAction::Execute(result) = &decision.action {
                if result.success {
                    liquidated += 1;
                }
            }
            decisions.push(decision);
        }

        self.stats.record_position_cycle();
        if liquidated > 0 {
            info!(liquidated, "📊 [POSITIONS] Liquidated positions this cycle");
        }

        Ok(decisions)
    }

    async fn evaluate(&self, position: &Position) -> LiquidationDecision {
        let mut decision = LiquidationDecision {
            position_id: position.id,
            side: position.side,
            leverage: position.leverage,
            mark_price: None,
            pnl_ratio: None,
            action: DecisionAction::SkippedNoPrice,
        };

        let mark = match with_timeout(self.call_timeout, self.chain.mark_price(&position.pair())).await
        {
            Ok(Some(mark)) => mark,
            Ok(None) => {
                debug!(position_id = position.id, "No price available");
                return decision;
            }
            Err(e) => {
                warn!(position_id = position.id, error = %e, "⚠️ Price read failed");
                decision.action = DecisionAction::ReadFailed(e.to_string());
                return decision;
            }
        };
        decision.mark_price = Some(mark);

        let Some(pnl) = pnl_ratio(position, mark) else {
            warn!(
                position_id = position.id,
                entry = %position.entry_price,
                %mark,
                leverage = position.leverage,
                "⚠️ PnL not computable, skipping position"
            );
            return decision;
        };
        decision.pnl_ratio = Some(pnl);

        if !is_liquidatable(pnl, self.threshold) {
            decision.action = DecisionAction::Hold;
            return decision;
        }

        warn!(
            position_id = position.id,
            side = %position.side,
            leverage = position.leverage,
            entry = %position.entry_price,
            %mark,
            pnl_pct = %pnl.round_dp(2),
            threshold = %self.threshold,
            "⚡ [POSITIONS] Liquidation candidate"
        );

        let result = self
            .executor
            .execute(KeeperAction::LiquidatePosition(position.id), Trigger::Automatic)
            .await;
        decision.action = DecisionAction::from_execution(result);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{position_fixture, MOCK_TOKEN};
    use crate::chain::{MockChainClient, PositionStatus};
    use crate::config::Config;
    use crate::utils::decimal::price_from_wei;
    use rust_decimal_macros::dec;

    fn monitor_for(chain: &Arc<MockChainClient>) -> PositionMonitor {
        let config = Config::default();
        let stats = Arc::new(KeeperStats::default());
        let executor = Arc::new(RetryExecutor::new(
            chain.clone(),
            ExecutionLedger::new(),
            Arc::clone(&stats),
            &config,
        ));
        PositionMonitor::new(
            chain.clone(),
            executor,
            stats,
            config.keeper.liquidation_threshold,
            config.retry.call_timeout(),
        )
    }

    #[test]
    fn test_pnl_ratio_scenarios() {
        let long = position_fixture(1, TradeSide::Long, dec!(100), 5);
        assert_eq!(pnl_ratio(&long, dec!(20)), Some(dec!(-400)));
        assert_eq!(pnl_ratio(&long, dec!(110)), Some(dec!(50)));

        let short = position_fixture(2, TradeSide::Short, dec!(100), 2);
        assert_eq!(pnl_ratio(&short, dec!(95)), Some(dec!(10)));
        assert_eq!(pnl_ratio(&short, dec!(150)), Some(dec!(-100)));

        let broken = position_fixture(3, TradeSide::Long, Decimal::ZERO, 2);
        assert_eq!(pnl_ratio(&broken, dec!(1)), None);
    }

    #[test]
    fn test_pnl_ratio_overflow_is_none() {
        let tiny_entry = price_from_wei(1).unwrap();
        let huge_mark = price_from_wei((1u128 << 96) - 1).unwrap();

        let long = position_fixture(1, TradeSide::Long, tiny_entry, 1);
        assert_eq!(pnl_ratio(&long, huge_mark), None);

        // The percent change fits but the leverage multiplication does not.
        let leveraged = position_fixture(2, TradeSide::Short, dec!(1), 1_000);
        let mark = Decimal::MAX / dec!(1000);
        assert_eq!(pnl_ratio(&leveraged, mark), None);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(is_liquidatable(dec!(-90), dec!(-90)));
        assert!(is_liquidatable(dec!(-400), dec!(-90)));
        assert!(!is_liquidatable(dec!(-89.99), dec!(-90)));
        assert!(!is_liquidatable(dec!(10), dec!(-90)));
    }

    #[tokio::test]
    async fn test_liquidates_only_underwater_positions() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_position(position_fixture(1, TradeSide::Long, dec!(100), 5))
            .await;
        chain
            .add_position(position_fixture(2, TradeSide::Short, dec!(100), 2))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(20)).await;
        let monitor = monitor_for(&chain);

        let decisions = monitor
            .check_positions(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].pnl_ratio, Some(dec!(-400)));
        assert!(matches!(&decisions[0].action, DecisionAction::Execute(r) if r.success));
        // Short gains when the price falls.
        assert_eq!(decisions[1].pnl_ratio, Some(dec!(160)));
        assert_eq!(decisions[1].action, DecisionAction::Hold);

        assert_eq!(
            chain.position_status(1).await,
            Some(PositionStatus::Liquidated)
        );
        assert_eq!(chain.position_status(2).await, Some(PositionStatus::Open));
        assert_eq!(chain.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_liquidated_position_not_revisited() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_position(position_fixture(1, TradeSide::Long, dec!(100), 5))
            .await;
        chain.set_price(MOCK_TOKEN, dec!(20)).await;
        let monitor = monitor_for(&chain);
        let cancel = CancellationToken::new();

        monitor.check_positions(&cancel).await.unwrap();
        let second = monitor.check_positions(&cancel).await.unwrap();

        assert!(second.is_empty());
        assert_eq!(chain.submissions().await.len(), 1);
        assert_eq!(monitor.stats.snapshot().positions_checked, 2);
        assert_eq!(monitor.stats.snapshot().positions_liquidated, 1);
    }

    #[tokio::test]
    async fn test_missing_price_skips_position() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_position(position_fixture(1, TradeSide::Long, dec!(100), 5))
            .await;
        let monitor = monitor_for(&chain);

        let decisions = monitor
            .check_positions(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(decisions[0].action, DecisionAction::SkippedNoPrice);
        assert!(chain.submissions().await.is_empty());
    }

    #[tokio::test]
    async fn test_price_read_failure_isolated_to_one_position() {
        let other_token = "0x0000000000000000000000000000000000000002";
        let chain = Arc::new(MockChainClient::new());
        let mut unreadable = position_fixture(1, TradeSide::Long, dec!(100), 5);
        unreadable.token = other_token.to_string();
        chain.add_position(unreadable).await;
        chain
            .add_position(position_fixture(2, TradeSide::Long, dec!(100), 5))
            .await;
        chain.fail_price(other_token).await;
        chain.set_price(MOCK_TOKEN, dec!(20)).await;
        let monitor = monitor_for(&chain);

        let decisions = monitor
            .check_positions(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(decisions.len(), 2);
        assert!(matches!(decisions[0].action, DecisionAction::ReadFailed(_)));
        assert!(matches!(&decisions[1].action, DecisionAction::Execute(r) if r.success));
        assert_eq!(chain.position_status(1).await, Some(PositionStatus::Open));
        assert_eq!(
            chain.position_status(2).await,
            Some(PositionStatus::Liquidated)
        );
    }

    #[tokio::test]
    async fn test_overflowing_pnl_skips_position() {
        let chain = Arc::new(MockChainClient::new());
        chain
            .add_position(position_fixture(
                1,
                TradeSide::Long,
                price_from_wei(1).unwrap(),
                1,
            ))
            .await;
        chain
            .add_position(position_fixture(2, TradeSide::Short, dec!(100), 5))
            .await;
        chain
            .set_price(MOCK_TOKEN, price_from_wei((1u128 << 96) - 1).unwrap())
            .await;
        let monitor = monitor_for(&chain);

        let decisions = monitor
            .check_positions(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].pnl_ratio, None);
        assert!(decisions[0].mark_price.is_some());
        assert_eq!(decisions[0].action, DecisionAction::SkippedNoPrice);
        // A short deep underwater is still liquidated.
        assert!(matches!(&decisions[1].action, DecisionAction::Execute(r) if r.success));
    }
}
