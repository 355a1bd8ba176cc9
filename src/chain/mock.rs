//! In-memory chain for tests and dry runs.
//!
//! Holds orders, positions and prices in memory and lets callers script
//! the outcome of each submission.

use super::error::{ChainError, ChainResult};
use super::traits::ChainClient;
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Keeper account used by the mock.
pub const MOCK_KEEPER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
/// Token priced by default in fixtures.
pub const MOCK_TOKEN: &str = "0x0000000000000000000000000000000000000001";

/// Scripted result of the next `submit` call.
#[derive(Debug, Clone)]
pub enum ScriptedSubmit {
    /// Mine successfully and close the target.
    Succeed,
    /// Mine with a failed status.
    Revert,
    /// Fail before a receipt is observed.
    Fail(ChainError),
}

/// Simulated chain state.
#[derive(Debug)]
pub struct MockChainState {
    pub chain_id: u64,
    pub orders: BTreeMap<u64, Order>,
    pub positions: BTreeMap<u64, Position>,
    /// Token address -> USD price
    pub prices: HashMap<String, Decimal>,
    pub balances: BTreeMap<String, Decimal>,
    /// Symbol -> router liquidity.
    pub pool_balances: BTreeMap<String, Decimal>,
    /// Symbol -> unlocked keeper balance inside the router.
    pub available_balances: BTreeMap<String, Decimal>,
    pub gas_price: u128,
    pub reachable: bool,
    /// Every action passed to `submit`, in call order.
    pub submissions: Vec<KeeperAction>,
    pub submit_script: VecDeque<ScriptedSubmit>,
    pub estimate_failures: VecDeque<ChainError>,
    /// Read operations that fail with a transport error.
    pub failing_reads: HashSet<&'static str>,
    /// Tokens whose price read fails with a transport error.
    pub failing_prices: HashSet<String>,
}

impl Default for MockChainState {
    fn default() -> Self {
        Self {
            chain_id: 31337,
            orders: BTreeMap::new(),
            positions: BTreeMap::new(),
            prices: HashMap::new(),
            balances: BTreeMap::from([("ETH".to_string(), dec!(10))]),
            pool_balances: BTreeMap::from([("ETH".to_string(), dec!(250))]),
            available_balances: BTreeMap::new(),
            gas_price: 1_000_000_000,
            reachable: true,
            submissions: Vec::new(),
            submit_script: VecDeque::new(),
            estimate_failures: VecDeque::new(),
            failing_reads: HashSet::new(),
            failing_prices: HashSet::new(),
        }
    }
}

/// Mock client backed by [`MockChainState`].
pub struct MockChainClient {
    state: Arc<RwLock<MockChainState>>,
    keeper_address: String,
    /// Time a submission takes to be mined.
    submit_delay: Duration,
    tx_counter: AtomicU64,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockChainState::default())),
            keeper_address: MOCK_KEEPER.to_string(),
            submit_delay: Duration::ZERO,
            tx_counter: AtomicU64::new(1),
        }
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub async fn add_order(&self, order: Order) {
        self.state.write().await.orders.insert(order.id, order);
    }

    pub async fn add_position(&self, position: Position) {
        self.state
            .write()
            .await
            .positions
            .insert(position.id, position);
    }

    pub async fn set_price(&self, token: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(token.to_string(), price);
    }

    pub async fn fail_price(&self, token: &str) {
        self.state
            .write()
            .await
            .failing_prices
            .insert(token.to_string());
    }

    pub async fn set_pool_balance(&self, symbol: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .pool_balances
            .insert(symbol.to_string(), amount);
    }

    pub async fn set_available_balance(&self, symbol: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .available_balances
            .insert(symbol.to_string(), amount);
    }

    pub async fn set_gas_price(&self, gas_price: u128) {
        self.state.write().await.gas_price = gas_price;
    }

    pub async fn set_chain_id(&self, chain_id: u64) {
        self.state.write().await.chain_id = chain_id;
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.state.write().await.reachable = reachable;
    }

    /// Change an order's status out from under the keeper.
    pub async fn set_order_status(&self, id: u64, status: OrderStatus) {
        if let Some(order) = self.state.write().await.orders.get_mut(&id) {
            order.status = status;
        }
    }

    pub async fn script_submit(&self, outcome: ScriptedSubmit) {
        self.state.write().await.submit_script.push_back(outcome);
    }

    pub async fn fail_estimate(&self, err: ChainError) {
        self.state.write().await.estimate_failures.push_back(err);
    }

    pub async fn fail_read(&self, operation: &'static str) {
        self.state.write().await.failing_reads.insert(operation);
    }

    pub async fn submissions(&self) -> Vec<KeeperAction> {
        self.state.read().await.submissions.clone()
    }

    pub async fn order_status(&self, id: u64) -> Option<OrderStatus> {
        self.state.read().await.orders.get(&id).map(|o| o.status)
    }

    pub async fn position_status(&self, id: u64) -> Option<PositionStatus> {
        self.state.read().await.positions.get(&id).map(|p| p.status)
    }

    fn check_read(state: &MockChainState, operation: &'static str) -> ChainResult<()> {
        if state.failing_reads.contains(operation) {
            return Err(ChainError::Transport(format!("{} unavailable", operation)));
        }
        Ok(())
    }

    fn target_open(state: &MockChainState, action: &KeeperAction) -> bool {
        match action {
            KeeperAction::ExecuteOrder(id) => {
                state.orders.get(id).map(Order::is_open).unwrap_or(false)
            }
            KeeperAction::LiquidatePosition(id) => {
                state.positions.get(id).map(Position::is_open).unwrap_or(false)
            }
        }
    }

    /// One entry per token, zero when nothing was set.
    fn per_token(
        amounts: &BTreeMap<String, Decimal>,
        tokens: &[TokenInfo],
    ) -> BTreeMap<String, Decimal> {
        tokens
            .iter()
            .map(|t| {
                let amount = amounts.get(&t.symbol).copied().unwrap_or(Decimal::ZERO);
                (t.symbol.clone(), amount)
            })
            .collect()
    }

    fn next_tx_hash(&self) -> String {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        format!("0x{:064x}", n)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn chain_id(&self) -> ChainResult<u64> {
        let state = self.state.read().await;
        Self::check_read(&state, "chain_id")?;
        Ok(state.chain_id)
    }

    fn keeper_address(&self) -> &str {
        &self.keeper_address
    }

    async fn open_orders(&self, after_id: u64, limit: usize) -> ChainResult<Vec<Order>> {
        let state = self.state.read().await;
        Self::check_read(&state, "open_orders")?;
        Ok(state
            .orders
            .range(after_id + 1..)
            .map(|(_, o)| o)
            .filter(|o| o.is_open())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn order(&self, id: u64) -> ChainResult<Option<Order>> {
        let state = self.state.read().await;
        Self::check_read(&state, "order")?;
        Ok(state.orders.get(&id).cloned())
    }

    async fn all_orders(&self) -> ChainResult<Vec<Order>> {
        let state = self.state.read().await;
        Self::check_read(&state, "all_orders")?;
        Ok(state.orders.values().cloned().collect())
    }

    async fn order_count(&self) -> ChainResult<u64> {
        let state = self.state.read().await;
        Self::check_read(&state, "order_count")?;
        Ok(state.orders.len() as u64)
    }

    async fn open_positions(&self) -> ChainResult<Vec<Position>> {
        let state = self.state.read().await;
        Self::check_read(&state, "open_positions")?;
        Ok(state
            .positions
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect())
    }

    async fn position(&self, id: u64) -> ChainResult<Option<Position>> {
        let state = self.state.read().await;
        Self::check_read(&state, "position")?;
        Ok(state.positions.get(&id).cloned())
    }

    async fn all_positions(&self) -> ChainResult<Vec<Position>> {
        let state = self.state.read().await;
        Self::check_read(&state, "all_positions")?;
        Ok(state.positions.values().cloned().collect())
    }

    async fn position_count(&self) -> ChainResult<u64> {
        let state = self.state.read().await;
        Self::check_read(&state, "position_count")?;
        Ok(state.positions.len() as u64)
    }

    async fn mark_price(&self, pair: &TokenPair) -> ChainResult<Option<Decimal>> {
        let state = self.state.read().await;
        Self::check_read(&state, "mark_price")?;
        if state.failing_prices.contains(&pair.base) {
            return Err(ChainError::Transport(format!("price feed for {} unavailable", pair.base)));
        }
        Ok(state.prices.get(&pair.base).copied())
    }

    async fn oracle_health(&self, token: &str) -> ChainResult<OracleHealth> {
        let state = self.state.read().await;
        Self::check_read(&state, "oracle_health")?;
        let price = state.prices.get(token).copied();
        Ok(OracleHealth {
            token: token.to_string(),
            price,
            valid: price.map(|p| p > Decimal::ZERO).unwrap_or(false),
            staleness_secs: None,
        })
    }

    async fn gas_price(&self) -> ChainResult<u128> {
        let state = self.state.read().await;
        Self::check_read(&state, "gas_price")?;
        Ok(state.gas_price)
    }

    async fn estimate_gas(&self, action: &KeeperAction) -> ChainResult<GasEstimate> {
        let mut state = self.state.write().await;
        if let Some(err) = state.estimate_failures.pop_front() {
            return Err(err);
        }
        if !Self::target_open(&state, action) {
            return Err(ChainError::Reverted(format!("{} not executable", action.key())));
        }
        Ok(GasEstimate {
            gas_limit: 300_000,
            gas_price: state.gas_price,
        })
    }

    async fn submit(&self, action: &KeeperAction, _gas: &GasEstimate) -> ChainResult<Receipt> {
        let outcome = {
            let mut state = self.state.write().await;
            state.submissions.push(*action);
            state
                .submit_script
                .pop_front()
                .unwrap_or(ScriptedSubmit::Succeed)
        };

        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let tx_hash = self.next_tx_hash();
        let mut state = self.state.write().await;

        let status = match outcome {
            ScriptedSubmit::Fail(err) => return Err(err),
            ScriptedSubmit::Revert => ReceiptStatus::Reverted,
            // A mined call against a closed target reverts on chain.
            ScriptedSubmit::Succeed if !Self::target_open(&state, action) => {
                ReceiptStatus::Reverted
            }
            ScriptedSubmit::Succeed => {
                match action {
                    KeeperAction::ExecuteOrder(id) => {
                        if let Some(order) = state.orders.get_mut(id) {
                            order.status = OrderStatus::Executed;
                        }
                    }
                    KeeperAction::LiquidatePosition(id) => {
                        if let Some(position) = state.positions.get_mut(id) {
                            position.status = PositionStatus::Liquidated;
                        }
                    }
                }
                ReceiptStatus::Success
            }
        };

        debug!(%action, %tx_hash, ?status, "Mock transaction mined");

        Ok(Receipt {
            tx_hash,
            status,
            block_number: Some(state.submissions.len() as u64),
            gas_used: Some(150_000),
        })
    }

    async fn balances(
        &self,
        _address: &str,
        tokens: &[TokenInfo],
    ) -> ChainResult<BTreeMap<String, Decimal>> {
        let state = self.state.read().await;
        Self::check_read(&state, "balances")?;
        let mut balances = state.balances.clone();
        for token in tokens {
            balances.entry(token.symbol.clone()).or_insert(Decimal::ZERO);
        }
        Ok(balances)
    }

    async fn pool_balances(&self, tokens: &[TokenInfo]) -> ChainResult<BTreeMap<String, Decimal>> {
        let state = self.state.read().await;
        Self::check_read(&state, "pool_balances")?;
        Ok(Self::per_token(&state.pool_balances, tokens))
    }

    async fn available_balances(
        &self,
        _address: &str,
        tokens: &[TokenInfo],
    ) -> ChainResult<BTreeMap<String, Decimal>> {
        let state = self.state.read().await;
        Self::check_read(&state, "available_balances")?;
        Ok(Self::per_token(&state.available_balances, tokens))
    }

    async fn contracts_reachable(&self) -> ChainResult<bool> {
        let state = self.state.read().await;
        Self::check_read(&state, "contracts_reachable")?;
        Ok(state.reachable)
    }
}

/// Open order on [`MOCK_TOKEN`] with the comparator derived from kind and side.
pub fn order_fixture(id: u64, kind: OrderKind, side: TradeSide, trigger: Decimal) -> Order {
    Order {
        id,
        owner: "0x00000000000000000000000000000000000000aa".to_string(),
        kind,
        side,
        token_in: NATIVE_TOKEN.to_string(),
        token_out: MOCK_TOKEN.to_string(),
        amount_in: 1_000_000_000_000_000_000,
        min_amount_out: 0,
        trigger_price: trigger,
        comparator: Comparator::for_order(kind, side),
        created_at: 1_700_000_000,
        self_executable: true,
        status: OrderStatus::Open,
    }
}

/// Open position on [`MOCK_TOKEN`].
pub fn position_fixture(id: u64, side: TradeSide, entry: Decimal, leverage: u32) -> Position {
    Position {
        id,
        owner: "0x00000000000000000000000000000000000000aa".to_string(),
        token: MOCK_TOKEN.to_string(),
        collateral: 1_000_000_000_000_000_000,
        leverage,
        entry_price: entry,
        size: leverage as u128 * 1_000_000_000_000_000_000,
        side,
        created_at: 1_700_000_000,
        status: PositionStatus::Open,
    }
}
