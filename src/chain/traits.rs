//! Backend-agnostic chain access.
//!
//! The keeper core never talks to a node directly. Everything it needs from
//! the chain goes through [`ChainClient`]:
//! - Order and position reads
//! - Oracle prices and gas data
//! - Transaction submission and receipt confirmation

use super::error::ChainResult;
use super::types::{
    GasEstimate, KeeperAction, OracleHealth, Order, Position, Receipt, TokenInfo, TokenPair,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Read/write access to the router contract and the node behind it.
///
/// Implementations must be cheap to share: one handle is used concurrently
/// by every keeper loop.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Network id reported by the node.
    async fn chain_id(&self) -> ChainResult<u64>;

    /// Account the keeper submits transactions from.
    fn keeper_address(&self) -> &str;

    /// Up to `limit` open orders with `id > after_id`, ascending by id.
    /// Orders that cannot be read or decoded are skipped.
    async fn open_orders(&self, after_id: u64, limit: usize) -> ChainResult<Vec<Order>>;

    /// A single order, `None` if the id was never issued.
    async fn order(&self, id: u64) -> ChainResult<Option<Order>>;

    /// Every order ever issued, ascending by id.
    async fn all_orders(&self) -> ChainResult<Vec<Order>>;

    /// Number of order ids issued so far.
    async fn order_count(&self) -> ChainResult<u64>;

    /// Every open position, ascending by id.
    async fn open_positions(&self) -> ChainResult<Vec<Position>>;

    async fn position(&self, id: u64) -> ChainResult<Option<Position>>;

    async fn all_positions(&self) -> ChainResult<Vec<Position>>;

    async fn position_count(&self) -> ChainResult<u64>;

    /// Current USD price of `pair.base`, `None` when the oracle has none.
    async fn mark_price(&self, pair: &TokenPair) -> ChainResult<Option<Decimal>>;

    async fn oracle_health(&self, token: &str) -> ChainResult<OracleHealth>;

    /// Current network gas price in wei.
    async fn gas_price(&self) -> ChainResult<u128>;

    /// Gas needed for `action`. Fails with a revert if the contract would reject it.
    async fn estimate_gas(&self, action: &KeeperAction) -> ChainResult<GasEstimate>;

    /// Submit `action` and wait for its receipt.
    async fn submit(&self, action: &KeeperAction, gas: &GasEstimate) -> ChainResult<Receipt>;

    /// Balances of `address`: native wallet balance under `"ETH"` plus the
    /// router-held balance of each non-native token, in whole-token units.
    async fn balances(
        &self,
        address: &str,
        tokens: &[TokenInfo],
    ) -> ChainResult<BTreeMap<String, Decimal>>;

    /// Total liquidity held by the router for each token. The native token
    /// is the router contract's own balance.
    async fn pool_balances(&self, tokens: &[TokenInfo]) -> ChainResult<BTreeMap<String, Decimal>>;

    /// Router-held balance of `address` that is not locked as collateral.
    async fn available_balances(
        &self,
        address: &str,
        tokens: &[TokenInfo],
    ) -> ChainResult<BTreeMap<String, Decimal>>;

    /// Whether the router contract has code deployed and answers calls.
    async fn contracts_reachable(&self) -> ChainResult<bool>;
}
