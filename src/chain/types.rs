//! Domain types read from and submitted to the router contract.

use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Address the router uses for the chain's native asset.
pub const NATIVE_TOKEN: &str = "0x0000000000000000000000000000000000000000";

/// Order type as stored by the router (`0 = LIMIT`, `1 = STOP_LOSS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrderKind {
    Limit,
    StopLoss,
}

impl OrderKind {
    /// Decode the router's numeric order type.
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => OrderKind::Limit,
            _ => OrderKind::StopLoss,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Limit => "LIMIT",
            OrderKind::StopLoss => "STOP_LOSS",
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Direction of an order or a leveraged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn from_is_long(is_long: bool) -> Self {
        if is_long {
            TradeSide::Long
        } else {
            TradeSide::Short
        }
    }

    /// Decode the router's numeric position type (`0 = LONG`).
    pub fn from_code(code: u64) -> Self {
        Self::from_is_long(code == 0)
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Long => Decimal::ONE,
            TradeSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Long => "LONG",
            TradeSide::Short => "SHORT",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Price comparison that triggers an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Comparator {
    /// Execute when the price is at or above the trigger.
    AtOrAbove,
    /// Execute when the price is at or below the trigger.
    AtOrBelow,
}

impl Comparator {
    /// Derive the trigger comparison from order type and side.
    ///
    /// - Limit buy waits for the price to fall, limit sell for it to rise.
    /// - Stop-loss buy fires on a rise, stop-loss sell on a fall.
    pub fn for_order(kind: OrderKind, side: TradeSide) -> Self {
        match (kind, side) {
            (OrderKind::Limit, TradeSide::Long) => Comparator::AtOrBelow,
            (OrderKind::Limit, TradeSide::Short) => Comparator::AtOrAbove,
            (OrderKind::StopLoss, TradeSide::Long) => Comparator::AtOrAbove,
            (OrderKind::StopLoss, TradeSide::Short) => Comparator::AtOrBelow,
        }
    }

    /// Whether `price` satisfies the comparison against `trigger`.
    pub fn holds(&self, price: Decimal, trigger: Decimal) -> bool {
        match self {
            Comparator::AtOrAbove => price >= trigger,
            Comparator::AtOrBelow => price <= trigger,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::AtOrAbove => ">=",
            Comparator::AtOrBelow => "<=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Lifecycle of an order. Only `Open` is non-terminal.
///
/// `Failed` never comes from the chain: it marks an order the keeper
/// rejected permanently while it is still open on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrderStatus {
    Open,
    Executed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Open)
    }
}

/// Lifecycle of a leveraged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PositionStatus {
    Open,
    Liquidated,
}

impl PositionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, PositionStatus::Open)
    }
}

/// Token pair whose price drives a decision. Priced as `base` in USD.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TokenPair {
    pub base: String,
    pub quote: String,
}

impl TokenPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// A limit or stop-loss order held by the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: u64,
    pub owner: String,
    pub kind: OrderKind,
    pub side: TradeSide,
    pub token_in: String,
    pub token_out: String,
    /// Raw token units of `token_in`.
    pub amount_in: u128,
    /// Raw token units of `token_out`.
    pub min_amount_out: u128,
    /// Trigger price in USD.
    pub trigger_price: Decimal,
    pub comparator: Comparator,
    /// Unix seconds.
    pub created_at: u64,
    pub self_executable: bool,
    pub status: OrderStatus,
}

impl Order {
    /// Pair whose price is compared against the trigger.
    pub fn pair(&self) -> TokenPair {
        TokenPair::new(self.token_out.clone(), self.token_in.clone())
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// A leveraged position held by the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub id: u64,
    pub owner: String,
    pub token: String,
    /// Raw collateral units.
    pub collateral: u128,
    pub leverage: u32,
    /// Entry price in USD.
    pub entry_price: Decimal,
    pub size: u128,
    pub side: TradeSide,
    /// Unix seconds.
    pub created_at: u64,
    pub status: PositionStatus,
}

impl Position {
    pub fn pair(&self) -> TokenPair {
        TokenPair::new(self.token.clone(), "USD")
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// Idempotency key: at most one execution per key may be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ActionKey {
    Order(u64),
    Position(u64),
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKey::Order(id) => write!(f, "order#{}", id),
            ActionKey::Position(id) => write!(f, "position#{}", id),
        }
    }
}

/// A state-mutating call the keeper can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeeperAction {
    ExecuteOrder(u64),
    LiquidatePosition(u64),
}

impl KeeperAction {
    pub fn key(&self) -> ActionKey {
        match self {
            KeeperAction::ExecuteOrder(id) => ActionKey::Order(*id),
            KeeperAction::LiquidatePosition(id) => ActionKey::Position(*id),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            KeeperAction::ExecuteOrder(_) => "execute",
            KeeperAction::LiquidatePosition(_) => "liquidate",
        }
    }
}

impl fmt::Display for KeeperAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb(), self.key())
    }
}

/// Gas parameters for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasEstimate {
    pub gas_limit: u64,
    /// Wei per gas.
    pub gas_price: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

/// Mined transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub status: ReceiptStatus,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// Oracle state for one token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleHealth {
    pub token: String,
    pub price: Option<Decimal>,
    pub valid: bool,
    /// Seconds since the last update, when the oracle exposes it.
    pub staleness_secs: Option<u64>,
}

/// A token the keeper reports balances and prices for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: String,
    pub decimals: u32,
}
