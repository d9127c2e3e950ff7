use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyMode {
    Deterministic,
    MlLight,
    LlmReasoning,
}

impl StrategyMode {
    /// Multiplier applied in the signal-strength formula.
    pub fn mult(&self) -> Decimal {
        match self {
            StrategyMode::Deterministic => Decimal::new(10, 1),
            StrategyMode::MlLight => Decimal::new(12, 1),
            StrategyMode::LlmReasoning => Decimal::new(15, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
    Extreme,
}

impl Strength {
    pub fn mult(&self) -> Decimal {
        match self {
            Strength::Weak => Decimal::new(5, 1),
            Strength::Medium => Decimal::new(10, 1),
            Strength::Strong => Decimal::new(15, 1),
            Strength::Extreme => Decimal::new(20, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Buy => Some(PositionSide::Long),
            Action::Sell => Some(PositionSide::Short),
            Action::Hold => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TakeProfit,
    TakeProfitLimit,
}

impl OrderType {
    pub fn requires_target_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit | OrderType::TakeProfitLimit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GTC,
    IOC,
    FOK,
    GTX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
    Expired,
}

impl OrderStatus {
    /// `NEW` counts as a successfully-placed resting order for non-market types.
    pub fn is_placed(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::Filled)
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Canceled | OrderStatus::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    Manual,
    Partial,
    Liquidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    Hedge,
    OneWay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalConflictResolution {
    StrongestWins,
    FirstComeFirstServed,
    WeightedAverage,
    ManualReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameDirectionConflictResolution {
    Accumulate,
    StrongestWins,
    RejectDuplicates,
}

/// Inbound trading signal from an upstream strategy. Mirrors the wire
/// envelope in the external-interface contract field-for-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    #[serde(default = "default_strategy_mode")]
    pub strategy_mode: StrategyMode,
    pub symbol: String,
    pub action: Action,
    pub confidence: Decimal,
    #[serde(default = "default_strength")]
    pub strength: Strength,
    pub current_price: Decimal,
    pub target_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub position_size_pct: Option<Decimal>,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    pub timeframe: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub model_confidence: Option<Decimal>,
    pub reasoning: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_strategy_mode() -> StrategyMode {
    StrategyMode::Deterministic
}

fn default_strength() -> Strength {
    Strength::Medium
}

impl Signal {
    /// `strength = confidence · strategy_weight · strength_mult · mode_mult`.
    pub fn score(&self, strategy_weight: Decimal) -> Decimal {
        self.confidence * strategy_weight * self.strength.mult() * self.strategy_mode.mult()
    }
}

/// Derived, exchange-ready order. Produced by `signal_to_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOrder {
    pub order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub target_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub position_id: Uuid,
    pub position_side: Option<PositionSide>,
    pub reduce_only: bool,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub strategy_id: String,
    pub strategy_metadata: HashMap<String, serde_json::Value>,
}

/// Result of a gateway `place_order` / `get_order` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub fill_price: Option<Decimal>,
    pub fill_qty: Option<Decimal>,
    pub commission: Decimal,
}

/// Exchange symbol trading filters: granularity the gateway must round to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub price_precision: u32,
    pub qty_precision: u32,
}

/// Physical position, keyed by `(symbol, position_side)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_time: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub commission: Decimal,
    pub status: PositionLifecycle,
    pub stop_loss_order_id: Option<Uuid>,
    pub take_profit_order_id: Option<Uuid>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionLifecycle {
    Open,
    Closed,
}

impl Position {
    pub fn key(symbol: &str, side: PositionSide) -> String {
        format!("{}_{}", symbol, side)
    }

    pub fn exchange_key(&self) -> String {
        Self::key(&self.symbol, self.side)
    }

    /// Unrealized PnL against a mark price, LONG positive on rallies.
    pub fn unrealized_at(&self, mark_price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (mark_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - mark_price) * self.quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPositionStatus {
    Open,
    Closed,
    Partial,
}

/// Virtual per-strategy position layered over a physical `Position`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPosition {
    pub strategy_position_id: Uuid,
    pub strategy_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_time: DateTime<Utc>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub status: StrategyPositionStatus,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: Option<Decimal>,
}

impl StrategyPosition {
    pub fn exchange_position_key(&self) -> String {
        Position::key(&self.symbol, self.side)
    }

    /// PnL against this strategy's OWN entry, never the aggregate VWAP.
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (exit_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - exit_price) * self.quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionStatus {
    Open,
    Closed,
}

/// One ledger row attributing a slice of a physical position to a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionContribution {
    pub contribution_id: Uuid,
    pub strategy_position_id: Uuid,
    pub exchange_position_key: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub position_sequence: u32,
    pub exchange_qty_before: Decimal,
    pub exchange_qty_after: Decimal,
    pub status: ContributionStatus,
    pub close_exit_price: Option<Decimal>,
    pub close_realized_pnl: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangePositionStatus {
    Open,
    Closed,
}

/// Aggregate physical position across all contributing strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub exchange_position_key: String,
    pub symbol: String,
    pub side: PositionSide,
    pub current_quantity: Decimal,
    pub weighted_avg_entry: Decimal,
    pub unrealized_pnl: Decimal,
    pub contributors: Vec<String>,
    pub total_contributions: u32,
    pub status: ExchangePositionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcoPairStatus {
    Active,
    Completed,
    Cancelled,
}

/// A synthesized SL/TP pair attributed to one strategy position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoPair {
    pub strategy_position_id: Uuid,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub sl_order_id: Option<Uuid>,
    pub tp_order_id: Option<Uuid>,
    pub status: OcoPairStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDecision {
    Executed,
    Rejected,
    PendingReview,
    Expired,
    Simulated,
}

/// Outbound response envelope returned by the dispatcher for one signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResponse {
    pub status: SignalDecision,
    pub reason: String,
    pub order_id: Option<Uuid>,
    pub position_id: Option<Uuid>,
    pub strategy_position_id: Option<Uuid>,
    pub fills: Vec<Fill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
}
