// =============================================================================
// Shared types used across the gateway
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Venue class an order is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketType {
    Spot,
    Futures,
}

impl MarketType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SPOT" => Some(Self::Spot),
            "FUTURES" => Some(Self::Futures),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::Futures => "FUTURES",
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Parses both `BUY` and `buy` (webhook senders are inconsistent).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// +1 for BUY, -1 for SELL — the sign a fill applies to a position.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Supported order types on the unified contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopLimit,
    StopMarket,
}

impl OrderType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LIMIT" => Some(Self::Limit),
            "MARKET" => Some(Self::Market),
            "STOP_LIMIT" | "STOP" => Some(Self::StopLimit),
            "STOP_MARKET" => Some(Self::StopMarket),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
            Self::StopLimit => "STOP_LIMIT",
            Self::StopMarket => "STOP_MARKET",
        }
    }

    pub fn requires_price(&self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit)
    }

    pub fn requires_stop_price(&self) -> bool {
        matches!(self, Self::StopLimit | Self::StopMarket)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an order as seen by the gateway.
///
/// `Pending` is the local-only window between the row insert and the
/// exchange returning a real order id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "OPEN" | "NEW" | "ACCEPTED" | "WAIT" | "WATCH" => Some(Self::Open),
            "PARTIALLY_FILLED" | "PARTIAL" => Some(Self::PartiallyFilled),
            "FILLED" | "DONE" => Some(Self::Filled),
            "CANCELED" | "CANCELLED" | "CANCEL" => Some(Self::Canceled),
            "EXPIRED" => Some(Self::Expired),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Still outstanding on the exchange (or about to be).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Open | Self::PartiallyFilled)
    }

    /// Terminal — the open-order row must be deleted once this is observed.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Expired | Self::Rejected
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Unified exchange payloads
// ---------------------------------------------------------------------------

/// Normalized per-symbol market metadata from `load_markets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Canonical `BASE/QUOTE` symbol.
    pub symbol: String,
    pub base: String,
    pub quote: String,
    /// Quantity increment (e.g. 0.00001 BTC).
    pub step_size: Decimal,
    /// Price increment (e.g. 0.01 USDT).
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub max_qty: Option<Decimal>,
    pub active: bool,
}

/// Balance of a single asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Mid-market quote used for minimum-notional checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub volume: Decimal,
    pub ts: DateTime<Utc>,
}

/// What a caller asks an adapter to place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Canonical `BASE/QUOTE` symbol.
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Caller-chosen id the exchange echoes back; lets a WebSocket fill be
    /// matched to a local row before the REST response lands.
    pub client_order_id: Option<String>,
}

/// An order as reported by an exchange, normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Average fill price when the exchange reports one.
    pub average_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Canonical fill event — the single shape both the WebSocket path and the
/// reconciliation path produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub strategy_account_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub exchange_trade_id: Option<String>,
    pub exchange_order_id: String,
    pub commission: Decimal,
    pub is_maker: bool,
    pub execution_time: DateTime<Utc>,
    pub market_type: MarketType,
}

/// Outcome of one entry in a batch-order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntryResult {
    pub order_index: usize,
    pub success: bool,
    pub order_id: Option<String>,
    pub order: Option<Order>,
    pub error: Option<String>,
}

/// How a batch was actually executed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchImplementation {
    NativeBatch,
    SequentialFallback,
}

/// Aggregate result of `create_batch_orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub success: bool,
    pub results: Vec<BatchEntryResult>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub implementation: BatchImplementation,
}

impl BatchResult {
    pub fn from_entries(
        results: Vec<BatchEntryResult>,
        implementation: BatchImplementation,
    ) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            success: successful == total,
            failed: total - successful,
            total,
            successful,
            results,
            implementation,
        }
    }
}
