// =============================================================================
// Row types for the persistence layer
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{MarketType, OrderSide, OrderStatus, OrderType};

use super::{dec_from_sql, opt_dec_from_sql};

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_enum<T>(raw: String, parse: fn(&str) -> Option<T>, what: &str) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid {what}: {raw}").into(),
        )
    })
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub is_active: bool,
}

impl UserRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            username: row.get("username")?,
            is_admin: row.get("is_admin")?,
            is_active: row.get("is_active")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub exchange: String,
    pub account_type: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
    pub is_testnet: bool,
    pub is_active: bool,
}

impl AccountRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            exchange: row.get("exchange")?,
            account_type: row.get("account_type")?,
            api_key: row.get("api_key")?,
            api_secret: row.get("api_secret")?,
            passphrase: row.get("passphrase")?,
            is_testnet: row.get("is_testnet")?,
            is_active: row.get("is_active")?,
        })
    }

    /// Securities accounts serialize order submission and need token storage.
    pub fn is_securities(&self) -> bool {
        self.account_type.starts_with("SECURITIES")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub group_name: String,
    #[serde(skip_serializing)]
    pub webhook_token: String,
    pub market_type: MarketType,
    pub is_active: bool,
    pub is_public: bool,
}

impl StrategyRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            group_name: row.get("group_name")?,
            webhook_token: row.get("webhook_token")?,
            market_type: parse_enum(row.get("market_type")?, MarketType::parse, "market_type")?,
            is_active: row.get("is_active")?,
            is_public: row.get("is_public")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAccountRow {
    pub id: i64,
    pub strategy_id: i64,
    pub account_id: i64,
    pub weight: Decimal,
    pub is_active: bool,
}

impl StrategyAccountRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            strategy_id: row.get("strategy_id")?,
            account_id: row.get("account_id")?,
            weight: dec_from_sql(&row.get::<_, String>("weight")?)?,
            is_active: row.get("is_active")?,
        })
    }
}

/// A strategy-account binding joined with its account — what the dispatcher
/// fans out over.
#[derive(Debug, Clone)]
pub struct BindingRow {
    pub strategy_account: StrategyAccountRow,
    pub account: AccountRow,
}

// ---------------------------------------------------------------------------
// Orders & fills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrderRow {
    pub id: i64,
    pub strategy_account_id: i64,
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    pub market_type: MarketType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OpenOrderRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            strategy_account_id: row.get("strategy_account_id")?,
            exchange_order_id: row.get("exchange_order_id")?,
            client_order_id: row.get("client_order_id")?,
            symbol: row.get("symbol")?,
            side: parse_enum(row.get("side")?, OrderSide::parse, "side")?,
            order_type: parse_enum(row.get("order_type")?, OrderType::parse, "order_type")?,
            price: opt_dec_from_sql(row.get("price")?)?,
            stop_price: opt_dec_from_sql(row.get("stop_price")?)?,
            quantity: dec_from_sql(&row.get::<_, String>("quantity")?)?,
            filled_quantity: dec_from_sql(&row.get::<_, String>("filled_quantity")?)?,
            status: parse_enum(row.get("status")?, OrderStatus::parse, "status")?,
            market_type: parse_enum(row.get("market_type")?, MarketType::parse, "market_type")?,
            created_at: parse_ts(row.get("created_at")?)?,
            updated_at: parse_ts(row.get("updated_at")?)?,
        })
    }

    /// True while the exchange id is still the local placeholder.
    pub fn has_placeholder_id(&self) -> bool {
        self.exchange_order_id.starts_with(super::orders::PENDING_ID_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecutionRow {
    pub id: i64,
    pub strategy_account_id: Option<i64>,
    pub exchange_order_id: String,
    pub exchange_trade_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub execution_price: Decimal,
    pub execution_quantity: Decimal,
    pub commission: Decimal,
    pub is_maker: bool,
    pub execution_time: DateTime<Utc>,
    pub market_type: MarketType,
    pub realized_pnl: Option<Decimal>,
}

impl TradeExecutionRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            strategy_account_id: row.get("strategy_account_id")?,
            exchange_order_id: row.get("exchange_order_id")?,
            exchange_trade_id: row.get("exchange_trade_id")?,
            symbol: row.get("symbol")?,
            side: parse_enum(row.get("side")?, OrderSide::parse, "side")?,
            execution_price: dec_from_sql(&row.get::<_, String>("execution_price")?)?,
            execution_quantity: dec_from_sql(&row.get::<_, String>("execution_quantity")?)?,
            commission: dec_from_sql(&row.get::<_, String>("commission")?)?,
            is_maker: row.get("is_maker")?,
            execution_time: parse_ts(row.get("execution_time")?)?,
            market_type: parse_enum(row.get("market_type")?, MarketType::parse, "market_type")?,
            realized_pnl: opt_dec_from_sql(row.get("realized_pnl")?)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPositionRow {
    pub id: i64,
    pub strategy_account_id: i64,
    pub symbol: String,
    /// Signed; zero is the canonical flat marker.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl StrategyPositionRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            strategy_account_id: row.get("strategy_account_id")?,
            symbol: row.get("symbol")?,
            quantity: dec_from_sql(&row.get::<_, String>("quantity")?)?,
            entry_price: dec_from_sql(&row.get::<_, String>("entry_price")?)?,
            realized_pnl: dec_from_sql(&row.get::<_, String>("realized_pnl")?)?,
            updated_at: parse_ts(row.get("updated_at")?)?,
        })
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyCapitalRow {
    pub id: i64,
    pub strategy_account_id: i64,
    pub allocated_capital: Decimal,
    pub realized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl StrategyCapitalRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            strategy_account_id: row.get("strategy_account_id")?,
            allocated_capital: dec_from_sql(&row.get::<_, String>("allocated_capital")?)?,
            realized_pnl: dec_from_sql(&row.get::<_, String>("realized_pnl")?)?,
            updated_at: parse_ts(row.get("updated_at")?)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Failure tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedOrderStatus {
    PendingRetry,
    Retrying,
    Exhausted,
    Removed,
}

impl FailedOrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_retry" => Some(Self::PendingRetry),
            "retrying" => Some(Self::Retrying),
            "exhausted" => Some(Self::Exhausted),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingRetry => "pending_retry",
            Self::Retrying => "retrying",
            Self::Exhausted => "exhausted",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOrderRow {
    pub id: i64,
    pub strategy_account_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub market_type: MarketType,
    pub reason: String,
    pub exchange_error: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub status: FailedOrderStatus,
    pub created_at: DateTime<Utc>,
}

impl FailedOrderRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            strategy_account_id: row.get("strategy_account_id")?,
            symbol: row.get("symbol")?,
            side: parse_enum(row.get("side")?, OrderSide::parse, "side")?,
            order_type: parse_enum(row.get("order_type")?, OrderType::parse, "order_type")?,
            quantity: dec_from_sql(&row.get::<_, String>("quantity")?)?,
            price: opt_dec_from_sql(row.get("price")?)?,
            stop_price: opt_dec_from_sql(row.get("stop_price")?)?,
            market_type: parse_enum(row.get("market_type")?, MarketType::parse, "market_type")?,
            reason: row.get("reason")?,
            exchange_error: row.get("exchange_error")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            status: parse_enum(row.get("status")?, FailedOrderStatus::parse, "status")?,
            created_at: parse_ts(row.get("created_at")?)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelQueueStatus {
    Pending,
    Success,
    Failed,
}

impl CancelQueueStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelQueueRow {
    pub id: i64,
    /// exchange_order_id (possibly still the PENDING placeholder) of the
    /// order the cancel targets.
    pub order_ref: String,
    pub status: CancelQueueStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CancelQueueRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            order_ref: row.get("order_ref")?,
            status: parse_enum(row.get("status")?, CancelQueueStatus::parse, "status")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            next_retry_at: parse_ts(row.get("next_retry_at")?)?,
            error_message: row.get("error_message")?,
            created_at: parse_ts(row.get("created_at")?)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Securities token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritiesTokenRow {
    pub id: i64,
    pub account_id: i64,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
}

impl SecuritiesTokenRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            access_token: row.get("access_token")?,
            token_type: row.get("token_type")?,
            expires_at: parse_ts(row.get("expires_at")?)?,
            last_refreshed_at: parse_ts(row.get("last_refreshed_at")?)?,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
