// =============================================================================
// Exchange abstraction — one unified contract over heterogeneous venues
// =============================================================================
//
// Every adapter instance is bound to exactly one (account, market_type) pair.
// Symbol canonical form is `BASE/QUOTE`; adapters own the translation to
// their wire format.
// =============================================================================

pub mod binance;
pub mod bithumb;
pub mod korea_investment;
pub mod precision;
pub mod rate_limit;
#[cfg(test)]
pub mod testing;
pub mod upbit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::{AccountRow, Database};
use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    Balance, BatchResult, MarketInfo, MarketType, Order, OrderRequest, OrderSide, PriceQuote,
};

use rate_limit::RateLimiter;

/// A trade as the exchange reports it, before it is bound to a strategy
/// account. The reconciler keys these by `exchange_order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeTrade {
    pub exchange_order_id: String,
    pub exchange_trade_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub is_maker: bool,
    pub time: DateTime<Utc>,
}

/// Unified exchange contract. One instance per (account, market_type).
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_name(&self) -> &'static str;
    fn market_type(&self) -> MarketType;

    /// Normalized market metadata, cached ~5 min; `reload` bypasses the cache.
    async fn load_markets(&self, reload: bool) -> ExchangeResult<HashMap<String, MarketInfo>>;

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>>;

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: Option<&str>) -> ExchangeResult<Order>;

    async fn fetch_order(&self, order_id: &str, symbol: Option<&str>) -> ExchangeResult<Order>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>>;

    async fn fetch_recent_trades(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> ExchangeResult<Vec<ExchangeTrade>>;

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<PriceQuote>;

    /// Native batch where the venue supports it, sequential fallback behind
    /// the per-exchange pacing mutex otherwise.
    async fn create_batch_orders(&self, requests: &[OrderRequest]) -> ExchangeResult<BatchResult>;

    fn to_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String>;
    fn from_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String>;

    // -- user-data stream (exchanges without one keep the defaults) ----------

    async fn create_listen_key(&self) -> ExchangeResult<String> {
        Err(ExchangeError::Unsupported(format!(
            "{} has no user-data stream",
            self.exchange_name()
        )))
    }

    async fn keepalive_listen_key(&self, _listen_key: &str) -> ExchangeResult<()> {
        Err(ExchangeError::Unsupported(format!(
            "{} has no user-data stream",
            self.exchange_name()
        )))
    }

    fn user_stream_url(&self, _listen_key: &str) -> ExchangeResult<String> {
        Err(ExchangeError::Unsupported(format!(
            "{} has no user-data stream",
            self.exchange_name()
        )))
    }

    fn supports_user_stream(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Retry helper for idempotent calls
// ---------------------------------------------------------------------------

/// Base delay of the exponential backoff.
const RETRY_BASE: Duration = Duration::from_millis(250);
/// Upper bound on attempts for idempotent reads.
const RETRY_MAX_TRIES: u32 = 10;

/// Retry an idempotent operation with exponential backoff. Order placement
/// must NOT go through here — a timed-out create may have landed, and only
/// reconciliation can tell.
pub async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
{
    let mut delay = RETRY_BASE;
    let mut last_err = None;

    for attempt in 1..=RETRY_MAX_TRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < RETRY_MAX_TRIES => {
                warn!(what, attempt, error = %e, "retryable exchange error — backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| ExchangeError::Network(format!("{what}: retries exhausted"))))
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the adapter for an account. `korea_investment` needs the database to
/// share its OAuth token across callers.
pub fn build_adapter(
    account: &AccountRow,
    market_type: MarketType,
    limiter: Arc<RateLimiter>,
    db: Database,
) -> ExchangeResult<Arc<dyn ExchangeAdapter>> {
    match account.exchange.to_lowercase().as_str() {
        "binance" => Ok(Arc::new(binance::BinanceAdapter::new(
            account.api_key.clone(),
            account.api_secret.clone(),
            market_type,
            account.is_testnet,
            limiter,
        ))),
        "upbit" => match market_type {
            MarketType::Spot => Ok(Arc::new(upbit::UpbitAdapter::new(
                account.api_key.clone(),
                account.api_secret.clone(),
                limiter,
            ))),
            MarketType::Futures => Err(ExchangeError::Validation(
                "upbit has no futures market".into(),
            )),
        },
        "bithumb" => match market_type {
            MarketType::Spot => Ok(Arc::new(bithumb::BithumbAdapter::new(
                account.api_key.clone(),
                account.api_secret.clone(),
                limiter,
            ))),
            MarketType::Futures => Err(ExchangeError::Validation(
                "bithumb has no futures market".into(),
            )),
        },
        "korea_investment" | "kis" => {
            let mut adapter = korea_investment::KoreaInvestmentAdapter::new(
                account.id,
                account.api_key.clone(),
                account.api_secret.clone(),
                account.is_testnet,
                limiter,
                db,
            );
            // The CANO-ACNT_PRDT_CD pair rides in the passphrase column.
            if let Some(number) = &account.passphrase {
                adapter = adapter.with_account_number(number.clone());
            }
            Ok(Arc::new(adapter))
        }
        other => Err(ExchangeError::Validation(format!(
            "unsupported exchange: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Adapter source
// ---------------------------------------------------------------------------

/// Resolves the adapter for a binding. The live implementation caches one
/// instance per (account, market_type) so per-instance state (token refresh
/// locks, market caches) is shared by every caller.
#[async_trait]
pub trait AdapterSource: Send + Sync {
    async fn adapter_for(
        &self,
        account: &AccountRow,
        market_type: MarketType,
    ) -> ExchangeResult<Arc<dyn ExchangeAdapter>>;
}

pub struct AdapterRegistry {
    db: Database,
    limiters: Arc<rate_limit::RateLimiterRegistry>,
    cache: parking_lot::RwLock<HashMap<(i64, MarketType), Arc<dyn ExchangeAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(db: Database, limiters: Arc<rate_limit::RateLimiterRegistry>) -> Self {
        Self {
            db,
            limiters,
            cache: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AdapterSource for AdapterRegistry {
    async fn adapter_for(
        &self,
        account: &AccountRow,
        market_type: MarketType,
    ) -> ExchangeResult<Arc<dyn ExchangeAdapter>> {
        let key = (account.id, market_type);
        if let Some(adapter) = self.cache.read().get(&key) {
            return Ok(adapter.clone());
        }
        let limiter = self.limiters.for_account(&account.exchange, account.id);
        let adapter = build_adapter(account, market_type, limiter, self.db.clone())?;
        self.cache.write().insert(key, adapter.clone());
        Ok(adapter)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}
