// =============================================================================
// Upbit Adapter — KRW spot over JWT-authenticated REST
// =============================================================================
//
// Auth is a per-request JWT (HS256): payload carries access_key and a UUIDv4
// nonce, plus a SHA-512 hash of the URL-encoded query when parameters are
// present. Query values are typed primitives by construction — nothing else
// can reach the hash input.
//
// Upbit has no batch endpoint and no user-data stream; batches run
// sequentially behind the pacing mutex (125 ms/order) and fills surface via
// reconciliation.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use sha2::{Digest, Sha512};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    Balance, BatchEntryResult, BatchImplementation, BatchResult, MarketInfo, MarketType, Order,
    OrderRequest, OrderSide, OrderStatus, OrderType, PriceQuote,
};

use super::precision::{krw_tick_size, MarketCache};
use super::rate_limit::RateLimiter;
use super::{with_retry, ExchangeAdapter, ExchangeTrade};

const BASE_URL: &str = "https://api.upbit.com/v1";

/// Minimum order notional on KRW markets.
const KRW_MIN_NOTIONAL: Decimal = dec!(5000);

/// A query parameter value that may participate in the signed hash. Only
/// these primitives exist; arbitrary structures cannot be smuggled into the
/// hash input.
#[derive(Debug, Clone)]
pub enum QueryValue {
    Str(String),
    Int(i64),
    Dec(Decimal),
    Bool(bool),
}

impl QueryValue {
    fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Dec(d) => d.normalize().to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for QueryValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<Decimal> for QueryValue {
    fn from(v: Decimal) -> Self {
        Self::Dec(v)
    }
}

impl From<bool> for QueryValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// URL-encode params the way the hash expects them (`doseq` semantics: each
/// pair rendered independently, insertion order preserved).
pub(crate) fn encode_query(params: &[(&str, QueryValue)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, &value.render());
    }
    serializer.finish()
}

#[derive(Serialize)]
struct JwtClaims {
    access_key: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

pub struct UpbitAdapter {
    access_key: String,
    secret_key: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    markets: MarketCache,
}

impl UpbitAdapter {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            client,
            limiter,
            markets: MarketCache::new(),
        }
    }

    /// Per-request JWT. With params, the SHA-512 hash of the encoded query is
    /// embedded so the server can verify integrity.
    fn jwt_token(&self, query: Option<&str>) -> ExchangeResult<String> {
        let (query_hash, query_hash_alg) = match query {
            Some(q) if !q.is_empty() => {
                let mut hasher = Sha512::new();
                hasher.update(q.as_bytes());
                (Some(hex::encode(hasher.finalize())), Some("SHA512"))
            }
            _ => (None, None),
        };

        let claims = JwtClaims {
            access_key: self.access_key.clone(),
            nonce: Uuid::new_v4().to_string(),
            query_hash,
            query_hash_alg,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret_key.as_bytes()),
        )
        .map_err(|e| ExchangeError::Auth(format!("jwt encode failed: {e}")))
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, QueryValue)],
    ) -> ExchangeResult<serde_json::Value> {
        self.limiter.wait_if_needed().await;

        let query = encode_query(params);
        let token = self.jwt_token(Some(query.as_str()).filter(|q| !q.is_empty()))?;
        let url = if query.is_empty() {
            format!("{BASE_URL}{path}")
        } else {
            format!("{BASE_URL}{path}?{query}")
        };

        let resp = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            let msg = body["error"]["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| body.to_string());
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ExchangeError::Auth(msg));
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ExchangeError::OrderNotFound(msg));
            }
            return Err(ExchangeError::from_exchange_message(msg));
        }
        Ok(body)
    }

    fn parse_decimal(value: &serde_json::Value) -> Decimal {
        value
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .or_else(|| value.as_f64().and_then(|f| Decimal::try_from(f).ok()))
            .unwrap_or(Decimal::ZERO)
    }

    fn parse_state(state: &str) -> OrderStatus {
        match state {
            "wait" | "watch" => OrderStatus::Open,
            "done" => OrderStatus::Filled,
            "cancel" => OrderStatus::Canceled,
            _ => OrderStatus::Open,
        }
    }

    fn parse_order(&self, value: &serde_json::Value) -> ExchangeResult<Order> {
        let uuid = value["uuid"]
            .as_str()
            .ok_or_else(|| ExchangeError::Parse("order uuid missing".into()))?;
        let market = value["market"]
            .as_str()
            .ok_or_else(|| ExchangeError::Parse("order market missing".into()))?;

        let side = match value["side"].as_str() {
            Some("bid") => OrderSide::Buy,
            Some("ask") => OrderSide::Sell,
            other => {
                return Err(ExchangeError::Parse(format!("unknown upbit side {other:?}")))
            }
        };
        let order_type = match value["ord_type"].as_str() {
            Some("limit") => OrderType::Limit,
            _ => OrderType::Market,
        };

        let volume = Self::parse_decimal(&value["volume"]);
        let executed = Self::parse_decimal(&value["executed_volume"]);
        let state = value["state"].as_str().unwrap_or("wait");
        let mut status = Self::parse_state(state);
        if status == OrderStatus::Open && !executed.is_zero() {
            status = OrderStatus::PartiallyFilled;
        }

        let created = value["created_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Order {
            order_id: uuid.to_string(),
            client_order_id: value["identifier"].as_str().map(|s| s.to_string()),
            symbol: self.from_exchange_symbol(market)?,
            side,
            order_type,
            status,
            price: Some(Self::parse_decimal(&value["price"])).filter(|p| !p.is_zero()),
            stop_price: None,
            quantity: volume,
            filled_quantity: executed,
            average_price: None,
            timestamp: created,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for UpbitAdapter {
    fn exchange_name(&self) -> &'static str {
        "upbit"
    }

    fn market_type(&self) -> MarketType {
        MarketType::Spot
    }

    async fn load_markets(&self, reload: bool) -> ExchangeResult<HashMap<String, MarketInfo>> {
        if !reload {
            if let Some(cached) = self.markets.get() {
                return Ok(cached);
            }
        }

        let body = with_retry("upbit market/all", || async {
            let url = format!("{BASE_URL}/market/all");
            let resp = self.client.get(&url).send().await?;
            Ok::<serde_json::Value, ExchangeError>(resp.json().await?)
        })
        .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("market/all is not an array".into()))?;

        let mut markets = HashMap::new();
        for entry in entries {
            let wire = entry["market"].as_str().unwrap_or_default();
            let Some((quote, base)) = wire.split_once('-') else {
                continue;
            };
            // Rule-based precision: KRW markets quote to the price-band tick;
            // volume precision is 8 decimals across the venue.
            let canonical = format!("{base}/{quote}");
            markets.insert(
                canonical.clone(),
                MarketInfo {
                    symbol: canonical,
                    base: base.to_string(),
                    quote: quote.to_string(),
                    step_size: dec!(0.00000001),
                    tick_size: Decimal::ZERO, // price-dependent, see krw_tick_size
                    min_qty: Decimal::ZERO,
                    min_notional: if quote == "KRW" {
                        KRW_MIN_NOTIONAL
                    } else {
                        Decimal::ZERO
                    },
                    max_qty: None,
                    active: true,
                },
            );
        }
        self.markets.put(markets.clone());
        Ok(markets)
    }

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>> {
        let body = self.send(reqwest::Method::GET, "/accounts", &[]).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("accounts is not an array".into()))?;
        let mut balances = HashMap::new();
        for entry in entries {
            let asset = entry["currency"].as_str().unwrap_or_default().to_string();
            let free = Self::parse_decimal(&entry["balance"]);
            let locked = Self::parse_decimal(&entry["locked"]);
            if !free.is_zero() || !locked.is_zero() {
                balances.insert(asset.clone(), Balance { asset, free, locked });
            }
        }
        Ok(balances)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        let market = self.to_exchange_symbol(&request.symbol)?;
        let side = match request.side {
            OrderSide::Buy => "bid",
            OrderSide::Sell => "ask",
        };

        let mut params: Vec<(&str, QueryValue)> = vec![
            ("market", market.as_str().into()),
            ("side", side.into()),
        ];

        match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    ExchangeError::Validation("LIMIT order requires a price".into())
                })?;
                let tick = krw_tick_size(price);
                params.push(("volume", request.quantity.into()));
                params.push(("price", super::precision::floor_to_step(price, tick).into()));
                params.push(("ord_type", "limit".into()));
            }
            OrderType::Market => match request.side {
                // Market buys are quoted in total KRW; convert through the
                // latest trade price.
                OrderSide::Buy => {
                    let quote = self.fetch_quote(&request.symbol).await?;
                    let cost = (request.quantity * quote.last).floor();
                    if cost < KRW_MIN_NOTIONAL {
                        return Err(ExchangeError::MinNotional(format!(
                            "market buy notional {cost} below minimum {KRW_MIN_NOTIONAL}"
                        )));
                    }
                    params.push(("price", cost.into()));
                    params.push(("ord_type", "price".into()));
                }
                OrderSide::Sell => {
                    params.push(("volume", request.quantity.into()));
                    params.push(("ord_type", "market".into()));
                }
            },
            OrderType::StopLimit | OrderType::StopMarket => {
                return Err(ExchangeError::Validation(
                    "upbit does not support stop orders".into(),
                ));
            }
        }

        if let Some(client_id) = &request.client_order_id {
            params.push(("identifier", client_id.as_str().into()));
        }

        debug!(market = %market, side, "placing upbit order");
        let body = self.send(reqwest::Method::POST, "/orders", &params).await?;
        self.parse_order(&body)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: Option<&str>) -> ExchangeResult<Order> {
        let params = [("uuid", QueryValue::from(order_id))];
        let body = self.send(reqwest::Method::DELETE, "/order", &params).await?;
        self.parse_order(&body)
    }

    async fn fetch_order(&self, order_id: &str, _symbol: Option<&str>) -> ExchangeResult<Order> {
        let params = [("uuid", QueryValue::from(order_id))];
        let body = with_retry("upbit fetch_order", || {
            self.send(reqwest::Method::GET, "/order", &params)
        })
        .await?;
        self.parse_order(&body)
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>> {
        let mut params: Vec<(&str, QueryValue)> = vec![("state", "wait".into())];
        let market;
        if let Some(symbol) = symbol {
            market = self.to_exchange_symbol(symbol)?;
            params.push(("market", market.as_str().into()));
        }
        let body = with_retry("upbit open orders", || {
            self.send(reqwest::Method::GET, "/orders", &params)
        })
        .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("orders is not an array".into()))?;
        entries.iter().map(|v| self.parse_order(v)).collect()
    }

    async fn fetch_recent_trades(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> ExchangeResult<Vec<ExchangeTrade>> {
        let mut params: Vec<(&str, QueryValue)> = vec![
            ("state", "done".into()),
            ("limit", (limit as i64).into()),
        ];
        let market;
        if let Some(symbol) = symbol {
            market = self.to_exchange_symbol(symbol)?;
            params.push(("market", market.as_str().into()));
        }
        let body = with_retry("upbit done orders", || {
            self.send(reqwest::Method::GET, "/orders", &params)
        })
        .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("orders is not an array".into()))?;

        // Upbit reports per-order cumulative executions rather than discrete
        // trades; a stable synthetic trade id keeps the dedup idempotent.
        let mut trades = Vec::new();
        for entry in entries {
            let order = self.parse_order(entry)?;
            if order.filled_quantity.is_zero() {
                continue;
            }
            let price = order
                .average_price
                .or(order.price)
                .unwrap_or(Decimal::ZERO);
            trades.push(ExchangeTrade {
                exchange_order_id: order.order_id.clone(),
                exchange_trade_id: Some(format!("{}-fill", order.order_id)),
                symbol: order.symbol.clone(),
                side: order.side,
                price,
                quantity: order.filled_quantity,
                commission: Self::parse_decimal(&entry["paid_fee"]),
                is_maker: false,
                time: order.timestamp,
            });
        }
        Ok(trades)
    }

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<PriceQuote> {
        let market = self.to_exchange_symbol(symbol)?;
        let body = with_retry("upbit ticker", || async {
            let url = format!("{BASE_URL}/ticker?markets={market}");
            let resp = self.client.get(&url).send().await?;
            Ok::<serde_json::Value, ExchangeError>(resp.json().await?)
        })
        .await?;
        let entry = body
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| ExchangeError::Parse("ticker response empty".into()))?;
        Ok(PriceQuote {
            symbol: symbol.to_string(),
            last: Self::parse_decimal(&entry["trade_price"]),
            bid: None,
            ask: None,
            volume: Self::parse_decimal(&entry["acc_trade_volume_24h"]),
            ts: Utc::now(),
        })
    }

    async fn create_batch_orders(&self, requests: &[OrderRequest]) -> ExchangeResult<BatchResult> {
        // No native batch: sequential orders behind the 125 ms pacing mutex.
        let mut results = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            self.limiter.pace().await;
            match self.create_order(request).await {
                Ok(order) => results.push(BatchEntryResult {
                    order_index: index,
                    success: true,
                    order_id: Some(order.order_id.clone()),
                    order: Some(order),
                    error: None,
                }),
                Err(e) => results.push(BatchEntryResult {
                    order_index: index,
                    success: false,
                    order_id: None,
                    order: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(BatchResult::from_entries(
            results,
            BatchImplementation::SequentialFallback,
        ))
    }

    fn to_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String> {
        // Canonical BASE/QUOTE becomes QUOTE-BASE (KRW-BTC).
        match symbol.split_once('/') {
            Some((base, quote)) => Ok(format!(
                "{}-{}",
                quote.to_uppercase(),
                base.to_uppercase()
            )),
            None if symbol.contains('-') => Ok(symbol.to_uppercase()),
            None => Err(ExchangeError::Validation(format!(
                "cannot convert symbol {symbol} to upbit format"
            ))),
        }
    }

    fn from_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String> {
        match symbol.split_once('-') {
            Some((quote, base)) => Ok(format!(
                "{}/{}",
                base.to_uppercase(),
                quote.to_uppercase()
            )),
            None if symbol.contains('/') => Ok(symbol.to_uppercase()),
            None => Err(ExchangeError::Validation(format!(
                "cannot normalize upbit symbol {symbol}"
            ))),
        }
    }
}

impl std::fmt::Debug for UpbitAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpbitAdapter")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
