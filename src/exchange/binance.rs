// =============================================================================
// Binance Adapter — spot and USD-M futures over HMAC-SHA256 signed REST
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms; timestamps are
// offset by a cached server-time delta to tolerate clock drift.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    Balance, BatchEntryResult, BatchImplementation, BatchResult, MarketInfo, MarketType, Order,
    OrderRequest, OrderSide, OrderStatus, OrderType, PriceQuote,
};

use super::precision::MarketCache;
use super::rate_limit::RateLimiter;
use super::{with_retry, ExchangeAdapter, ExchangeTrade};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Futures native batch endpoint accepts at most this many orders per call.
const FUTURES_BATCH_LIMIT: usize = 5;

/// Binance REST adapter bound to one account and one market type.
pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    market_type: MarketType,
    base_url: String,
    ws_base: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    markets: MarketCache,
    /// Server-time minus local-time, milliseconds.
    time_offset_ms: AtomicI64,
}

impl BinanceAdapter {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        market_type: MarketType,
        is_testnet: bool,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (base_url, ws_base) = match (market_type, is_testnet) {
            (MarketType::Spot, false) => (
                "https://api.binance.com".to_string(),
                "wss://stream.binance.com:9443/ws".to_string(),
            ),
            (MarketType::Spot, true) => (
                "https://testnet.binance.vision".to_string(),
                "wss://testnet.binance.vision/ws".to_string(),
            ),
            (MarketType::Futures, false) => (
                "https://fapi.binance.com".to_string(),
                "wss://fstream.binance.com/ws".to_string(),
            ),
            (MarketType::Futures, true) => (
                "https://testnet.binancefuture.com".to_string(),
                "wss://stream.binancefuture.com/ws".to_string(),
            ),
        };

        debug!(base_url = %base_url, market_type = %market_type, "BinanceAdapter initialised");

        Self {
            api_key,
            secret: secret.into(),
            market_type,
            base_url,
            ws_base,
            client,
            limiter,
            markets: MarketCache::new(),
            time_offset_ms: AtomicI64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn api_prefix(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "/api/v3",
            MarketType::Futures => "/fapi/v1",
        }
    }

    /// Refresh the cached server-time offset.
    pub async fn sync_server_time(&self) -> ExchangeResult<()> {
        let url = format!("{}{}/time", self.base_url, self.api_prefix());
        let before = Utc::now().timestamp_millis();
        let body: serde_json::Value = self.client.get(&url).send().await?.json().await?;
        let after = Utc::now().timestamp_millis();
        let server = body["serverTime"]
            .as_i64()
            .ok_or_else(|| ExchangeError::Parse("serverTime missing".into()))?;
        let offset = server - (before + after) / 2;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "server time synchronised");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> ExchangeResult<serde_json::Value> {
        self.limiter.wait_if_needed().await;

        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.request(method, &url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            let msg = body["msg"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| body.to_string());
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(ExchangeError::Auth(msg));
            }
            if body["code"].as_i64() == Some(-2013) {
                // "Order does not exist."
                return Err(ExchangeError::OrderNotFound(msg));
            }
            return Err(ExchangeError::from_exchange_message(msg));
        }

        Ok(body)
    }

    async fn send_public(&self, path: &str, query: &str) -> ExchangeResult<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            let msg = body["msg"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| body.to_string());
            return Err(ExchangeError::from_exchange_message(msg));
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Wire parsing
    // -------------------------------------------------------------------------

    fn parse_decimal(value: &serde_json::Value) -> ExchangeResult<Decimal> {
        if let Some(s) = value.as_str() {
            Decimal::from_str(s)
                .map_err(|e| ExchangeError::Parse(format!("bad decimal '{s}': {e}")))
        } else if let Some(f) = value.as_f64() {
            Decimal::try_from(f).map_err(|e| ExchangeError::Parse(format!("bad decimal {f}: {e}")))
        } else {
            Err(ExchangeError::Parse(format!(
                "expected decimal, got {value}"
            )))
        }
    }

    fn order_type_param(&self, order_type: OrderType) -> &'static str {
        match (self.market_type, order_type) {
            (_, OrderType::Limit) => "LIMIT",
            (_, OrderType::Market) => "MARKET",
            (MarketType::Spot, OrderType::StopLimit) => "STOP_LOSS_LIMIT",
            (MarketType::Spot, OrderType::StopMarket) => "STOP_LOSS",
            (MarketType::Futures, OrderType::StopLimit) => "STOP",
            (MarketType::Futures, OrderType::StopMarket) => "STOP_MARKET",
        }
    }

    fn parse_order_type(raw: &str) -> OrderType {
        match raw {
            "STOP_LOSS_LIMIT" | "STOP" | "TAKE_PROFIT_LIMIT" => OrderType::StopLimit,
            "STOP_LOSS" | "STOP_MARKET" | "TAKE_PROFIT_MARKET" => OrderType::StopMarket,
            "MARKET" => OrderType::Market,
            _ => OrderType::Limit,
        }
    }

    fn parse_order(&self, value: &serde_json::Value) -> ExchangeResult<Order> {
        let order_id = value["orderId"]
            .as_i64()
            .map(|id| id.to_string())
            .or_else(|| value["orderId"].as_str().map(|s| s.to_string()))
            .ok_or_else(|| ExchangeError::Parse("orderId missing".into()))?;

        let symbol_raw = value["symbol"]
            .as_str()
            .ok_or_else(|| ExchangeError::Parse("symbol missing".into()))?;

        let status_raw = value["status"].as_str().unwrap_or("NEW");
        let status = OrderStatus::parse(status_raw)
            .ok_or_else(|| ExchangeError::Parse(format!("unknown status {status_raw}")))?;

        let side_raw = value["side"].as_str().unwrap_or("BUY");
        let side = OrderSide::parse(side_raw)
            .ok_or_else(|| ExchangeError::Parse(format!("unknown side {side_raw}")))?;

        let price = Self::parse_decimal(&value["price"]).ok().filter(|p| !p.is_zero());
        let stop_price = Self::parse_decimal(&value["stopPrice"])
            .ok()
            .filter(|p| !p.is_zero());
        let quantity = Self::parse_decimal(&value["origQty"])?;
        let filled = Self::parse_decimal(&value["executedQty"]).unwrap_or(Decimal::ZERO);
        let average_price = Self::parse_decimal(&value["avgPrice"])
            .ok()
            .filter(|p| !p.is_zero());

        let ts_ms = value["updateTime"]
            .as_i64()
            .or_else(|| value["transactTime"].as_i64())
            .or_else(|| value["time"].as_i64())
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let timestamp = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(Order {
            order_id,
            client_order_id: value["clientOrderId"].as_str().map(|s| s.to_string()),
            symbol: self.from_exchange_symbol(symbol_raw)?,
            side,
            order_type: Self::parse_order_type(value["type"].as_str().unwrap_or("LIMIT")),
            status,
            price,
            stop_price,
            quantity,
            filled_quantity: filled,
            average_price,
            timestamp,
        })
    }

    fn order_params(&self, request: &OrderRequest) -> ExchangeResult<String> {
        let symbol = self.to_exchange_symbol(&request.symbol)?;
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            symbol,
            request.side.as_str(),
            self.order_type_param(request.order_type),
            request.quantity.normalize(),
        );
        if let Some(price) = request.price {
            params.push_str(&format!("&price={}", price.normalize()));
        }
        if let Some(stop) = request.stop_price {
            params.push_str(&format!("&stopPrice={}", stop.normalize()));
        }
        if request.order_type.requires_price() {
            params.push_str("&timeInForce=GTC");
        }
        if let Some(client_id) = &request.client_order_id {
            params.push_str(&format!("&newClientOrderId={client_id}"));
        }
        Ok(params)
    }

    fn parse_exchange_info(&self, body: &serde_json::Value) -> ExchangeResult<HashMap<String, MarketInfo>> {
        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("exchangeInfo missing 'symbols'".into()))?;

        let mut markets = HashMap::with_capacity(symbols.len());
        for entry in symbols {
            let base = entry["baseAsset"].as_str().unwrap_or_default();
            let quote = entry["quoteAsset"].as_str().unwrap_or_default();
            if base.is_empty() || quote.is_empty() {
                continue;
            }
            let canonical = format!("{base}/{quote}");

            let mut step_size = Decimal::ZERO;
            let mut tick_size = Decimal::ZERO;
            let mut min_qty = Decimal::ZERO;
            let mut max_qty = None;
            let mut min_notional = Decimal::ZERO;

            if let Some(filters) = entry["filters"].as_array() {
                for filter in filters {
                    match filter["filterType"].as_str() {
                        Some("LOT_SIZE") => {
                            step_size =
                                Self::parse_decimal(&filter["stepSize"]).unwrap_or(Decimal::ZERO);
                            min_qty =
                                Self::parse_decimal(&filter["minQty"]).unwrap_or(Decimal::ZERO);
                            max_qty = Self::parse_decimal(&filter["maxQty"]).ok();
                        }
                        Some("PRICE_FILTER") => {
                            tick_size =
                                Self::parse_decimal(&filter["tickSize"]).unwrap_or(Decimal::ZERO);
                        }
                        Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                            min_notional = Self::parse_decimal(&filter["minNotional"])
                                .unwrap_or(Decimal::ZERO);
                        }
                        _ => {}
                    }
                }
            }

            let active = matches!(entry["status"].as_str(), Some("TRADING"));
            markets.insert(
                canonical.clone(),
                MarketInfo {
                    symbol: canonical,
                    base: base.to_string(),
                    quote: quote.to_string(),
                    step_size,
                    tick_size,
                    min_qty,
                    min_notional,
                    max_qty,
                    active,
                },
            );
        }
        Ok(markets)
    }

    /// Slice a batch into chunks the native endpoint accepts.
    fn slice_batches(requests: &[OrderRequest], limit: usize) -> Vec<&[OrderRequest]> {
        requests.chunks(limit.max(1)).collect()
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange_name(&self) -> &'static str {
        "binance"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    async fn load_markets(&self, reload: bool) -> ExchangeResult<HashMap<String, MarketInfo>> {
        if !reload {
            if let Some(cached) = self.markets.get() {
                return Ok(cached);
            }
        }
        let path = format!("{}/exchangeInfo", self.api_prefix());
        let body = with_retry("binance exchangeInfo", || self.send_public(&path, "")).await?;
        let markets = self.parse_exchange_info(&body)?;
        self.markets.put(markets.clone());
        Ok(markets)
    }

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>> {
        let mut balances = HashMap::new();
        match self.market_type {
            MarketType::Spot => {
                let body = self
                    .send_signed(reqwest::Method::GET, "/api/v3/account", "")
                    .await?;
                for entry in body["balances"].as_array().into_iter().flatten() {
                    let asset = entry["asset"].as_str().unwrap_or_default().to_string();
                    let free = Self::parse_decimal(&entry["free"]).unwrap_or(Decimal::ZERO);
                    let locked = Self::parse_decimal(&entry["locked"]).unwrap_or(Decimal::ZERO);
                    if !free.is_zero() || !locked.is_zero() {
                        balances.insert(asset.clone(), Balance { asset, free, locked });
                    }
                }
            }
            MarketType::Futures => {
                let body = self
                    .send_signed(reqwest::Method::GET, "/fapi/v2/balance", "")
                    .await?;
                for entry in body.as_array().into_iter().flatten() {
                    let asset = entry["asset"].as_str().unwrap_or_default().to_string();
                    let free = Self::parse_decimal(&entry["availableBalance"])
                        .unwrap_or(Decimal::ZERO);
                    let total = Self::parse_decimal(&entry["balance"]).unwrap_or(Decimal::ZERO);
                    if !total.is_zero() {
                        balances.insert(
                            asset.clone(),
                            Balance {
                                asset,
                                free,
                                locked: total - free,
                            },
                        );
                    }
                }
            }
        }
        Ok(balances)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        let params = self.order_params(request)?;
        let path = format!("{}/order", self.api_prefix());
        debug!(symbol = %request.symbol, side = %request.side, order_type = %request.order_type, "placing order");
        let body = self.send_signed(reqwest::Method::POST, &path, &params).await?;
        self.parse_order(&body)
    }

    async fn cancel_order(&self, order_id: &str, symbol: Option<&str>) -> ExchangeResult<Order> {
        let symbol = symbol.ok_or_else(|| {
            ExchangeError::Validation("binance cancel requires a symbol".into())
        })?;
        let params = format!(
            "symbol={}&orderId={order_id}",
            self.to_exchange_symbol(symbol)?
        );
        let path = format!("{}/order", self.api_prefix());
        let body = self
            .send_signed(reqwest::Method::DELETE, &path, &params)
            .await?;
        self.parse_order(&body)
    }

    async fn fetch_order(&self, order_id: &str, symbol: Option<&str>) -> ExchangeResult<Order> {
        let symbol = symbol.ok_or_else(|| {
            ExchangeError::Validation("binance fetch_order requires a symbol".into())
        })?;
        let params = format!(
            "symbol={}&orderId={order_id}",
            self.to_exchange_symbol(symbol)?
        );
        let path = format!("{}/order", self.api_prefix());
        let body = with_retry("binance fetch_order", || {
            self.send_signed(reqwest::Method::GET, &path, &params)
        })
        .await?;
        self.parse_order(&body)
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>> {
        let params = match symbol {
            Some(s) => format!("symbol={}", self.to_exchange_symbol(s)?),
            None => String::new(),
        };
        let path = format!("{}/openOrders", self.api_prefix());
        let body = with_retry("binance openOrders", || {
            self.send_signed(reqwest::Method::GET, &path, &params)
        })
        .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("openOrders is not an array".into()))?;
        raw.iter().map(|v| self.parse_order(v)).collect()
    }

    async fn fetch_recent_trades(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> ExchangeResult<Vec<ExchangeTrade>> {
        let symbol = symbol.ok_or_else(|| {
            ExchangeError::Validation("binance trade history requires a symbol".into())
        })?;
        let wire_symbol = self.to_exchange_symbol(symbol)?;
        let canonical = self.from_exchange_symbol(&wire_symbol)?;
        let params = format!("symbol={wire_symbol}&limit={limit}");
        let path = match self.market_type {
            MarketType::Spot => "/api/v3/myTrades".to_string(),
            MarketType::Futures => "/fapi/v1/userTrades".to_string(),
        };
        let body = with_retry("binance myTrades", || {
            self.send_signed(reqwest::Method::GET, &path, &params)
        })
        .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("trades is not an array".into()))?;

        let mut trades = Vec::with_capacity(raw.len());
        for entry in raw {
            let order_id = entry["orderId"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default();
            let trade_id = entry["id"].as_i64().map(|id| id.to_string());
            let is_buyer = entry["isBuyer"]
                .as_bool()
                .or_else(|| entry["buyer"].as_bool())
                .unwrap_or_else(|| entry["side"].as_str() == Some("BUY"));
            let ts_ms = entry["time"].as_i64().unwrap_or_default();
            trades.push(ExchangeTrade {
                exchange_order_id: order_id,
                exchange_trade_id: trade_id,
                symbol: canonical.clone(),
                side: if is_buyer { OrderSide::Buy } else { OrderSide::Sell },
                price: Self::parse_decimal(&entry["price"])?,
                quantity: Self::parse_decimal(&entry["qty"])?,
                commission: Self::parse_decimal(&entry["commission"]).unwrap_or(Decimal::ZERO),
                is_maker: entry["isMaker"].as_bool().or_else(|| entry["maker"].as_bool()).unwrap_or(false),
                time: Utc.timestamp_millis_opt(ts_ms).single().unwrap_or_else(Utc::now),
            });
        }
        Ok(trades)
    }

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<PriceQuote> {
        let wire_symbol = self.to_exchange_symbol(symbol)?;
        let path = format!("{}/ticker/24hr", self.api_prefix());
        let query = format!("symbol={wire_symbol}");
        let body = with_retry("binance ticker", || {
            self.send_public(&path, &query)
        })
        .await?;
        Ok(PriceQuote {
            symbol: symbol.to_string(),
            last: Self::parse_decimal(&body["lastPrice"])?,
            bid: Self::parse_decimal(&body["bidPrice"]).ok(),
            ask: Self::parse_decimal(&body["askPrice"]).ok(),
            volume: Self::parse_decimal(&body["volume"]).unwrap_or(Decimal::ZERO),
            ts: Utc::now(),
        })
    }

    async fn create_batch_orders(&self, requests: &[OrderRequest]) -> ExchangeResult<BatchResult> {
        if requests.is_empty() {
            return Ok(BatchResult::from_entries(vec![], BatchImplementation::NativeBatch));
        }

        match self.market_type {
            // Futures: native endpoint, up to 5 per slice, limiter delay
            // between slices.
            MarketType::Futures => {
                let mut results = Vec::with_capacity(requests.len());
                let slices = Self::slice_batches(requests, FUTURES_BATCH_LIMIT);
                let total_slices = slices.len();

                for (slice_index, slice) in slices.into_iter().enumerate() {
                    let mut wire_orders = Vec::with_capacity(slice.len());
                    for request in slice {
                        let mut obj = serde_json::json!({
                            "symbol": self.to_exchange_symbol(&request.symbol)?,
                            "side": request.side.as_str(),
                            "type": self.order_type_param(request.order_type),
                            "quantity": request.quantity.normalize().to_string(),
                        });
                        if let Some(price) = request.price {
                            obj["price"] = serde_json::json!(price.normalize().to_string());
                            obj["timeInForce"] = serde_json::json!("GTC");
                        }
                        if let Some(stop) = request.stop_price {
                            obj["stopPrice"] = serde_json::json!(stop.normalize().to_string());
                        }
                        if let Some(client_id) = &request.client_order_id {
                            obj["newClientOrderId"] = serde_json::json!(client_id);
                        }
                        wire_orders.push(obj);
                    }

                    let payload = serde_json::to_string(&wire_orders)?;
                    let encoded: String =
                        url::form_urlencoded::byte_serialize(payload.as_bytes()).collect();
                    let params = format!("batchOrders={encoded}");

                    let base = slice_index * FUTURES_BATCH_LIMIT;
                    match self
                        .send_signed(reqwest::Method::POST, "/fapi/v1/batchOrders", &params)
                        .await
                    {
                        Ok(body) => {
                            for (i, entry) in body.as_array().into_iter().flatten().enumerate() {
                                if entry.get("code").is_some() && entry["orderId"].is_null() {
                                    results.push(BatchEntryResult {
                                        order_index: base + i,
                                        success: false,
                                        order_id: None,
                                        order: None,
                                        error: entry["msg"].as_str().map(|s| s.to_string()),
                                    });
                                } else {
                                    let order = self.parse_order(entry)?;
                                    results.push(BatchEntryResult {
                                        order_index: base + i,
                                        success: true,
                                        order_id: Some(order.order_id.clone()),
                                        order: Some(order),
                                        error: None,
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            warn!(slice = slice_index, error = %e, "batch slice failed");
                            for i in 0..slice.len() {
                                results.push(BatchEntryResult {
                                    order_index: base + i,
                                    success: false,
                                    order_id: None,
                                    order: None,
                                    error: Some(e.to_string()),
                                });
                            }
                        }
                    }

                    if slice_index + 1 < total_slices {
                        tokio::time::sleep(self.limiter.batch_slice_delay()).await;
                    }
                }

                Ok(BatchResult::from_entries(results, BatchImplementation::NativeBatch))
            }

            // Spot has no batch endpoint: sequential behind the pacing mutex.
            MarketType::Spot => {
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
        }
    }

    fn to_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String> {
        // Binance wire format is BASEQUOTE without a separator.
        Ok(symbol.replace('/', "").to_uppercase())
    }

    fn from_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String> {
        if symbol.contains('/') {
            return Ok(symbol.to_uppercase());
        }
        if let Some(resolved) = self.markets.resolve_symbol(symbol) {
            return Ok(resolved);
        }
        // Markets not loaded yet: fall back to the prioritized quote list.
        const QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB"];
        let upper = symbol.to_uppercase();
        for quote in QUOTES {
            if let Some(base) = upper.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(format!("{base}/{quote}"));
                }
            }
        }
        Err(ExchangeError::Validation(format!(
            "cannot normalize binance symbol {symbol}"
        )))
    }

    // -- user-data stream ----------------------------------------------------

    async fn create_listen_key(&self) -> ExchangeResult<String> {
        self.limiter.wait_if_needed().await;
        let path = match self.market_type {
            MarketType::Spot => "/api/v3/userDataStream",
            MarketType::Futures => "/fapi/v1/listenKey",
        };
        // Listen-key endpoints authenticate by API key header alone.
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            let msg = body["msg"].as_str().unwrap_or("listen key request failed");
            return Err(ExchangeError::Auth(msg.to_string()));
        }
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Parse("listenKey missing".into()))
    }

    async fn keepalive_listen_key(&self, listen_key: &str) -> ExchangeResult<()> {
        self.limiter.wait_if_needed().await;
        let (path, query) = match self.market_type {
            MarketType::Spot => (
                "/api/v3/userDataStream",
                format!("listenKey={listen_key}"),
            ),
            // Futures keepalive refreshes the account's key; no param needed.
            MarketType::Futures => ("/fapi/v1/listenKey", String::new()),
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.client.put(&url).send().await?;
        if !resp.status().is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let msg = body["msg"].as_str().unwrap_or("listen key keepalive failed");
            return Err(ExchangeError::Network(msg.to_string()));
        }
        Ok(())
    }

    fn user_stream_url(&self, listen_key: &str) -> ExchangeResult<String> {
        Ok(format!("{}/{}", self.ws_base, listen_key))
    }

    fn supports_user_stream(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("market_type", &self.market_type)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::rate_limit::{RateLimiter, RateProfile};
    use rust_decimal_macros::dec;

    fn adapter(market_type: MarketType) -> BinanceAdapter {
        BinanceAdapter::new(
            "key",
            "secret",
            market_type,
            false,
            Arc::new(RateLimiter::new(RateProfile::for_exchange("binance"))),
        )
    }

    #[test]
    fn signature_matches_known_vector() {
        // Binance documentation example key/payload.
        let a = BinanceAdapter::new(
            "key",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            MarketType::Spot,
            false,
            Arc::new(RateLimiter::new(RateProfile::for_exchange("binance"))),
        );
        let sig = a.sign(
            "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&\
             recvWindow=5000&timestamp=1499827319559",
        );
        assert_eq!(
            sig,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn symbol_round_trip_via_quote_list() {
        let a = adapter(MarketType::Spot);
        assert_eq!(a.to_exchange_symbol("BTC/USDT").unwrap(), "BTCUSDT");
        assert_eq!(a.from_exchange_symbol("BTCUSDT").unwrap(), "BTC/USDT");
        assert_eq!(
            a.from_exchange_symbol(&a.to_exchange_symbol("ETH/BTC").unwrap())
                .unwrap(),
            "ETH/BTC"
        );
    }

    #[test]
    fn parse_order_handles_spot_shape() {
        let a = adapter(MarketType::Spot);
        let body = serde_json::json!({
            "symbol": "BTCUSDT",
            "orderId": 28,
            "clientOrderId": "cli-7",
            "transactTime": 1507725176595u64,
            "price": "42000.00000000",
            "origQty": "0.50000000",
            "executedQty": "0.10000000",
            "status": "PARTIALLY_FILLED",
            "timeInForce": "GTC",
            "type": "LIMIT",
            "side": "BUY"
        });
        let order = a.parse_order(&body).unwrap();
        assert_eq!(order.order_id, "28");
        assert_eq!(order.symbol, "BTC/USDT");
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.quantity, dec!(0.5));
        assert_eq!(order.filled_quantity, dec!(0.1));
        assert_eq!(order.client_order_id.as_deref(), Some("cli-7"));
    }

    #[test]
    fn parse_exchange_info_extracts_filters() {
        let a = adapter(MarketType::Spot);
        let body = serde_json::json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "baseAsset": "BTC",
                "quoteAsset": "USDT",
                "status": "TRADING",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.00001",
                     "minQty": "0.00001", "maxQty": "9000"},
                    {"filterType": "NOTIONAL", "minNotional": "5.0"}
                ]
            }]
        });
        let markets = a.parse_exchange_info(&body).unwrap();
        let market = &markets["BTC/USDT"];
        assert_eq!(market.step_size, dec!(0.00001));
        assert_eq!(market.tick_size, dec!(0.01));
        assert_eq!(market.min_qty, dec!(0.00001));
        assert_eq!(market.min_notional, dec!(5.0));
        assert_eq!(market.max_qty, Some(dec!(9000)));
        assert!(market.active);
    }

    #[test]
    fn stop_types_map_per_market() {
        let spot = adapter(MarketType::Spot);
        let futures = adapter(MarketType::Futures);
        assert_eq!(spot.order_type_param(OrderType::StopLimit), "STOP_LOSS_LIMIT");
        assert_eq!(futures.order_type_param(OrderType::StopLimit), "STOP");
        assert_eq!(futures.order_type_param(OrderType::StopMarket), "STOP_MARKET");
    }

    #[test]
    fn batch_slicing_respects_the_limit() {
        let request = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(1),
            price: Some(dec!(100)),
            stop_price: None,
            client_order_id: None,
        };
        let requests = vec![request; 12];
        let slices = BinanceAdapter::slice_batches(&requests, FUTURES_BATCH_LIMIT);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), 5);
        assert_eq!(slices[2].len(), 2);
    }

    #[test]
    fn user_stream_urls_differ_per_market() {
        let spot = adapter(MarketType::Spot);
        let futures = adapter(MarketType::Futures);
        assert!(spot.user_stream_url("abc").unwrap().starts_with("wss://stream.binance.com"));
        assert!(futures.user_stream_url("abc").unwrap().starts_with("wss://fstream.binance.com"));
        assert!(spot.supports_user_stream());
    }
}
