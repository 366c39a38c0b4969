// =============================================================================
// Korea Investment Adapter — KRX securities over OAuth2 + hashkey REST
// =============================================================================
//
// Tokens live 24 h and the issuer returns the same token for repeat requests
// inside 6 h, so the adapter persists them per account and serializes refresh
// behind an async mutex: concurrent callers that find the token expired make
// exactly one OAuth round-trip between them.
//
// Order and cancel requests additionally carry a tamper-evidence hashkey:
// Base64(SHA-256("appkey|appsecret|k1=v1|k2=v2|...")) over the body fields in
// sorted key order. Canonicalization must match the server byte for byte.
//
// Symbols are 6-digit KRX issue codes, canonicalized as `CODE/KRW`. The
// account number pair (CANO-ACNT_PRDT_CD) rides in the account's passphrase
// column.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    Balance, BatchEntryResult, BatchImplementation, BatchResult, MarketInfo, MarketType, Order,
    OrderRequest, OrderSide, OrderStatus, OrderType, PriceQuote,
};

use super::precision::floor_to_step;
use super::rate_limit::RateLimiter;
use super::{with_retry, ExchangeAdapter, ExchangeTrade};

/// Refresh this far before nominal expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// KRX price-band tick table (stocks, KOSPI/KOSDAQ unified bands).
pub fn krx_tick_size(price: Decimal) -> Decimal {
    if price < dec!(2000) {
        dec!(1)
    } else if price < dec!(5000) {
        dec!(5)
    } else if price < dec!(20000) {
        dec!(10)
    } else if price < dec!(50000) {
        dec!(50)
    } else if price < dec!(200000) {
        dec!(100)
    } else if price < dec!(500000) {
        dec!(500)
    } else {
        dec!(1000)
    }
}

/// Canonical hashkey input: sorted `k=v` pairs joined by pipes, prefixed by
/// the app credentials.
pub(crate) fn hashkey_input(appkey: &str, appsecret: &str, body: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = body.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let joined: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{appkey}|{appsecret}|{}", joined.join("|"))
}

pub struct KoreaInvestmentAdapter {
    account_id: i64,
    appkey: String,
    appsecret: String,
    /// "CANO-ACNT_PRDT_CD" pair, split on demand.
    account_number: Option<String>,
    base_url: String,
    is_testnet: bool,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    db: Database,
    /// Serializes token refresh; the row in `securities_tokens` is the shared
    /// value the winner publishes.
    refresh_lock: Mutex<()>,
}

impl KoreaInvestmentAdapter {
    pub fn new(
        account_id: i64,
        appkey: impl Into<String>,
        appsecret: impl Into<String>,
        is_testnet: bool,
        limiter: Arc<RateLimiter>,
        db: Database,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        let base_url = if is_testnet {
            "https://openapivts.koreainvestment.com:29443".to_string()
        } else {
            "https://openapi.koreainvestment.com:9443".to_string()
        };
        Self {
            account_id,
            appkey: appkey.into(),
            appsecret: appsecret.into(),
            account_number: None,
            base_url,
            is_testnet,
            client,
            limiter,
            db,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_account_number(mut self, account_number: impl Into<String>) -> Self {
        self.account_number = Some(account_number.into());
        self
    }

    fn account_parts(&self) -> ExchangeResult<(String, String)> {
        let raw = self
            .account_number
            .as_deref()
            .ok_or_else(|| ExchangeError::Auth("securities account number missing".into()))?;
        match raw.split_once('-') {
            Some((cano, prdt)) => Ok((cano.to_string(), prdt.to_string())),
            None => Ok((raw.to_string(), "01".to_string())),
        }
    }

    // -------------------------------------------------------------------------
    // Token lifecycle
    // -------------------------------------------------------------------------

    /// Issue a fresh token. POST /oauth2/tokenP; the server re-issues the
    /// same token for requests landing within 6 h of the original grant.
    async fn authenticate(&self) -> ExchangeResult<(String, String, i64)> {
        let url = format!("{}/oauth2/tokenP", self.base_url);
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.appkey,
            "appsecret": self.appsecret,
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        let data: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            let msg = data["error_description"]
                .as_str()
                .or_else(|| data["msg1"].as_str())
                .unwrap_or("token request failed");
            return Err(ExchangeError::Auth(msg.to_string()));
        }
        let access_token = data["access_token"]
            .as_str()
            .ok_or_else(|| ExchangeError::Parse("access_token missing".into()))?
            .to_string();
        let token_type = data["token_type"].as_str().unwrap_or("Bearer").to_string();
        let expires_in = data["expires_in"].as_i64().unwrap_or(86400);
        info!(account_id = self.account_id, expires_in, "securities token issued");
        Ok((access_token, token_type, expires_in))
    }

    /// Current valid token, refreshing under the lock when needed. The
    /// double-read after acquiring the lock lets the losers of the race reuse
    /// what the winner wrote.
    pub async fn ensure_token(&self) -> ExchangeResult<String> {
        let now = Utc::now();
        let margin = ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN_SECS);

        if let Some(row) = self
            .db
            .securities_token(self.account_id)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
        {
            if !row.is_expired(now + margin) {
                return Ok(row.access_token);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(row) = self
            .db
            .securities_token(self.account_id)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
        {
            if !row.is_expired(now + margin) {
                return Ok(row.access_token);
            }
        }

        let (access_token, token_type, expires_in) = self.authenticate().await?;
        let expires_at = Utc::now() + ChronoDuration::seconds(expires_in);
        self.db
            .upsert_securities_token(self.account_id, &access_token, &token_type, expires_at)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?;
        Ok(access_token)
    }

    /// Base64(SHA-256(canonical body)).
    pub fn hashkey(&self, body: &[(String, String)]) -> String {
        let input = hashkey_input(&self.appkey, &self.appsecret, body);
        let digest = Sha256::digest(input.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(digest)
    }

    /// Cash-order transaction id: buy/sell crossed with real/virtual.
    fn tr_id(&self, side: OrderSide) -> &'static str {
        match (self.is_testnet, side) {
            (false, OrderSide::Buy) => "TTTC0012U",
            (false, OrderSide::Sell) => "TTTC0011U",
            (true, OrderSide::Buy) => "VTTC0012U",
            (true, OrderSide::Sell) => "VTTC0011U",
        }
    }

    /// Transaction id of the daily order/execution inquiry.
    fn daily_ccld_tr_id(&self) -> &'static str {
        if self.is_testnet {
            "VTTC0081R"
        } else {
            "TTTC0081R"
        }
    }

    /// GET inquire-daily-ccld for today. `ccld_nccs_dvsn` selects the slice:
    /// "00" everything, "02" unfilled only. `pdno`/`odno` narrow by issue
    /// code and order number; blank means all.
    async fn daily_ccld_query(
        &self,
        pdno: &str,
        odno: &str,
        ccld_nccs_dvsn: &str,
    ) -> ExchangeResult<serde_json::Value> {
        let (cano, prdt) = self.account_parts()?;
        let today = Utc::now().format("%Y%m%d").to_string();
        self.send_query(
            "/uapi/domestic-stock/v1/trading/inquire-daily-ccld",
            self.daily_ccld_tr_id(),
            &[
                ("CANO", cano),
                ("ACNT_PRDT_CD", prdt),
                ("INQR_STRT_DT", today.clone()),
                ("INQR_END_DT", today),
                ("SLL_BUY_DVSN_CD", "00".into()),
                ("INQR_DVSN", "00".into()),
                ("PDNO", pdno.into()),
                ("CCLD_NCCS_DVSN", ccld_nccs_dvsn.into()),
                ("ORD_GNO_BRNO", "".into()),
                ("ODNO", odno.into()),
                ("INQR_DVSN_3", "00".into()),
                ("INQR_DVSN_1", "".into()),
                ("CTX_AREA_FK100", "".into()),
                ("CTX_AREA_NK100", "".into()),
            ],
        )
        .await
    }

    /// One `output1` row of the daily inquiry, normalized. Side code "02" is
    /// a buy; order division "00" is a limit order.
    fn parse_ccld_order(entry: &serde_json::Value) -> Order {
        let code = entry["pdno"].as_str().unwrap_or_default();
        let total = entry["ord_qty"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        let filled = entry["tot_ccld_qty"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        let status = if !total.is_zero() && filled >= total {
            OrderStatus::Filled
        } else if !filled.is_zero() {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        };
        Order {
            order_id: entry["odno"].as_str().unwrap_or_default().to_string(),
            client_order_id: None,
            symbol: format!("{code}/KRW"),
            side: if entry["sll_buy_dvsn_cd"].as_str() == Some("02") {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            order_type: if entry["ord_dvsn_cd"].as_str() == Some("00") {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            status,
            price: entry["ord_unpr"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .filter(|p| !p.is_zero()),
            stop_price: None,
            quantity: total,
            filled_quantity: filled,
            average_price: entry["avg_prvs"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .filter(|p| !p.is_zero()),
            timestamp: Utc::now(),
        }
    }

    async fn send_order_request(
        &self,
        path: &str,
        tr_id: &str,
        body: Vec<(String, String)>,
    ) -> ExchangeResult<serde_json::Value> {
        self.limiter.wait_if_needed().await;

        let token = self.ensure_token().await?;
        let hashkey = self.hashkey(&body);
        let json_body: serde_json::Map<String, serde_json::Value> = body
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.appkey)
            .header("appsecret", &self.appsecret)
            .header("tr_id", tr_id)
            .header("hashkey", hashkey)
            .json(&serde_json::Value::Object(json_body))
            .send()
            .await?;

        let status = resp.status();
        let data: serde_json::Value = resp.json().await?;

        // KIS signals failure through rt_cd != "0" even on HTTP 200.
        let rt_cd = data["rt_cd"].as_str().unwrap_or("");
        if !status.is_success() || rt_cd != "0" {
            let msg = data["msg1"].as_str().unwrap_or("order request failed").trim();
            let lower = msg.to_lowercase();
            if lower.contains("token") || lower.contains("auth") {
                return Err(ExchangeError::Auth(msg.to_string()));
            }
            return Err(ExchangeError::from_exchange_message(msg));
        }
        Ok(data)
    }

    async fn send_query(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<serde_json::Value> {
        self.limiter.wait_if_needed().await;
        let token = self.ensure_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(params)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.appkey)
            .header("appsecret", &self.appsecret)
            .header("tr_id", tr_id)
            .send()
            .await?;
        let status = resp.status();
        let data: serde_json::Value = resp.json().await?;
        if !status.is_success() || data["rt_cd"].as_str().unwrap_or("0") != "0" {
            let msg = data["msg1"].as_str().unwrap_or("query failed").trim();
            return Err(ExchangeError::from_exchange_message(msg));
        }
        Ok(data)
    }

    fn stock_code(&self, symbol: &str) -> ExchangeResult<String> {
        let code = self.to_exchange_symbol(symbol)?;
        if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ExchangeError::Validation(format!(
                "invalid KRX issue code: {code}"
            )));
        }
        Ok(code)
    }
}

#[async_trait]
impl ExchangeAdapter for KoreaInvestmentAdapter {
    fn exchange_name(&self) -> &'static str {
        "korea_investment"
    }

    fn market_type(&self) -> MarketType {
        MarketType::Spot
    }

    async fn load_markets(&self, _reload: bool) -> ExchangeResult<HashMap<String, MarketInfo>> {
        // Rule-based venue: there is no markets API. Precision is integral
        // shares with price-band ticks; callers get a synthetic entry per
        // request via `fetch_quote` + `krx_tick_size`.
        Ok(HashMap::new())
    }

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>> {
        let (cano, prdt) = self.account_parts()?;
        let tr_id = if self.is_testnet { "VTTC8434R" } else { "TTTC8434R" };
        let data = self
            .send_query(
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                tr_id,
                &[
                    ("CANO", cano),
                    ("ACNT_PRDT_CD", prdt),
                    ("AFHR_FLPR_YN", "N".into()),
                    ("OFL_YN", "".into()),
                    ("INQR_DVSN", "02".into()),
                    ("UNPR_DVSN", "01".into()),
                    ("FUND_STTL_ICLD_YN", "N".into()),
                    ("FNCG_AMT_AUTO_RDPT_YN", "N".into()),
                    ("PROC_DVSN", "00".into()),
                    ("CTX_AREA_FK100", "".into()),
                    ("CTX_AREA_NK100", "".into()),
                ],
            )
            .await?;

        let mut balances = HashMap::new();
        if let Some(cash) = data["output2"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|o| o["dnca_tot_amt"].as_str())
        {
            let free = Decimal::from_str(cash).unwrap_or(Decimal::ZERO);
            balances.insert(
                "KRW".to_string(),
                Balance {
                    asset: "KRW".to_string(),
                    free,
                    locked: Decimal::ZERO,
                },
            );
        }
        for entry in data["output1"].as_array().into_iter().flatten() {
            let code = entry["pdno"].as_str().unwrap_or_default().to_string();
            let qty = entry["hldg_qty"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO);
            if !qty.is_zero() {
                balances.insert(
                    code.clone(),
                    Balance {
                        asset: code,
                        free: qty,
                        locked: Decimal::ZERO,
                    },
                );
            }
        }
        Ok(balances)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        if request.order_type.requires_stop_price() {
            return Err(ExchangeError::Validation(
                "KRX cash orders do not support stop types".into(),
            ));
        }

        let code = self.stock_code(&request.symbol)?;
        let (cano, prdt) = self.account_parts()?;

        // Integral shares only.
        let quantity = request.quantity.trunc();
        if quantity < Decimal::ONE {
            return Err(ExchangeError::MinNotional(
                "stock order quantity below one share".into(),
            ));
        }

        let (ord_dvsn, unit_price) = match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    ExchangeError::Validation("LIMIT order requires a price".into())
                })?;
                let tick = krx_tick_size(price);
                ("00", floor_to_step(price, tick).trunc())
            }
            OrderType::Market => ("01", Decimal::ZERO),
            _ => unreachable!("stop types rejected above"),
        };

        let body: Vec<(String, String)> = vec![
            ("CANO".into(), cano),
            ("ACNT_PRDT_CD".into(), prdt),
            ("PDNO".into(), code.clone()),
            ("ORD_DVSN".into(), ord_dvsn.into()),
            ("ORD_QTY".into(), quantity.normalize().to_string()),
            ("ORD_UNPR".into(), unit_price.normalize().to_string()),
        ];

        debug!(code = %code, side = %request.side, "placing stock order");
        let data = self
            .send_order_request(
                "/uapi/domestic-stock/v1/trading/order-cash",
                self.tr_id(request.side),
                body,
            )
            .await?;

        let order_no = data["output"]["ODNO"]
            .as_str()
            .ok_or_else(|| ExchangeError::Parse("ODNO missing in order response".into()))?;

        Ok(Order {
            order_id: order_no.to_string(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: OrderStatus::Open,
            price: request.price,
            stop_price: None,
            quantity,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: Option<&str>) -> ExchangeResult<Order> {
        let symbol = symbol.ok_or_else(|| {
            ExchangeError::Validation("stock cancel requires the symbol".into())
        })?;
        let code = self.stock_code(symbol)?;
        let (cano, prdt) = self.account_parts()?;
        let tr_id = if self.is_testnet { "VTTC0013U" } else { "TTTC0013U" };

        let body: Vec<(String, String)> = vec![
            ("CANO".into(), cano),
            ("ACNT_PRDT_CD".into(), prdt),
            ("KRX_FWDG_ORD_ORGNO".into(), "".into()),
            ("ORGN_ODNO".into(), order_id.into()),
            ("ORD_DVSN".into(), "00".into()),
            ("RVSE_CNCL_DVSN_CD".into(), "02".into()),
            ("ORD_QTY".into(), "0".into()),
            ("ORD_UNPR".into(), "0".into()),
            ("QTY_ALL_ORD_YN".into(), "Y".into()),
        ];

        self.send_order_request(
            "/uapi/domestic-stock/v1/trading/order-rvsecncl",
            tr_id,
            body,
        )
        .await?;

        Ok(Order {
            order_id: order_id.to_string(),
            client_order_id: None,
            symbol: format!("{code}/KRW"),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            status: OrderStatus::Canceled,
            price: None,
            stop_price: None,
            quantity: Decimal::ZERO,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_order(&self, order_id: &str, symbol: Option<&str>) -> ExchangeResult<Order> {
        let symbol = symbol.ok_or_else(|| {
            ExchangeError::Validation("stock order lookup requires the symbol".into())
        })?;
        let code = self.stock_code(symbol)?;

        // Daily inquiry filtered by order number, filled and unfilled alike.
        let data = with_retry("kis fetch_order", || {
            let code = code.clone();
            let order_id = order_id.to_string();
            async move { self.daily_ccld_query(&code, &order_id, "00").await }
        })
        .await?;

        data["output1"]
            .as_array()
            .into_iter()
            .flatten()
            .map(Self::parse_ccld_order)
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>> {
        // Unfilled slice of today's daily inquiry; blank PDNO means all
        // issues.
        let pdno = match symbol {
            Some(symbol) => self.stock_code(symbol)?,
            None => String::new(),
        };
        let data = with_retry("kis open orders", || {
            let pdno = pdno.clone();
            async move { self.daily_ccld_query(&pdno, "", "02").await }
        })
        .await?;

        Ok(data["output1"]
            .as_array()
            .into_iter()
            .flatten()
            .map(Self::parse_ccld_order)
            .collect())
    }

    async fn fetch_recent_trades(
        &self,
        symbol: Option<&str>,
        _limit: usize,
    ) -> ExchangeResult<Vec<ExchangeTrade>> {
        // Full slice of the same daily inquiry; rows with executions become
        // synthetic trades keyed by order number.
        let pdno = match symbol {
            Some(symbol) => self.stock_code(symbol)?,
            None => String::new(),
        };
        let data = self.daily_ccld_query(&pdno, "", "00").await?;

        let mut trades = Vec::new();
        for entry in data["output1"].as_array().into_iter().flatten() {
            let order = Self::parse_ccld_order(entry);
            if order.filled_quantity.is_zero() {
                continue;
            }
            trades.push(ExchangeTrade {
                exchange_trade_id: Some(format!("{}-ccld", order.order_id)),
                exchange_order_id: order.order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                price: order
                    .average_price
                    .or(order.price)
                    .unwrap_or(Decimal::ZERO),
                quantity: order.filled_quantity,
                commission: Decimal::ZERO,
                is_maker: false,
                time: order.timestamp,
            });
        }
        Ok(trades)
    }

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<PriceQuote> {
        let code = self.stock_code(symbol)?;
        let data = with_retry("kis quote", || {
            let code = code.clone();
            async move {
                self.send_query(
                    "/uapi/domestic-stock/v1/quotations/inquire-price",
                    "FHKST01010100",
                    &[
                        ("FID_COND_MRKT_DIV_CODE", "J".into()),
                        ("FID_INPUT_ISCD", code),
                    ],
                )
                .await
            }
        })
        .await?;
        let output = &data["output"];
        let last = output["stck_prpr"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| ExchangeError::Parse("stck_prpr missing".into()))?;
        Ok(PriceQuote {
            symbol: symbol.to_string(),
            last,
            bid: None,
            ask: None,
            volume: output["acml_vol"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO),
            ts: Utc::now(),
        })
    }

    async fn create_batch_orders(&self, requests: &[OrderRequest]) -> ExchangeResult<BatchResult> {
        // Securities orders are strictly sequential: hashkey + token pair
        // each request and the venue throttles hard.
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
        Ok(symbol
            .split_once('/')
            .map(|(code, _)| code)
            .unwrap_or(symbol)
            .to_string())
    }

    fn from_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String> {
        if symbol.contains('/') {
            Ok(symbol.to_string())
        } else {
            Ok(format!("{symbol}/KRW"))
        }
    }
}

impl std::fmt::Debug for KoreaInvestmentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KoreaInvestmentAdapter")
            .field("account_id", &self.account_id)
            .field("appkey", &"<redacted>")
            .field("appsecret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::rate_limit::{RateLimiter, RateProfile};

    fn adapter(db: Database) -> KoreaInvestmentAdapter {
        KoreaInvestmentAdapter::new(
            1,
            "appkey",
            "appsecret",
            false,
            Arc::new(RateLimiter::new(RateProfile::for_exchange("kis"))),
            db,
        )
        .with_account_number("12345678-01")
    }

    #[test]
    fn hashkey_input_sorts_and_joins_with_pipes() {
        let body = vec![
            ("PDNO".to_string(), "005930".to_string()),
            ("CANO".to_string(), "12345678".to_string()),
            ("ORD_QTY".to_string(), "10".to_string()),
        ];
        assert_eq!(
            hashkey_input("ak", "as", &body),
            "ak|as|CANO=12345678|ORD_QTY=10|PDNO=005930"
        );
    }

    #[tokio::test]
    async fn hashkey_is_base64_sha256() {
        let db = Database::open_in_memory().unwrap();
        let a = adapter(db);
        let body = vec![("CANO".to_string(), "12345678".to_string())];
        let key = a.hashkey(&body);
        // 32-byte digest -> 44-char base64.
        assert_eq!(key.len(), 44);

        let expected = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(
            "appkey|appsecret|CANO=12345678".as_bytes(),
        ));
        assert_eq!(key, expected);
    }

    #[test]
    fn krx_tick_bands() {
        assert_eq!(krx_tick_size(dec!(1500)), dec!(1));
        assert_eq!(krx_tick_size(dec!(4500)), dec!(5));
        assert_eq!(krx_tick_size(dec!(15000)), dec!(10));
        assert_eq!(krx_tick_size(dec!(72000)), dec!(100));
        assert_eq!(krx_tick_size(dec!(700000)), dec!(1000));
    }

    #[test]
    fn transaction_ids_cross_real_and_virtual() {
        let real = adapter(Database::open_in_memory().unwrap());
        assert_eq!(real.tr_id(crate::types::OrderSide::Buy), "TTTC0012U");
        assert_eq!(real.tr_id(crate::types::OrderSide::Sell), "TTTC0011U");
        assert_eq!(real.daily_ccld_tr_id(), "TTTC0081R");

        let virtual_ = KoreaInvestmentAdapter::new(
            1,
            "appkey",
            "appsecret",
            true,
            Arc::new(RateLimiter::new(RateProfile::for_exchange("kis"))),
            Database::open_in_memory().unwrap(),
        );
        assert_eq!(virtual_.tr_id(crate::types::OrderSide::Buy), "VTTC0012U");
        assert_eq!(virtual_.tr_id(crate::types::OrderSide::Sell), "VTTC0011U");
        assert_eq!(virtual_.daily_ccld_tr_id(), "VTTC0081R");
    }

    #[test]
    fn daily_inquiry_row_parses_side_and_fill_progress() {
        let entry = serde_json::json!({
            "odno": "0000117057",
            "pdno": "005930",
            "sll_buy_dvsn_cd": "02",
            "ord_dvsn_cd": "00",
            "ord_qty": "10",
            "tot_ccld_qty": "4",
            "ord_unpr": "71000",
            "avg_prvs": "70950"
        });
        let order = KoreaInvestmentAdapter::parse_ccld_order(&entry);
        assert_eq!(order.order_id, "0000117057");
        assert_eq!(order.symbol, "005930/KRW");
        assert_eq!(order.side, crate::types::OrderSide::Buy);
        assert_eq!(order.order_type, crate::types::OrderType::Limit);
        assert_eq!(order.status, crate::types::OrderStatus::PartiallyFilled);
        assert_eq!(order.quantity, dec!(10));
        assert_eq!(order.filled_quantity, dec!(4));
        assert_eq!(order.average_price, Some(dec!(70950)));

        // Fully executed rows come back FILLED.
        let entry = serde_json::json!({
            "odno": "0000117058",
            "pdno": "005930",
            "sll_buy_dvsn_cd": "01",
            "ord_dvsn_cd": "01",
            "ord_qty": "5",
            "tot_ccld_qty": "5",
            "ord_unpr": "0"
        });
        let order = KoreaInvestmentAdapter::parse_ccld_order(&entry);
        assert_eq!(order.side, crate::types::OrderSide::Sell);
        assert_eq!(order.order_type, crate::types::OrderType::Market);
        assert_eq!(order.status, crate::types::OrderStatus::Filled);
        assert!(order.price.is_none());
    }

    #[test]
    fn issue_codes_round_trip_through_krw_suffix() {
        let db = Database::open_in_memory().unwrap();
        let a = adapter(db);
        assert_eq!(a.to_exchange_symbol("005930/KRW").unwrap(), "005930");
        assert_eq!(a.from_exchange_symbol("005930").unwrap(), "005930/KRW");
    }

    #[tokio::test]
    async fn fresh_token_is_served_from_the_database() {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("alice", "tok", false).await.unwrap();
        let account = db
            .insert_account(user, "kis", "korea_investment", "SECURITIES_KR", "k", "s", false)
            .await
            .unwrap();
        db.upsert_securities_token(
            account,
            "cached-token",
            "Bearer",
            Utc::now() + ChronoDuration::hours(12),
        )
        .await
        .unwrap();

        let a = KoreaInvestmentAdapter::new(
            account,
            "appkey",
            "appsecret",
            false,
            Arc::new(RateLimiter::new(RateProfile::for_exchange("kis"))),
            db,
        );
        // No network call happens: the cached token is still valid.
        assert_eq!(a.ensure_token().await.unwrap(), "cached-token");
    }

    #[tokio::test]
    async fn concurrent_token_reads_share_the_cached_row() {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("alice", "tok", false).await.unwrap();
        let account = db
            .insert_account(user, "kis", "korea_investment", "SECURITIES_KR", "k", "s", false)
            .await
            .unwrap();
        db.upsert_securities_token(
            account,
            "shared",
            "Bearer",
            Utc::now() + ChronoDuration::hours(12),
        )
        .await
        .unwrap();
        let before = db
            .securities_token(account)
            .await
            .unwrap()
            .unwrap()
            .last_refreshed_at;

        let a = Arc::new(KoreaInvestmentAdapter::new(
            account,
            "appkey",
            "appsecret",
            false,
            Arc::new(RateLimiter::new(RateProfile::for_exchange("kis"))),
            db.clone(),
        ));
        let (t1, t2) = tokio::join!(a.ensure_token(), a.ensure_token());
        assert_eq!(t1.unwrap(), "shared");
        assert_eq!(t2.unwrap(), "shared");

        // last_refreshed_at did not advance: no refresh happened.
        let after = db
            .securities_token(account)
            .await
            .unwrap()
            .unwrap()
            .last_refreshed_at;
        assert_eq!(before, after);
    }
}
