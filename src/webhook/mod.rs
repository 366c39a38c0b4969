// =============================================================================
// Webhook Dispatcher — one inbound signal, many exchange orders
// =============================================================================
//
// A signal addresses a strategy by group name and authenticates with a
// strategy-scoped token (constant-time compare). Fan-out runs the bindings in
// parallel with bounded per-exchange concurrency — securities venues get a
// single slot because token + hashkey serialize their order path — and a
// per-account timeout so one stuck venue cannot stall the rest.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::db::{Database, OpenOrderFilter, StrategyRow};
use crate::orders::{OrderManager, OrderSpec};
use crate::types::{OrderSide, OrderType};

/// Per-exchange fan-out slots. Securities accounts are serialized.
fn exchange_concurrency(exchange: &str) -> usize {
    match exchange.to_lowercase().as_str() {
        "korea_investment" | "kis" => 1,
        _ => 4,
    }
}

/// Compare secrets without leaking the mismatch position through timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ---------------------------------------------------------------------------
// Wire contract
// ---------------------------------------------------------------------------

/// Accept decimals sent as either JSON strings (TradingView) or numbers.
fn de_decimal_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Decimal::from_str(s.trim())
            .map(Some)
            .map_err(|e| D::Error::custom(format!("bad decimal '{s}': {e}"))),
        Some(serde_json::Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map(Some)
            .map_err(|e| D::Error::custom(format!("bad decimal {n}: {e}"))),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRequest {
    pub group_name: String,
    pub token: String,
    pub action: String,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub quantity: Option<Decimal>,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub price: Option<Decimal>,
    #[serde(default, deserialize_with = "de_decimal_opt")]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResult {
    pub account_id: i64,
    pub account_name: String,
    pub exchange: String,
    pub symbol: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_quantity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookSummary {
    pub total_accounts: usize,
    pub successful_orders: usize,
    pub failed_orders: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub total_processing_time_ms: u64,
    pub validation_time_ms: u64,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub action: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<AccountResult>,
    pub summary: WebhookSummary,
    pub performance_metrics: PerformanceMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_report: Option<serde_json::Value>,
}

impl WebhookResponse {
    fn rejected(action: &str, strategy: &str, error: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            action: action.to_string(),
            strategy: strategy.to_string(),
            error: Some(error.into()),
            results: vec![],
            summary: WebhookSummary {
                total_accounts: 0,
                successful_orders: 0,
                failed_orders: 0,
                success_rate: 0.0,
            },
            performance_metrics: PerformanceMetrics {
                total_processing_time_ms: started.elapsed().as_millis() as u64,
                validation_time_ms: started.elapsed().as_millis() as u64,
                execution_time_ms: 0,
            },
            cancel_report: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct WebhookDispatcher {
    db: Database,
    manager: Arc<OrderManager>,
    /// Per-account budget inside one fan-out.
    account_timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(db: Database, manager: Arc<OrderManager>, account_timeout: Duration) -> Self {
        Self {
            db,
            manager,
            account_timeout,
        }
    }

    pub async fn process(&self, request: WebhookRequest) -> WebhookResponse {
        let started = Instant::now();

        // -- validation & routing ------------------------------------------
        let strategy = match self.db.strategy_by_group_name(&request.group_name).await {
            Ok(Some(strategy)) => strategy,
            Ok(None) => {
                return WebhookResponse::rejected(
                    &request.action,
                    &request.group_name,
                    format!("unknown strategy group '{}'", request.group_name),
                    started,
                )
            }
            Err(e) => {
                return WebhookResponse::rejected(
                    &request.action,
                    &request.group_name,
                    format!("strategy lookup failed: {e}"),
                    started,
                )
            }
        };

        if !constant_time_eq(
            request.token.as_bytes(),
            strategy.webhook_token.as_bytes(),
        ) {
            warn!(group_name = %request.group_name, "webhook rejected: bad token");
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                "invalid token",
                started,
            );
        }
        if !strategy.is_active {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                "strategy is inactive",
                started,
            );
        }

        match request.action.as_str() {
            "test" => {
                info!(group_name = %request.group_name, "webhook test signal echoed");
                let mut response =
                    WebhookResponse::rejected("test", &strategy.name, "", started);
                response.success = true;
                response.error = None;
                response
            }
            "trading_signal" => self.process_signal(strategy, request, started).await,
            other => WebhookResponse::rejected(
                other,
                &strategy.name,
                format!("unknown action '{other}'"),
                started,
            ),
        }
    }

    async fn process_signal(
        &self,
        strategy: StrategyRow,
        request: WebhookRequest,
        started: Instant,
    ) -> WebhookResponse {
        let Some(order_type_raw) = request.order_type.as_deref() else {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                "order_type is required",
                started,
            );
        };

        // CANCEL routes to a bulk cancel scoped by (strategy, symbol, side).
        if order_type_raw.eq_ignore_ascii_case("CANCEL") {
            return self.process_cancel(strategy, request, started).await;
        }

        let Some(order_type) = OrderType::parse(order_type_raw) else {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                format!("unknown order_type '{order_type_raw}'"),
                started,
            );
        };
        let side = match request.side.as_deref().and_then(OrderSide::parse) {
            Some(side) => side,
            None => {
                return WebhookResponse::rejected(
                    &request.action,
                    &strategy.name,
                    "side must be BUY or SELL",
                    started,
                )
            }
        };
        let Some(symbol) = request.symbol.clone().filter(|s| !s.is_empty()) else {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                "symbol is required",
                started,
            );
        };
        let Some(total_quantity) = request.quantity.filter(|q| *q > Decimal::ZERO) else {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                "quantity is required and must be positive",
                started,
            );
        };
        if order_type.requires_price() && request.price.is_none() {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                format!("{order_type} order requires a price"),
                started,
            );
        }
        if order_type.requires_stop_price() && request.stop_price.is_none() {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                format!("{order_type} order requires a stop_price"),
                started,
            );
        }

        let bindings = match self.db.active_bindings(strategy.id).await {
            Ok(bindings) => bindings,
            Err(e) => {
                return WebhookResponse::rejected(
                    &request.action,
                    &strategy.name,
                    format!("binding lookup failed: {e}"),
                    started,
                )
            }
        };
        // Optional exchange filter narrows the fan-out.
        let bindings: Vec<_> = match &request.exchange {
            Some(exchange) => bindings
                .into_iter()
                .filter(|b| b.account.exchange.eq_ignore_ascii_case(exchange))
                .collect(),
            None => bindings,
        };
        if bindings.is_empty() {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                "no active accounts bound to strategy",
                started,
            );
        }

        let total_weight: Decimal = bindings
            .iter()
            .map(|b| b.strategy_account.weight)
            .sum();
        if total_weight <= Decimal::ZERO {
            return WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                "total binding weight is zero",
                started,
            );
        }

        let validation_time_ms = started.elapsed().as_millis() as u64;
        let execution_started = Instant::now();

        // -- fan-out --------------------------------------------------------
        // One semaphore per exchange bounds concurrency against each venue.
        let mut semaphores: HashMap<String, Arc<Semaphore>> = HashMap::new();
        for binding in &bindings {
            let exchange = binding.account.exchange.to_lowercase();
            semaphores
                .entry(exchange.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(exchange_concurrency(&exchange))));
        }

        let mut join_set = JoinSet::new();
        for binding in bindings.iter().cloned() {
            let weight = binding.strategy_account.weight;
            let quantity = total_quantity * weight / total_weight;
            let spec = OrderSpec {
                symbol: symbol.clone(),
                side,
                order_type,
                quantity,
                price: request.price,
                stop_price: request.stop_price,
                auto_adjust: true,
            };
            let manager = self.manager.clone();
            let strategy = strategy.clone();
            let semaphore = semaphores[&binding.account.exchange.to_lowercase()].clone();
            let timeout = self.account_timeout;

            join_set.spawn(async move {
                let base = AccountResult {
                    account_id: binding.account.id,
                    account_name: binding.account.name.clone(),
                    exchange: binding.account.exchange.clone(),
                    symbol: spec.symbol.clone(),
                    success: false,
                    order_id: None,
                    error: None,
                    executed_quantity: None,
                    executed_price: None,
                    adjustment: None,
                    timeout: false,
                };

                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return AccountResult {
                            error: Some("semaphore closed".into()),
                            ..base
                        }
                    }
                };

                let result = tokio::time::timeout(
                    timeout,
                    manager.create_order(&strategy, &binding, &spec),
                )
                .await;
                drop(permit);

                match result {
                    Ok(Ok(placed)) => AccountResult {
                        success: true,
                        order_id: Some(placed.exchange_order_id),
                        executed_quantity: Some(placed.executed_quantity.to_string()),
                        executed_price: placed.executed_price.map(|p| p.to_string()),
                        adjustment: placed.adjustment,
                        ..base
                    },
                    Ok(Err(e)) => AccountResult {
                        error: Some(e.to_string()),
                        ..base
                    },
                    Err(_) => AccountResult {
                        error: Some(format!(
                            "account timed out after {} s",
                            timeout.as_secs()
                        )),
                        timeout: true,
                        ..base
                    },
                }
            });
        }

        let mut results = Vec::with_capacity(bindings.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "fan-out task panicked"),
            }
        }
        results.sort_by_key(|r| r.account_id);

        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let summary = WebhookSummary {
            total_accounts: results.len(),
            successful_orders: successful,
            failed_orders: failed,
            success_rate: if results.is_empty() {
                0.0
            } else {
                successful as f64 / results.len() as f64
            },
        };

        info!(
            strategy = %strategy.name,
            total = summary.total_accounts,
            successful = summary.successful_orders,
            failed = summary.failed_orders,
            "webhook fan-out completed"
        );

        WebhookResponse {
            success: successful > 0,
            action: request.action,
            strategy: strategy.name,
            error: None,
            results,
            summary,
            performance_metrics: PerformanceMetrics {
                total_processing_time_ms: started.elapsed().as_millis() as u64,
                validation_time_ms,
                execution_time_ms: execution_started.elapsed().as_millis() as u64,
            },
            cancel_report: None,
        }
    }

    async fn process_cancel(
        &self,
        strategy: StrategyRow,
        request: WebhookRequest,
        started: Instant,
    ) -> WebhookResponse {
        let filter = OpenOrderFilter {
            strategy_id: Some(strategy.id),
            account_id: None,
            symbol: request.symbol.clone().filter(|s| !s.is_empty()),
            side: request.side.as_deref().and_then(OrderSide::parse),
        };

        match self
            .manager
            .cancel_all_for_user(strategy.user_id, &filter)
            .await
        {
            Ok(report) => {
                let cancelled = report.cancelled_orders.len();
                let failed = report.failed_orders.len();
                WebhookResponse {
                    success: failed == 0,
                    action: request.action,
                    strategy: strategy.name,
                    error: None,
                    results: vec![],
                    summary: WebhookSummary {
                        total_accounts: report.total_processed,
                        successful_orders: cancelled,
                        failed_orders: failed,
                        success_rate: if report.total_processed == 0 {
                            1.0
                        } else {
                            cancelled as f64 / report.total_processed as f64
                        },
                    },
                    performance_metrics: PerformanceMetrics {
                        total_processing_time_ms: started.elapsed().as_millis() as u64,
                        validation_time_ms: 0,
                        execution_time_ms: started.elapsed().as_millis() as u64,
                    },
                    cancel_report: Some(json!({
                        "cancelled_orders": report.cancelled_orders,
                        "failed_orders": report.failed_orders,
                        "total_processed": report.total_processed,
                        "filter_conditions": report.filter_conditions,
                    })),
                }
            }
            Err(e) => WebhookResponse::rejected(
                &request.action,
                &strategy.name,
                format!("bulk cancel failed: {e}"),
                started,
            ),
        }
    }
}

impl std::fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("account_timeout", &self.account_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::{MockExchange, MockSource};
    use crate::fills::FillMonitor;
    use crate::sse::EventHub;
    use crate::types::MarketType;
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Database,
        mock: Arc<MockExchange>,
        dispatcher: WebhookDispatcher,
    }

    /// Three bindings with weights 2, 1, 1 — the fan-out reference setup.
    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("alice", "tok", false).await.unwrap();
        let strategy = db
            .insert_strategy(user, "S1", "s1", "hook-secret", MarketType::Spot)
            .await
            .unwrap();
        for (name, weight) in [("a", dec!(2)), ("b", dec!(1)), ("c", dec!(1))] {
            let account = db
                .insert_account(user, name, "binance", "CRYPTO", "k", "s", false)
                .await
                .unwrap();
            db.insert_strategy_account(strategy, account, weight)
                .await
                .unwrap();
        }

        let hub = Arc::new(EventHub::new(db.clone()));
        let fills = Arc::new(FillMonitor::new(db.clone(), hub.clone()));
        let mock = Arc::new(MockExchange::new(MarketType::Spot));
        let manager = Arc::new(OrderManager::new(
            db.clone(),
            fills,
            hub,
            Arc::new(MockSource { mock: mock.clone() }),
        ));
        let dispatcher = WebhookDispatcher::new(db.clone(), manager, Duration::from_secs(10));
        Fixture {
            db,
            mock,
            dispatcher,
        }
    }

    fn signal(quantity: &str) -> WebhookRequest {
        serde_json::from_value(json!({
            "group_name": "s1",
            "token": "hook-secret",
            "action": "trading_signal",
            "order_type": "MARKET",
            "side": "buy",
            "symbol": "BTC/USDT",
            "quantity": quantity,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn fan_out_splits_quantity_by_weight() {
        let f = fixture().await;
        let response = f.dispatcher.process(signal("0.04")).await;

        assert!(response.success);
        assert_eq!(response.summary.total_accounts, 3);
        assert_eq!(response.summary.successful_orders, 3);
        assert_eq!(response.summary.failed_orders, 0);
        assert!((response.summary.success_rate - 1.0).abs() < f64::EPSILON);

        // Weights {2,1,1} of 0.04 -> 0.02, 0.01, 0.01.
        let mut quantities: Vec<Decimal> = f
            .mock
            .created
            .lock()
            .iter()
            .map(|r| r.quantity)
            .collect();
        quantities.sort();
        assert_eq!(quantities, vec![dec!(0.01), dec!(0.01), dec!(0.02)]);
    }

    #[tokio::test]
    async fn bad_token_is_rejected_without_touching_the_exchange() {
        let f = fixture().await;
        let mut request = signal("0.04");
        request.token = "wrong".into();
        let response = f.dispatcher.process(request).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("invalid token"));
        assert!(f.mock.created.lock().is_empty());
    }

    #[tokio::test]
    async fn inactive_strategy_is_rejected() {
        let f = fixture().await;
        let strategy = f.db.strategy_by_group_name("s1").await.unwrap().unwrap();
        f.db.set_strategy_active(strategy.id, false).await.unwrap();
        let response = f.dispatcher.process(signal("0.04")).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("inactive"));
    }

    #[tokio::test]
    async fn test_action_echoes_without_trading() {
        let f = fixture().await;
        let request: WebhookRequest = serde_json::from_value(json!({
            "group_name": "s1",
            "token": "hook-secret",
            "action": "test",
        }))
        .unwrap();
        let response = f.dispatcher.process(request).await;
        assert!(response.success);
        assert!(f.mock.created.lock().is_empty());
    }

    #[tokio::test]
    async fn market_signal_without_quantity_is_rejected() {
        let f = fixture().await;
        let request: WebhookRequest = serde_json::from_value(json!({
            "group_name": "s1",
            "token": "hook-secret",
            "action": "trading_signal",
            "order_type": "MARKET",
            "side": "BUY",
            "symbol": "BTC/USDT",
        }))
        .unwrap();
        let response = f.dispatcher.process(request).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("quantity"));
    }

    #[tokio::test]
    async fn per_account_failures_still_return_the_full_breakdown() {
        let f = fixture().await;
        // First account call fails, the other two succeed.
        f.mock.script_create(Err(crate::error::ExchangeError::Rejected(
            "insufficient balance".into(),
        )));

        let response = f.dispatcher.process(signal("0.04")).await;
        assert!(response.success); // partial success is still success=true
        assert_eq!(response.summary.total_accounts, 3);
        assert_eq!(response.summary.successful_orders, 2);
        assert_eq!(response.summary.failed_orders, 1);
        let failed: Vec<_> = response.results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_ref().unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn cancel_signal_routes_to_bulk_cancel() {
        let f = fixture().await;
        // Create three open orders via a signal first.
        let response = f.dispatcher.process(signal("0.04")).await;
        assert_eq!(response.summary.successful_orders, 3);

        // Mock fabricates OPEN orders, so rows persist; LIMIT keeps them.
        let request: WebhookRequest = serde_json::from_value(json!({
            "group_name": "s1",
            "token": "hook-secret",
            "action": "trading_signal",
            "order_type": "CANCEL",
            "symbol": "BTC/USDT",
        }))
        .unwrap();
        let response = f.dispatcher.process(request).await;
        assert!(response.success);
        let report = response.cancel_report.unwrap();
        assert_eq!(report["total_processed"], 3);
        assert_eq!(report["cancelled_orders"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn quantity_accepts_both_string_and_number() {
        let request: WebhookRequest = serde_json::from_value(json!({
            "group_name": "s1",
            "token": "t",
            "action": "trading_signal",
            "quantity": 0.25,
        }))
        .unwrap();
        assert_eq!(request.quantity, Some(dec!(0.25)));

        let request: WebhookRequest = serde_json::from_value(json!({
            "group_name": "s1",
            "token": "t",
            "action": "trading_signal",
            "quantity": "0.5",
        }))
        .unwrap();
        assert_eq!(request.quantity, Some(dec!(0.5)));
    }

    #[test]
    fn constant_time_eq_basic_properties() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
    }
}
