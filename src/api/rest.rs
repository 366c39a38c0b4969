// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The webhook endpoint is open (signal authenticity is the in-body token);
// everything else requires a Bearer token resolved against the users table.
// Error bodies are `{success: false, error, details?}` with the HTTP status
// aligned to the failure class.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthUser;
use crate::app_state::AppState;
use crate::db::{FailedOrderStatus, OpenOrderFilter};
use crate::error::ExchangeError;
use crate::orders::CancelOutcome;
use crate::sse::EventHub;
use crate::types::OrderSide;
use crate::webhook::WebhookRequest;

/// Heartbeat cadence on idle SSE streams.
const SSE_HEARTBEAT: Duration = Duration::from_secs(10);

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/health", get(health))
        .route("/api/webhook", post(webhook))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/failed-orders", get(list_failed_orders))
        .route("/api/failed-orders/:id/retry", post(retry_failed_order))
        .route("/api/failed-orders/:id", delete(delete_failed_order))
        .route("/api/open-orders", get(list_open_orders))
        .route("/api/open-orders/:order_id/cancel", post(cancel_order))
        .route("/api/open-orders/cancel-all", post(cancel_all_orders))
        .route(
            "/api/cancel-queue/orders/:order_id/cancel",
            post(cancel_via_queue),
        )
        .route("/api/events/stream", get(events_stream))
        .route("/api/strategies/:id", delete(delete_strategy))
        // ── Middleware & State ───────────────────────────────────────
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

/// Error body shape shared by every route.
fn error_response(error: &ExchangeError) -> (StatusCode, Json<serde_json::Value>) {
    (
        error.status_code(),
        Json(json!({
            "success": false,
            "error": error.to_string(),
        })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "sse": state.hub.statistics(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Webhook (public — token lives in the body)
// =============================================================================

/// Well-formed requests always answer 200; per-account failures are in the
/// body breakdown.
async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WebhookRequest>,
) -> impl IntoResponse {
    info!(group_name = %request.group_name, action = %request.action, "webhook received");
    let response = state.dispatcher.process(request).await;
    Json(response)
}

// =============================================================================
// Failed orders (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct FailedOrderQuery {
    strategy_account_id: Option<i64>,
    symbol: Option<String>,
}

async fn list_failed_orders(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<FailedOrderQuery>,
) -> impl IntoResponse {
    match state
        .db
        .failed_orders_for_user(user.id, query.strategy_account_id, query.symbol.as_deref())
        .await
    {
        Ok(orders) => {
            let total_count = orders.len();
            Json(json!({
                "success": true,
                "failed_orders": orders,
                "total_count": total_count,
            }))
            .into_response()
        }
        Err(e) => error_response(&ExchangeError::Internal(e.to_string())).into_response(),
    }
}

async fn retry_failed_order(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.order_manager.retry_failed_order(user.id, id).await {
        Ok(placed) => Json(json!({
            "success": true,
            "order_id": placed.exchange_order_id,
            "status": placed.status,
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn delete_failed_order(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let row = match state.db.failed_order_for_user(user.id, id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return error_response(&ExchangeError::OrderNotFound(format!("failed order {id}")))
                .into_response()
        }
        Err(e) => return error_response(&ExchangeError::Internal(e.to_string())).into_response(),
    };
    match state
        .db
        .update_failed_order(row.id, FailedOrderStatus::Removed, row.retry_count)
        .await
    {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => error_response(&ExchangeError::Internal(e.to_string())).into_response(),
    }
}

// =============================================================================
// Open orders (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct OpenOrderQuery {
    strategy_id: Option<i64>,
    symbol: Option<String>,
}

async fn list_open_orders(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpenOrderQuery>,
) -> impl IntoResponse {
    let filter = OpenOrderFilter {
        strategy_id: query.strategy_id,
        symbol: query.symbol,
        ..Default::default()
    };
    match state.db.open_orders_for_user(user.id, &filter).await {
        Ok(orders) => {
            let total_count = orders.len();
            Json(json!({
                "success": true,
                "open_orders": orders,
                "total_count": total_count,
            }))
            .into_response()
        }
        Err(e) => error_response(&ExchangeError::Internal(e.to_string())).into_response(),
    }
}

async fn cancel_order(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match state
        .order_manager
        .cancel_order_for_user(user.id, &order_id)
        .await
    {
        Ok(CancelOutcome::Cancelled { symbol }) => Json(json!({
            "success": true,
            "order_id": order_id,
            "symbol": symbol,
        }))
        .into_response(),
        Ok(CancelOutcome::Queued { queue_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "queued": true,
                "queue_id": queue_id,
                "order_id": order_id,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
struct CancelAllRequest {
    strategy_id: i64,
    account_id: Option<i64>,
    symbol: Option<String>,
    side: Option<String>,
}

async fn cancel_all_orders(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(request): Json<CancelAllRequest>,
) -> impl IntoResponse {
    // Authorization is via strategy ownership.
    match state
        .db
        .user_can_access_strategy(user.id, request.strategy_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return error_response(&ExchangeError::Permission(
                "strategy belongs to another user".into(),
            ))
            .into_response()
        }
        Err(e) => return error_response(&ExchangeError::Internal(e.to_string())).into_response(),
    }

    let filter = OpenOrderFilter {
        strategy_id: Some(request.strategy_id),
        account_id: request.account_id,
        symbol: request.symbol,
        side: request.side.as_deref().and_then(OrderSide::parse),
    };
    match state.order_manager.cancel_all_for_user(user.id, &filter).await {
        Ok(report) => Json(json!({
            "success": report.failed_orders.is_empty(),
            "cancelled_orders": report.cancelled_orders,
            "failed_orders": report.failed_orders,
            "total_processed": report.total_processed,
            "filter_conditions": report.filter_conditions,
        }))
        .into_response(),
        Err(e) => error_response(&ExchangeError::Internal(e.to_string())).into_response(),
    }
}

/// Explicit queue endpoint: 202 + queue item for a PENDING order, 200 for an
/// immediate cancel, 409 for terminal orders.
async fn cancel_via_queue(
    auth: AuthUser,
    state: State<Arc<AppState>>,
    path: Path<String>,
) -> impl IntoResponse {
    cancel_order(auth, state, path).await
}

// =============================================================================
// SSE stream (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct EventStreamQuery {
    strategy_id: i64,
}

/// Unsubscribes when the HTTP stream is dropped.
struct SubscriptionGuard {
    hub: Arc<EventHub>,
    user_id: i64,
    strategy_id: i64,
    id: uuid::Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub
            .unsubscribe(self.user_id, self.strategy_id, self.id);
    }
}

async fn events_stream(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventStreamQuery>,
) -> axum::response::Response {
    if query.strategy_id <= 0 {
        return error_response(&ExchangeError::Validation(
            "strategy_id must be positive".into(),
        ))
        .into_response();
    }
    match state
        .db
        .user_can_access_strategy(user.id, query.strategy_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return error_response(&ExchangeError::Permission(
                "no access to this strategy".into(),
            ))
            .into_response()
        }
        Err(e) => {
            return error_response(&ExchangeError::Internal(e.to_string())).into_response()
        }
    }

    let subscription = state.hub.subscribe(user.id, query.strategy_id);
    let guard = SubscriptionGuard {
        hub: state.hub.clone(),
        user_id: user.id,
        strategy_id: query.strategy_id,
        id: subscription.id,
    };
    info!(user_id = user.id, strategy_id = query.strategy_id, "sse stream opened");

    let stream = event_stream(subscription.receiver, guard);
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        "Cache-Control",
        axum::http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        "X-Accel-Buffering",
        axum::http::HeaderValue::from_static("no"),
    );
    response
}

/// Turn hub messages into SSE frames, heartbeating on idle and ending the
/// stream after a force_disconnect.
fn event_stream(
    receiver: tokio::sync::mpsc::Receiver<crate::sse::HubMessage>,
    guard: SubscriptionGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(
        (receiver, guard, false),
        |(mut receiver, guard, closing)| async move {
            if closing {
                return None;
            }
            loop {
                match tokio::time::timeout(SSE_HEARTBEAT, receiver.recv()).await {
                    Ok(Some(message)) => {
                        let closing = message.event_type == "force_disconnect";
                        let event = Event::default()
                            .event(message.event_type.clone())
                            .data(message.data.to_string());
                        return Some((Ok(event), (receiver, guard, closing)));
                    }
                    Ok(None) => return None,
                    Err(_) => {
                        let heartbeat = Event::default().event("heartbeat").data(
                            json!({"timestamp": chrono::Utc::now().to_rfc3339()}).to_string(),
                        );
                        return Some((Ok(heartbeat), (receiver, guard, false)));
                    }
                }
            }
        },
    )
}

// =============================================================================
// Admin-triggered lifecycle (authenticated, admin only)
// =============================================================================

pub async fn delete_strategy(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(strategy_id): Path<i64>,
) -> impl IntoResponse {
    let strategy = match state.db.strategy_by_id(strategy_id).await {
        Ok(Some(strategy)) => strategy,
        Ok(None) => {
            return error_response(&ExchangeError::OrderNotFound(format!(
                "strategy {strategy_id}"
            )))
            .into_response()
        }
        Err(e) => return error_response(&ExchangeError::Internal(e.to_string())).into_response(),
    };
    if strategy.user_id != user.id && !user.is_admin {
        return error_response(&ExchangeError::Permission(
            "strategy belongs to another user".into(),
        ))
        .into_response();
    }
    match state.delete_strategy(strategy_id).await {
        Ok(disconnected) => Json(json!({
            "success": true,
            "strategy_id": strategy_id,
            "disconnected_clients": disconnected,
        }))
        .into_response(),
        Err(e) => {
            warn!(strategy_id, error = %e, "strategy removal failed");
            error_response(&ExchangeError::Internal(e.to_string())).into_response()
        }
    }
}
