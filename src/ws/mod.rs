// =============================================================================
// WebSocket Connection Pool — per-account user-data streams
// =============================================================================
//
// One task per (account, market): create a listen key, connect, renew the key
// every 30 minutes, and feed every order-update frame through the fill
// pipeline. A connection only counts as registered after the open handshake
// succeeds — a failed dial never leaves a ghost entry that looks live.
//
// Each inbound message is handled in its own short-lived call; the database
// lock is taken per statement, never across a socket read. A frame that fails
// to parse is logged raw and alerted — silently dropping a fill is the one
// unacceptable failure mode.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::exchange::AdapterSource;
use crate::fills::FillMonitor;
use crate::sse::{AccountInfo, EventHub, OrderEvent};
use crate::types::{FillEvent, MarketType, OrderSide, OrderStatus};

/// Listen keys are renewed on this cadence (Binance invalidates at 60 min).
const LISTEN_KEY_RENEW_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

struct ConnectionHandle {
    task: tokio::task::JoinHandle<()>,
    connected: Arc<AtomicBool>,
    wanted: Arc<AtomicBool>,
}

/// Pool of user-data stream connections keyed by (account_id, market_type).
pub struct WsConnectionPool {
    db: Database,
    fills: Arc<FillMonitor>,
    hub: Arc<EventHub>,
    adapters: Arc<dyn AdapterSource>,
    connections: RwLock<HashMap<(i64, MarketType), ConnectionHandle>>,
}

impl WsConnectionPool {
    pub fn new(
        db: Database,
        fills: Arc<FillMonitor>,
        hub: Arc<EventHub>,
        adapters: Arc<dyn AdapterSource>,
    ) -> Self {
        Self {
            db,
            fills,
            hub,
            adapters,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Registered AND past the open handshake.
    pub fn is_connected(&self, account_id: i64, market_type: MarketType) -> bool {
        self.connections
            .read()
            .get(&(account_id, market_type))
            .map(|h| h.connected.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Align the pool with the set of active (account, market) pairs: spawn
    /// missing connections, tear down stale ones. Called at startup and on a
    /// periodic sweep.
    pub async fn sync_connections(self: &Arc<Self>) -> Result<()> {
        let targets = self.db.active_account_markets().await?;
        let mut desired: HashMap<(i64, MarketType), crate::db::AccountRow> = HashMap::new();
        for (account, market_type) in targets {
            desired.insert((account.id, market_type), account);
        }

        // Tear down connections for unbound accounts.
        let stale: Vec<(i64, MarketType)> = {
            let connections = self.connections.read();
            connections
                .keys()
                .filter(|key| !desired.contains_key(key))
                .copied()
                .collect()
        };
        for (account_id, market_type) in stale {
            self.disconnect_account(account_id, market_type);
        }

        // Spawn what is missing.
        for ((account_id, market_type), account) in desired {
            let already = self
                .connections
                .read()
                .get(&(account_id, market_type))
                .map(|h| !h.task.is_finished())
                .unwrap_or(false);
            if already {
                continue;
            }
            let adapter = match self.adapters.adapter_for(&account, market_type).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(account_id, error = %e, "adapter construction failed");
                    continue;
                }
            };
            if !adapter.supports_user_stream() {
                continue;
            }
            self.spawn_connection(account, market_type);
        }
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, account: crate::db::AccountRow, market_type: MarketType) {
        let connected = Arc::new(AtomicBool::new(false));
        let wanted = Arc::new(AtomicBool::new(true));
        let pool = self.clone();
        let task_connected = connected.clone();
        let task_wanted = wanted.clone();
        let account_id = account.id;

        let task = tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            while task_wanted.load(Ordering::Relaxed) {
                match pool
                    .run_session(&account, market_type, &task_connected, &task_wanted)
                    .await
                {
                    Ok(()) => {
                        backoff = BACKOFF_INITIAL;
                        info!(account_id, "user stream closed — reconnecting");
                    }
                    Err(e) => {
                        warn!(account_id, error = %e, "user stream error — reconnecting");
                    }
                }
                task_connected.store(false, Ordering::Relaxed);
                if !task_wanted.load(Ordering::Relaxed) {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        });

        self.connections.write().insert(
            (account_id, market_type),
            ConnectionHandle {
                task,
                connected,
                wanted,
            },
        );
        info!(account_id, market_type = %market_type, "user stream connection spawned");
    }

    /// Stop tracking an account. The renewer dies with the session task; the
    /// flag stops the reconnect loop.
    pub fn disconnect_account(&self, account_id: i64, market_type: MarketType) {
        if let Some(handle) = self.connections.write().remove(&(account_id, market_type)) {
            handle.wanted.store(false, Ordering::Relaxed);
            handle.task.abort();
            info!(account_id, market_type = %market_type, "user stream disconnected");
        }
    }

    pub fn shutdown(&self) {
        let mut connections = self.connections.write();
        for (_, handle) in connections.drain() {
            handle.wanted.store(false, Ordering::Relaxed);
            handle.task.abort();
        }
    }

    /// One connect-to-close session: listen key, handshake, renew timer,
    /// read loop.
    async fn run_session(
        &self,
        account: &crate::db::AccountRow,
        market_type: MarketType,
        connected: &AtomicBool,
        wanted: &AtomicBool,
    ) -> Result<()> {
        let adapter = self.adapters.adapter_for(account, market_type).await?;

        let listen_key = adapter.create_listen_key().await?;
        let url = adapter.user_stream_url(&listen_key)?;
        debug!(account_id = account.id, "connecting user stream");

        let (ws_stream, _response) = connect_async(&url).await?;
        // Handshake done — only now does the connection count as live.
        connected.store(true, Ordering::Relaxed);
        let session_id = self
            .db
            .open_tracking_session(account.id, market_type)
            .await?;
        info!(account_id = account.id, session_id, "user stream connected");

        let (_write, mut read) = ws_stream.split();
        let messages = AtomicU64::new(0);

        // Renewer: a failed keepalive schedules a reconnect instead of
        // killing the outer loop.
        let renew_failed = Arc::new(Notify::new());
        let renewer = {
            let adapter = adapter.clone();
            let listen_key = listen_key.clone();
            let renew_failed = renew_failed.clone();
            let account_id = account.id;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(LISTEN_KEY_RENEW_INTERVAL);
                interval.tick().await; // first tick is immediate
                loop {
                    interval.tick().await;
                    if let Err(e) = adapter.keepalive_listen_key(&listen_key).await {
                        warn!(account_id, error = %e, "listen key renewal failed");
                        renew_failed.notify_one();
                        break;
                    }
                    debug!(account_id, "listen key renewed");
                }
            })
        };

        let reason = loop {
            tokio::select! {
                _ = renew_failed.notified() => break "listen_key_renewal_failed",
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        messages.fetch_add(1, Ordering::Relaxed);
                        // Per-message scope: a failure here never ends the
                        // receive loop.
                        if let Err(e) = handle_stream_message(
                            &self.db,
                            &self.fills,
                            &self.hub,
                            account.id,
                            market_type,
                            &text,
                        )
                        .await
                        {
                            warn!(account_id = account.id, error = %e, "stream message handling failed");
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break "connection_closed",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(account_id = account.id, error = %e, "websocket read error");
                        break "read_error";
                    }
                },
            }
            if !wanted.load(Ordering::Relaxed) {
                break "disconnect_requested";
            }
        };

        // The renewer must be gone before the socket drops.
        renewer.abort();
        let _ = renewer.await;

        connected.store(false, Ordering::Relaxed);
        self.db
            .close_tracking_session(session_id, reason, messages.load(Ordering::Relaxed))
            .await?;
        info!(account_id = account.id, reason, "user stream session ended");
        Ok(())
    }
}

impl std::fmt::Debug for WsConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnectionPool")
            .field("connections", &self.connections.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// What one frame did — used by tests and the session loop.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    FillApplied,
    OrderCancelled,
    IdPatched,
    Ignored,
}

/// Parse and apply one user-data frame. Parse failures on order-update frames
/// are escalated: the raw frame is logged and an alert is fired, because a
/// silently lost fill corrupts positions.
pub async fn handle_stream_message(
    db: &Database,
    fills: &FillMonitor,
    hub: &EventHub,
    account_id: i64,
    market_type: MarketType,
    text: &str,
) -> Result<StreamOutcome> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            if text.contains("ORDER_TRADE_UPDATE") || text.contains("executionReport") {
                error!(
                    account_id,
                    raw_frame = text,
                    error = %e,
                    alert = true,
                    "CRITICAL: unparseable order update frame — possible lost fill"
                );
            } else {
                debug!(account_id, error = %e, "unparseable stream frame ignored");
            }
            return Ok(StreamOutcome::Ignored);
        }
    };

    let event_type = value["e"].as_str().unwrap_or_default();
    let update = match event_type {
        // Futures wraps the order payload in "o"; spot is flat.
        "ORDER_TRADE_UPDATE" => &value["o"],
        "executionReport" => &value,
        _ => return Ok(StreamOutcome::Ignored),
    };

    match parse_order_update(update, market_type) {
        Ok(parsed) => apply_order_update(db, fills, hub, account_id, parsed).await,
        Err(e) => {
            error!(
                account_id,
                raw_frame = text,
                error = %e,
                alert = true,
                "CRITICAL: order update frame missing required fields"
            );
            Ok(StreamOutcome::Ignored)
        }
    }
}

/// Normalized view of a Binance order-update frame.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub execution_type: String,
    pub last_fill_quantity: Decimal,
    pub last_fill_price: Decimal,
    pub trade_id: Option<String>,
    pub commission: Decimal,
    pub is_maker: bool,
    pub trade_time_ms: i64,
    pub market_type: MarketType,
}

fn dec_field(value: &serde_json::Value) -> Decimal {
    value
        .as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

pub fn parse_order_update(
    update: &serde_json::Value,
    market_type: MarketType,
) -> Result<OrderUpdate> {
    let order_id = update["i"]
        .as_i64()
        .map(|id| id.to_string())
        .ok_or_else(|| anyhow::anyhow!("order id 'i' missing"))?;
    let symbol_raw = update["s"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("symbol 's' missing"))?;
    let side = OrderSide::parse(update["S"].as_str().unwrap_or_default())
        .ok_or_else(|| anyhow::anyhow!("side 'S' missing"))?;
    let status = OrderStatus::parse(update["X"].as_str().unwrap_or_default())
        .ok_or_else(|| anyhow::anyhow!("status 'X' missing"))?;

    Ok(OrderUpdate {
        exchange_order_id: order_id,
        client_order_id: update["c"].as_str().map(|s| s.to_string()).filter(|s| !s.is_empty()),
        symbol: symbol_raw.to_string(),
        side,
        status,
        execution_type: update["x"].as_str().unwrap_or_default().to_string(),
        last_fill_quantity: dec_field(&update["l"]),
        last_fill_price: dec_field(&update["L"]),
        trade_id: update["t"].as_i64().filter(|t| *t > 0).map(|t| t.to_string()),
        commission: dec_field(&update["n"]),
        is_maker: update["m"].as_bool().unwrap_or(false),
        trade_time_ms: update["T"].as_i64().unwrap_or_default(),
        market_type,
    })
}

/// Route a parsed update to the right local row and through the fill
/// pipeline. Rows still carrying a placeholder id are matched by client
/// reference and patched first — the WS-before-REST race resolves here.
async fn apply_order_update(
    db: &Database,
    fills: &FillMonitor,
    hub: &EventHub,
    account_id: i64,
    update: OrderUpdate,
) -> Result<StreamOutcome> {
    // Find the local row: real id first, client reference second.
    let mut row = db
        .open_order_by_exchange_id(&update.exchange_order_id)
        .await?;
    let mut patched = false;
    if row.is_none() {
        if let Some(client_ref) = &update.client_order_id {
            if let Some(pending) = db.open_order_by_client_id(client_ref).await? {
                if pending.has_placeholder_id() {
                    db.patch_exchange_order_id(
                        pending.id,
                        &update.exchange_order_id,
                        if update.status.is_closed() {
                            OrderStatus::Open
                        } else {
                            update.status
                        },
                        pending.filled_quantity,
                    )
                    .await?;
                    patched = true;
                    debug!(
                        order_id = %update.exchange_order_id,
                        client_ref,
                        "placeholder id patched from stream"
                    );
                }
                row = db
                    .open_order_by_exchange_id(&update.exchange_order_id)
                    .await?;
            }
        }
    }

    let Some(row) = row else {
        debug!(
            account_id,
            order_id = %update.exchange_order_id,
            "stream update for untracked order ignored"
        );
        return Ok(StreamOutcome::Ignored);
    };

    // Fills flow through the canonical pipeline (dedup on trade id).
    if !update.last_fill_quantity.is_zero() && update.execution_type == "TRADE" {
        let fill = FillEvent {
            strategy_account_id: row.strategy_account_id,
            symbol: row.symbol.clone(),
            side: update.side,
            price: update.last_fill_price,
            quantity: update.last_fill_quantity,
            exchange_trade_id: update.trade_id.clone(),
            exchange_order_id: update.exchange_order_id.clone(),
            commission: update.commission,
            is_maker: update.is_maker,
            execution_time: Utc
                .timestamp_millis_opt(update.trade_time_ms)
                .single()
                .unwrap_or_else(Utc::now),
            market_type: update.market_type,
        };
        fills.process_fill(&fill).await?;
        return Ok(StreamOutcome::FillApplied);
    }

    // Cancels and expiries delete the row and tell the subscribers.
    if matches!(update.status, OrderStatus::Canceled | OrderStatus::Expired) {
        db.delete_open_order(&update.exchange_order_id).await?;
        if let Some(context) = db.binding_context(row.strategy_account_id).await? {
            hub.emit_order_event(OrderEvent {
                event_type: "order_cancelled".to_string(),
                order_id: update.exchange_order_id.clone(),
                symbol: row.symbol.clone(),
                strategy_id: context.strategy_id,
                user_id: context.user_id,
                side: row.side.as_str().to_string(),
                order_type: row.order_type.as_str().to_string(),
                quantity: row.quantity.to_string(),
                price: row.price.map(|p| p.to_string()),
                stop_price: row.stop_price.map(|p| p.to_string()),
                status: update.status.as_str().to_string(),
                account: AccountInfo {
                    name: context.account_name,
                    exchange: context.exchange,
                },
                timestamp: Utc::now().to_rfc3339(),
                suppress_toast: false,
            })
            .await;
        }
        return Ok(StreamOutcome::OrderCancelled);
    }

    if patched {
        return Ok(StreamOutcome::IdPatched);
    }
    Ok(StreamOutcome::Ignored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::EventHub;
    use crate::types::OrderType;
    use rust_decimal_macros::dec;

    async fn fixture() -> (Database, FillMonitor, Arc<EventHub>, i64, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("alice", "tok", false).await.unwrap();
        let account = db
            .insert_account(user, "main", "binance", "CRYPTO", "k", "s", false)
            .await
            .unwrap();
        let strategy = db
            .insert_strategy(user, "Momentum", "momo", "secret", MarketType::Spot)
            .await
            .unwrap();
        let sa = db
            .insert_strategy_account(strategy, account, dec!(1))
            .await
            .unwrap();
        let hub = Arc::new(EventHub::new(db.clone()));
        let fills = FillMonitor::new(db.clone(), hub.clone());
        (db, fills, hub, account, sa, strategy)
    }

    fn spot_execution_report(
        order_id: i64,
        client_ref: &str,
        status: &str,
        exec_type: &str,
        last_qty: &str,
        last_price: &str,
        trade_id: i64,
    ) -> String {
        serde_json::json!({
            "e": "executionReport",
            "s": "BTCUSDT",
            "c": client_ref,
            "S": "BUY",
            "o": "LIMIT",
            "x": exec_type,
            "X": status,
            "i": order_id,
            "l": last_qty,
            "L": last_price,
            "z": last_qty,
            "n": "0.0001",
            "T": 1700000000000i64,
            "t": trade_id,
            "m": true
        })
        .to_string()
    }

    #[test]
    fn parses_futures_order_trade_update_payload() {
        let value = serde_json::json!({
            "s": "BTCUSDT",
            "c": "sg-abc",
            "S": "SELL",
            "o": "MARKET",
            "x": "TRADE",
            "X": "FILLED",
            "i": 8886774i64,
            "l": "0.5",
            "L": "42100.10",
            "n": "0.014",
            "T": 1700000000000i64,
            "t": 1234i64,
            "m": false
        });
        let parsed = parse_order_update(&value, MarketType::Futures).unwrap();
        assert_eq!(parsed.exchange_order_id, "8886774");
        assert_eq!(parsed.side, OrderSide::Sell);
        assert_eq!(parsed.status, OrderStatus::Filled);
        assert_eq!(parsed.last_fill_quantity, dec!(0.5));
        assert_eq!(parsed.trade_id.as_deref(), Some("1234"));
    }

    #[tokio::test]
    async fn fill_arriving_before_rest_response_matches_by_client_reference() {
        let (db, fills, hub, account, sa, _strategy) = fixture().await;

        // The PENDING row exists; the REST response has not returned yet.
        db.insert_pending_order(
            sa,
            "PENDING-race",
            "sg-race",
            "BTC/USDT",
            OrderSide::Buy,
            OrderType::Limit,
            Some(dec!(42000)),
            None,
            dec!(0.5),
            MarketType::Spot,
        )
        .await
        .unwrap();

        let frame = spot_execution_report(777, "sg-race", "FILLED", "TRADE", "0.5", "42000", 99);
        let outcome =
            handle_stream_message(&db, &fills, &hub, account, MarketType::Spot, &frame)
                .await
                .unwrap();
        assert_eq!(outcome, StreamOutcome::FillApplied);

        // Exactly one execution; the row was patched to the real id and then
        // deleted by the full fill.
        assert!(db.execution_by_trade_id("99").await.unwrap().is_some());
        assert!(db.open_order_by_exchange_id("777").await.unwrap().is_none());
        assert!(db.open_order_by_client_id("sg-race").await.unwrap().is_none());

        // Replaying the frame applies nothing new.
        let outcome =
            handle_stream_message(&db, &fills, &hub, account, MarketType::Spot, &frame)
                .await
                .unwrap();
        assert_eq!(outcome, StreamOutcome::Ignored);
    }

    #[tokio::test]
    async fn cancellation_frame_deletes_the_row() {
        let (db, fills, hub, account, sa, _strategy) = fixture().await;
        db.insert_pending_order(
            sa,
            "888",
            "sg-c",
            "BTC/USDT",
            OrderSide::Buy,
            OrderType::Limit,
            Some(dec!(42000)),
            None,
            dec!(0.5),
            MarketType::Spot,
        )
        .await
        .unwrap();
        db.reconcile_order_status("888", OrderStatus::Open, dec!(0))
            .await
            .unwrap();

        let frame = spot_execution_report(888, "sg-c", "CANCELED", "CANCELED", "0", "0", -1);
        let outcome =
            handle_stream_message(&db, &fills, &hub, account, MarketType::Spot, &frame)
                .await
                .unwrap();
        assert_eq!(outcome, StreamOutcome::OrderCancelled);
        assert!(db.open_order_by_exchange_id("888").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_orders_and_garbage_frames_are_ignored() {
        let (db, fills, hub, account, _sa, _strategy) = fixture().await;

        let frame = spot_execution_report(999, "sg-unknown", "FILLED", "TRADE", "1", "100", 5);
        let outcome =
            handle_stream_message(&db, &fills, &hub, account, MarketType::Spot, &frame)
                .await
                .unwrap();
        assert_eq!(outcome, StreamOutcome::Ignored);

        // Garbage never panics and never kills the loop.
        let outcome = handle_stream_message(
            &db,
            &fills,
            &hub,
            account,
            MarketType::Spot,
            "{not json at all",
        )
        .await
        .unwrap();
        assert_eq!(outcome, StreamOutcome::Ignored);
    }
}
