// =============================================================================
// SSE Event Hub — strategy-scoped live updates with per-client isolation
// =============================================================================
//
// Subscriptions are keyed by (user_id, strategy_id); a client only ever sees
// events for the strategy it subscribed to. Queues are bounded (50): a client
// that cannot drain is dropped rather than allowed to pin memory. Publishing
// validates that the strategy is still active — events for deleted or
// disabled strategies are silently discarded.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::Database;

/// Bound on each subscriber's in-flight queue.
const CLIENT_QUEUE_CAPACITY: usize = 50;

/// One framed SSE message: the `event:` name plus its JSON `data:` payload.
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Why a client was force-disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    StrategyDeleted,
    PermissionRevoked,
    AccountDeactivated,
    SessionExpired,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrategyDeleted => "strategy_deleted",
            Self::PermissionRevoked => "permission_revoked",
            Self::AccountDeactivated => "account_deactivated",
            Self::SessionExpired => "session_expired",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::StrategyDeleted => "The strategy was deleted. Closing the connection.",
            Self::PermissionRevoked => "Strategy access was revoked. Closing the connection.",
            Self::AccountDeactivated => "The account was deactivated. Closing the connection.",
            Self::SessionExpired => "The session expired. Please sign in again.",
        }
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub name: String,
    pub exchange: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderEvent {
    /// order_created | order_updated | order_filled | order_cancelled
    pub event_type: String,
    pub order_id: String,
    pub symbol: String,
    pub strategy_id: i64,
    pub user_id: i64,
    pub side: String,
    pub order_type: String,
    pub quantity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
    pub status: String,
    pub account: AccountInfo,
    pub timestamp: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub suppress_toast: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    /// position_created | position_updated | position_closed
    pub event_type: String,
    pub position_id: i64,
    pub symbol: String,
    pub strategy_id: i64,
    pub user_id: i64,
    pub quantity: String,
    pub entry_price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_quantity: Option<String>,
    pub account: AccountInfo,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderBatchSummary {
    pub order_type: String,
    pub created: u32,
    pub cancelled: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderBatchEvent {
    pub summaries: Vec<OrderBatchSummary>,
    pub strategy_id: i64,
    pub user_id: i64,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

struct Subscriber {
    id: Uuid,
    sender: mpsc::Sender<HubMessage>,
}

/// In-memory registry of SSE subscribers.
pub struct EventHub {
    clients: RwLock<HashMap<(i64, i64), Vec<Subscriber>>>,
    db: Database,
}

/// Handle returned by `subscribe`; dropping the receiver ends the
/// subscription at the next publish.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<HubMessage>,
}

impl EventHub {
    pub fn new(db: Database) -> Self {
        info!("event hub initialised (strategy-scoped isolation)");
        Self {
            clients: RwLock::new(HashMap::new()),
            db,
        }
    }

    // -------------------------------------------------------------------------
    // Subscription lifecycle
    // -------------------------------------------------------------------------

    /// Register a subscriber and immediately queue the `connection` event.
    pub fn subscribe(&self, user_id: i64, strategy_id: i64) -> Subscription {
        let (sender, receiver) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = Uuid::new_v4();

        let connection = HubMessage {
            event_type: "connection".to_string(),
            data: json!({
                "status": "connected",
                "user_id": user_id,
                "strategy_id": strategy_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        };
        // Capacity is 50 and the channel is brand new; this cannot fail.
        let _ = sender.try_send(connection);

        let mut clients = self.clients.write();
        let entry = clients.entry((user_id, strategy_id)).or_default();
        entry.push(Subscriber { id, sender });
        info!(
            user_id,
            strategy_id,
            total = entry.len(),
            "sse client subscribed"
        );

        Subscription { id, receiver }
    }

    /// Remove one subscriber (client closed its stream).
    pub fn unsubscribe(&self, user_id: i64, strategy_id: i64, id: Uuid) {
        let mut clients = self.clients.write();
        if let Some(entry) = clients.get_mut(&(user_id, strategy_id)) {
            entry.retain(|s| s.id != id);
            if entry.is_empty() {
                clients.remove(&(user_id, strategy_id));
            }
            info!(user_id, strategy_id, "sse client unsubscribed");
        }
    }

    pub fn subscriber_count(&self, user_id: i64, strategy_id: i64) -> usize {
        self.clients
            .read()
            .get(&(user_id, strategy_id))
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Total subscribers across every key of one strategy.
    pub fn strategy_subscriber_count(&self, strategy_id: i64) -> usize {
        self.clients
            .read()
            .iter()
            .filter(|((_, sid), _)| *sid == strategy_id)
            .map(|(_, subs)| subs.len())
            .sum()
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    pub async fn emit_order_event(&self, event: OrderEvent) {
        if !self.validate_strategy(event.strategy_id).await {
            return;
        }
        let user_id = event.user_id;
        let strategy_id = event.strategy_id;
        let message = HubMessage {
            event_type: "order_update".to_string(),
            data: serde_json::to_value(&event).unwrap_or_default(),
        };
        self.deliver(user_id, strategy_id, message);
        info!(
            event_type = %event.event_type,
            symbol = %event.symbol,
            strategy_id,
            "order event published"
        );
    }

    pub async fn emit_position_event(&self, event: PositionEvent) {
        if !self.validate_strategy(event.strategy_id).await {
            return;
        }
        let user_id = event.user_id;
        let strategy_id = event.strategy_id;
        let message = HubMessage {
            event_type: "position_update".to_string(),
            data: serde_json::to_value(&event).unwrap_or_default(),
        };
        self.deliver(user_id, strategy_id, message);
        debug!(
            event_type = %event.event_type,
            symbol = %event.symbol,
            strategy_id,
            "position event published"
        );
    }

    /// Collapse a burst of order actions into one frame per order type.
    pub async fn emit_order_batch_event(&self, event: OrderBatchEvent) {
        if event.summaries.is_empty() {
            debug!("empty batch summaries — skipped");
            return;
        }
        if !self.validate_strategy(event.strategy_id).await {
            return;
        }
        let message = HubMessage {
            event_type: "order_batch_update".to_string(),
            data: json!({
                "summaries": event.summaries,
                "timestamp": event.timestamp,
            }),
        };
        self.deliver(event.user_id, event.strategy_id, message);
        info!(
            summaries = event.summaries.len(),
            strategy_id = event.strategy_id,
            "batch event published"
        );
    }

    /// `strategy_id` must be positive and refer to an active strategy at
    /// publish time.
    async fn validate_strategy(&self, strategy_id: i64) -> bool {
        if strategy_id <= 0 {
            warn!(strategy_id, "event blocked: invalid strategy id");
            return false;
        }
        match self.db.strategy_is_active(strategy_id).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(strategy_id, "event blocked: strategy missing or inactive");
                false
            }
            Err(e) => {
                warn!(strategy_id, error = %e, "event blocked: strategy lookup failed");
                false
            }
        }
    }

    /// Deliver to every subscriber under the key; subscribers whose queue is
    /// full or closed are marked dead and removed after the loop.
    fn deliver(&self, user_id: i64, strategy_id: i64, message: HubMessage) {
        let mut clients = self.clients.write();
        let Some(entry) = clients.get_mut(&(user_id, strategy_id)) else {
            return;
        };

        let mut dead: Vec<Uuid> = Vec::new();
        for subscriber in entry.iter() {
            if subscriber.sender.try_send(message.clone()).is_err() {
                dead.push(subscriber.id);
            }
        }

        if !dead.is_empty() {
            entry.retain(|s| !dead.contains(&s.id));
            debug!(
                user_id,
                strategy_id,
                removed = dead.len(),
                "dead sse clients removed"
            );
            if entry.is_empty() {
                clients.remove(&(user_id, strategy_id));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Force disconnect
    // -------------------------------------------------------------------------

    /// Drop every subscriber of `strategy_id` (any user) after injecting a
    /// `force_disconnect`. Called synchronously before the strategy row is
    /// removed.
    pub fn cleanup_strategy_clients(&self, strategy_id: i64) -> usize {
        let mut clients = self.clients.write();
        let keys: Vec<(i64, i64)> = clients
            .keys()
            .filter(|(_, sid)| *sid == strategy_id)
            .copied()
            .collect();

        let mut cleaned = 0;
        for key in keys {
            if let Some(entry) = clients.remove(&key) {
                for subscriber in &entry {
                    let _ = subscriber.sender.try_send(Self::disconnect_message(
                        strategy_id,
                        DisconnectReason::StrategyDeleted,
                    ));
                    cleaned += 1;
                }
                info!(
                    user_id = key.0,
                    strategy_id,
                    clients = entry.len(),
                    "strategy clients force-disconnected"
                );
            }
        }
        cleaned
    }

    /// Drop the subscribers of one (user, strategy) key with an explicit
    /// reason.
    pub fn disconnect_client(
        &self,
        user_id: i64,
        strategy_id: i64,
        reason: DisconnectReason,
    ) -> usize {
        let mut clients = self.clients.write();
        let Some(entry) = clients.remove(&(user_id, strategy_id)) else {
            return 0;
        };
        for subscriber in &entry {
            let _ = subscriber
                .sender
                .try_send(Self::disconnect_message(strategy_id, reason));
        }
        info!(
            user_id,
            strategy_id,
            reason = reason.as_str(),
            clients = entry.len(),
            "sse clients force-disconnected"
        );
        entry.len()
    }

    fn disconnect_message(strategy_id: i64, reason: DisconnectReason) -> HubMessage {
        HubMessage {
            event_type: "force_disconnect".to_string(),
            data: json!({
                "reason": reason.as_str(),
                "message": reason.message(),
                "strategy_id": strategy_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        }
    }

    /// Operational statistics for the health endpoint.
    pub fn statistics(&self) -> serde_json::Value {
        let clients = self.clients.read();
        json!({
            "total_keys": clients.len(),
            "total_connections": clients.values().map(|v| v.len()).sum::<usize>(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("keys", &self.clients.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    async fn hub_with_strategy() -> (EventHub, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("alice", "tok", false).await.unwrap();
        let strategy = db
            .insert_strategy(user, "Momentum", "momo", "secret", MarketType::Spot)
            .await
            .unwrap();
        (EventHub::new(db), user, strategy)
    }

    fn order_event(user_id: i64, strategy_id: i64) -> OrderEvent {
        OrderEvent {
            event_type: "order_created".into(),
            order_id: "1".into(),
            symbol: "BTC/USDT".into(),
            strategy_id,
            user_id,
            side: "BUY".into(),
            order_type: "LIMIT".into(),
            quantity: "0.5".into(),
            price: Some("42000".into()),
            stop_price: None,
            status: "OPEN".into(),
            account: AccountInfo {
                name: "main".into(),
                exchange: "binance".into(),
            },
            timestamp: Utc::now().to_rfc3339(),
            suppress_toast: false,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_connection_then_events() {
        let (hub, user, strategy) = hub_with_strategy().await;
        let mut sub = hub.subscribe(user, strategy);

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.event_type, "connection");
        assert_eq!(first.data["status"], "connected");

        hub.emit_order_event(order_event(user, strategy)).await;
        let second = sub.receiver.recv().await.unwrap();
        assert_eq!(second.event_type, "order_update");
        assert_eq!(second.data["event_type"], "order_created");
    }

    #[tokio::test]
    async fn events_do_not_cross_strategy_boundaries() {
        let (hub, user, strategy) = hub_with_strategy().await;
        let mut other = hub.subscribe(user, strategy + 100);

        hub.emit_order_event(order_event(user, strategy)).await;

        // The other subscriber only ever saw its connection frame.
        let first = other.receiver.recv().await.unwrap();
        assert_eq!(first.event_type, "connection");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn inactive_strategy_blocks_publishing() {
        let (hub, user, strategy) = hub_with_strategy().await;
        hub.db.set_strategy_active(strategy, false).await.unwrap();

        let mut sub = hub.subscribe(user, strategy);
        let _ = sub.receiver.recv().await;

        hub.emit_order_event(order_event(user, strategy)).await;
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn nonpositive_strategy_id_is_rejected() {
        let (hub, user, _) = hub_with_strategy().await;
        // No panic, no delivery; just dropped.
        hub.emit_order_event(order_event(user, 0)).await;
        hub.emit_order_event(order_event(user, -3)).await;
    }

    #[tokio::test]
    async fn cleanup_injects_force_disconnect_and_empties_the_hub() {
        let (hub, user, strategy) = hub_with_strategy().await;
        let mut a = hub.subscribe(user, strategy);
        let mut b = hub.subscribe(user, strategy);
        assert_eq!(hub.strategy_subscriber_count(strategy), 2);

        let cleaned = hub.cleanup_strategy_clients(strategy);
        assert_eq!(cleaned, 2);
        assert_eq!(hub.strategy_subscriber_count(strategy), 0);

        for sub in [&mut a, &mut b] {
            let _connection = sub.receiver.recv().await.unwrap();
            let disconnect = sub.receiver.recv().await.unwrap();
            assert_eq!(disconnect.event_type, "force_disconnect");
            assert_eq!(disconnect.data["reason"], "strategy_deleted");
        }
    }

    #[tokio::test]
    async fn disconnect_client_names_the_reason() {
        let (hub, user, strategy) = hub_with_strategy().await;
        let mut sub = hub.subscribe(user, strategy);
        let _ = sub.receiver.recv().await;

        let dropped = hub.disconnect_client(user, strategy, DisconnectReason::PermissionRevoked);
        assert_eq!(dropped, 1);
        let message = sub.receiver.recv().await.unwrap();
        assert_eq!(message.data["reason"], "permission_revoked");
        assert_eq!(hub.subscriber_count(user, strategy), 0);
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped() {
        let (hub, user, strategy) = hub_with_strategy().await;
        let sub = hub.subscribe(user, strategy);
        // Do not drain: fill the queue past capacity.
        for _ in 0..(CLIENT_QUEUE_CAPACITY + 5) {
            hub.emit_order_event(order_event(user, strategy)).await;
        }
        assert_eq!(hub.subscriber_count(user, strategy), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn empty_batch_is_skipped() {
        let (hub, user, strategy) = hub_with_strategy().await;
        let mut sub = hub.subscribe(user, strategy);
        let _ = sub.receiver.recv().await;

        hub.emit_order_batch_event(OrderBatchEvent {
            summaries: vec![],
            strategy_id: strategy,
            user_id: user,
            timestamp: Utc::now().to_rfc3339(),
        })
        .await;
        assert!(sub.receiver.try_recv().is_err());

        hub.emit_order_batch_event(OrderBatchEvent {
            summaries: vec![OrderBatchSummary {
                order_type: "LIMIT".into(),
                created: 5,
                cancelled: 3,
            }],
            strategy_id: strategy,
            user_id: user,
            timestamp: Utc::now().to_rfc3339(),
        })
        .await;
        let message = sub.receiver.recv().await.unwrap();
        assert_eq!(message.event_type, "order_batch_update");
        assert_eq!(message.data["summaries"][0]["created"], 5);
    }
}
