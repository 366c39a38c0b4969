// =============================================================================
// Central Application State — dependency wiring for the gateway
// =============================================================================
//
// Every service is created exactly once at startup and passed by reference;
// nothing lives in module-level statics. AppState ties the pieces together
// and owns the cross-cutting operations (strategy removal, account
// deactivation) whose ordering spans multiple services.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::exchange::rate_limit::RateLimiterRegistry;
use crate::exchange::AdapterRegistry;
use crate::fills::FillMonitor;
use crate::orders::{CancelQueueWorker, OrderManager};
use crate::sse::{DisconnectReason, EventHub};
use crate::webhook::WebhookDispatcher;
use crate::ws::WsConnectionPool;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub hub: Arc<EventHub>,
    pub fills: Arc<FillMonitor>,
    pub order_manager: Arc<OrderManager>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub ws_pool: Arc<WsConnectionPool>,
    pub cancel_worker: Arc<CancelQueueWorker>,
    pub limiters: Arc<RateLimiterRegistry>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> Arc<Self> {
        let limiters = Arc::new(RateLimiterRegistry::new());
        let adapters = Arc::new(AdapterRegistry::new(db.clone(), limiters.clone()));

        let hub = Arc::new(EventHub::new(db.clone()));
        let fills = Arc::new(FillMonitor::new(db.clone(), hub.clone()));
        let order_manager = Arc::new(OrderManager::new(
            db.clone(),
            fills.clone(),
            hub.clone(),
            adapters.clone(),
        ));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            db.clone(),
            order_manager.clone(),
            Duration::from_secs(config.webhook_account_timeout_secs),
        ));
        let ws_pool = Arc::new(WsConnectionPool::new(
            db.clone(),
            fills.clone(),
            hub.clone(),
            adapters,
        ));
        let cancel_worker = Arc::new(CancelQueueWorker::new(db.clone(), order_manager.clone()));

        Arc::new(Self {
            config,
            db,
            hub,
            fills,
            order_manager,
            dispatcher,
            ws_pool,
            cancel_worker,
            limiters,
            start_time: std::time::Instant::now(),
        })
    }

    /// Remove a strategy. Subscribers are force-disconnected synchronously
    /// BEFORE the rows change, so no event for a dead strategy ever reaches a
    /// live client.
    pub async fn delete_strategy(&self, strategy_id: i64) -> Result<usize> {
        let disconnected = self.hub.cleanup_strategy_clients(strategy_id);
        self.db.remove_strategy(strategy_id).await?;
        info!(strategy_id, disconnected, "strategy removed");
        Ok(disconnected)
    }

    /// Deactivate an account: its strategy subscribers are dropped with the
    /// matching reason and its stream connections torn down.
    pub async fn deactivate_account(&self, account_id: i64) -> Result<()> {
        let targets = self.db.active_account_markets().await?;
        for (account, market_type) in targets {
            if account.id == account_id {
                self.ws_pool.disconnect_account(account_id, market_type);
                if let Ok(bindings) = self.db.active_bindings_for_account(account_id).await {
                    for (user_id, strategy_id) in bindings {
                        self.hub.disconnect_client(
                            user_id,
                            strategy_id,
                            DisconnectReason::AccountDeactivated,
                        );
                    }
                }
            }
        }
        self.db.set_account_active(account_id, false).await?;
        info!(account_id, "account deactivated");
        Ok(())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn strategy_deletion_force_disconnects_before_removal() {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("alice", "tok", false).await.unwrap();
        let account = db
            .insert_account(user, "main", "binance", "CRYPTO", "k", "s", false)
            .await
            .unwrap();
        let strategy = db
            .insert_strategy(user, "S1", "s1", "secret", MarketType::Spot)
            .await
            .unwrap();
        db.insert_strategy_account(strategy, account, dec!(1))
            .await
            .unwrap();

        let state = AppState::new(Config::default(), db.clone());

        let mut a = state.hub.subscribe(user, strategy);
        let mut b = state.hub.subscribe(user, strategy);

        let disconnected = state.delete_strategy(strategy).await.unwrap();
        assert_eq!(disconnected, 2);
        assert_eq!(state.hub.strategy_subscriber_count(strategy), 0);

        for sub in [&mut a, &mut b] {
            let _connection = sub.receiver.recv().await.unwrap();
            let disconnect = sub.receiver.recv().await.unwrap();
            assert_eq!(disconnect.event_type, "force_disconnect");
            assert_eq!(disconnect.data["reason"], "strategy_deleted");
        }

        // The strategy and its bindings are inactive afterwards.
        let row = db.strategy_by_id(strategy).await.unwrap().unwrap();
        assert!(!row.is_active);
        assert!(db.active_bindings(strategy).await.unwrap().is_empty());
    }
}
