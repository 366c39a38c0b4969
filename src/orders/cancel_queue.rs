// =============================================================================
// Cancel Queue Worker — deferred cancels for orders without an exchange id
// =============================================================================
//
// A cancel aimed at a PENDING order cannot reach the exchange yet. Each pass
// re-reads the order's current state: advanced to OPEN means a real cancel,
// resolved (filled/cancelled/vanished) means done, still PENDING means retry
// with exponential backoff until max_retries.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::db::{CancelQueueRow, CancelQueueStatus, Database, OpenOrderRow};
use crate::error::ExchangeError;
use crate::types::OrderStatus;

use super::manager::{CancelOutcome, OrderManager};

pub struct CancelQueueWorker {
    db: Database,
    manager: Arc<OrderManager>,
}

/// What one pass over the due items did.
#[derive(Debug, Default, Clone, Copy)]
pub struct CancelPassReport {
    pub processed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

impl CancelQueueWorker {
    pub fn new(db: Database, manager: Arc<OrderManager>) -> Self {
        Self { db, manager }
    }

    /// Process every due item once.
    pub async fn run_pass(&self) -> Result<CancelPassReport> {
        let due = self.db.due_cancel_items(Utc::now()).await?;
        let mut report = CancelPassReport {
            processed: due.len(),
            ..Default::default()
        };

        for item in due {
            match self.process_item(&item).await {
                Ok(CancelQueueStatus::Success) => report.succeeded += 1,
                Ok(CancelQueueStatus::Failed) => report.failed += 1,
                Ok(CancelQueueStatus::Pending) => report.retried += 1,
                Err(e) => {
                    warn!(item_id = item.id, error = %e, "cancel queue item errored");
                    self.schedule_retry(&item, Some(&e.to_string())).await?;
                    report.retried += 1;
                }
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                retried = report.retried,
                failed = report.failed,
                "cancel queue pass completed"
            );
        }
        Ok(report)
    }

    async fn process_item(&self, item: &CancelQueueRow) -> Result<CancelQueueStatus> {
        // Re-read the order; the reference is a client id (stable across the
        // exchange-id patch) with a placeholder fallback.
        let row = match self.find_order(&item.order_ref).await? {
            Some(row) => row,
            None => {
                // The order resolved on its own (filled and deleted, or
                // cancelled elsewhere). Nothing left to cancel.
                self.db
                    .update_cancel_item(item.id, CancelQueueStatus::Success, item.retry_count, Utc::now(), None)
                    .await?;
                debug!(item_id = item.id, order_ref = %item.order_ref, "order already resolved");
                return Ok(CancelQueueStatus::Success);
            }
        };

        if row.status != OrderStatus::Pending {
            // The exchange id arrived: perform the real cancel now.
            let context = self
                .db
                .binding_context(row.strategy_account_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("binding context missing"))?;
            match self
                .manager
                .cancel_order_for_user(context.user_id, &row.exchange_order_id)
                .await
            {
                Ok(CancelOutcome::Cancelled { .. }) => {
                    self.db
                        .update_cancel_item(
                            item.id,
                            CancelQueueStatus::Success,
                            item.retry_count,
                            Utc::now(),
                            None,
                        )
                        .await?;
                    return Ok(CancelQueueStatus::Success);
                }
                Ok(CancelOutcome::Queued { .. }) => {
                    // Raced back to PENDING is not possible, but be safe.
                    self.schedule_retry(item, None).await?;
                    return Ok(CancelQueueStatus::Pending);
                }
                Err(ExchangeError::Rejected(msg)) => {
                    // Filled before the cancel landed; the intent is moot.
                    self.db
                        .update_cancel_item(
                            item.id,
                            CancelQueueStatus::Success,
                            item.retry_count,
                            Utc::now(),
                            Some(&msg),
                        )
                        .await?;
                    return Ok(CancelQueueStatus::Success);
                }
                Err(e) => {
                    self.schedule_retry(item, Some(&e.to_string())).await?;
                    return Ok(if item.retry_count + 1 >= item.max_retries {
                        CancelQueueStatus::Failed
                    } else {
                        CancelQueueStatus::Pending
                    });
                }
            }
        }

        // Still PENDING: back off and try again later.
        self.schedule_retry(item, Some("order still pending")).await?;
        Ok(if item.retry_count + 1 >= item.max_retries {
            CancelQueueStatus::Failed
        } else {
            CancelQueueStatus::Pending
        })
    }

    async fn find_order(&self, order_ref: &str) -> Result<Option<OpenOrderRow>> {
        if let Some(row) = self.db.open_order_by_client_id(order_ref).await? {
            return Ok(Some(row));
        }
        self.db.open_order_by_exchange_id(order_ref).await
    }

    /// `next_retry_at = now + 2^retry_count seconds`; FAILED at max_retries.
    async fn schedule_retry(&self, item: &CancelQueueRow, error: Option<&str>) -> Result<()> {
        let retry_count = item.retry_count + 1;
        if retry_count >= item.max_retries {
            self.db
                .update_cancel_item(
                    item.id,
                    CancelQueueStatus::Failed,
                    retry_count,
                    Utc::now(),
                    error.or(Some("max retries exceeded")),
                )
                .await?;
            warn!(item_id = item.id, order_ref = %item.order_ref, "cancel queue item failed");
        } else {
            let delay = ChronoDuration::seconds(1 << retry_count.min(30));
            self.db
                .update_cancel_item(
                    item.id,
                    CancelQueueStatus::Pending,
                    retry_count,
                    Utc::now() + delay,
                    error,
                )
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CancelQueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelQueueWorker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OpenOrderFilter;
    use crate::exchange::testing::{MockExchange, MockSource};
    use crate::fills::FillMonitor;
    use crate::orders::manager::OrderSpec;
    use crate::sse::EventHub;
    use crate::types::{MarketType, OrderSide, OrderType};
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Database,
        mock: Arc<MockExchange>,
        manager: Arc<OrderManager>,
        worker: CancelQueueWorker,
        user_id: i64,
        strategy: crate::db::StrategyRow,
        binding: crate::db::BindingRow,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let user_id = db.insert_user("alice", "tok", false).await.unwrap();
        let account_id = db
            .insert_account(user_id, "main", "binance", "CRYPTO", "k", "s", false)
            .await
            .unwrap();
        let strategy_id = db
            .insert_strategy(user_id, "Momentum", "momo", "secret", MarketType::Spot)
            .await
            .unwrap();
        db.insert_strategy_account(strategy_id, account_id, dec!(1))
            .await
            .unwrap();

        let strategy = db.strategy_by_id(strategy_id).await.unwrap().unwrap();
        let binding = db
            .active_bindings(strategy_id)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        let hub = Arc::new(EventHub::new(db.clone()));
        let fills = Arc::new(FillMonitor::new(db.clone(), hub.clone()));
        let mock = Arc::new(MockExchange::new(MarketType::Spot));
        let manager = Arc::new(OrderManager::new(
            db.clone(),
            fills,
            hub,
            Arc::new(MockSource { mock: mock.clone() }),
        ));
        let worker = CancelQueueWorker::new(db.clone(), manager.clone());

        Fixture {
            db,
            mock,
            manager,
            worker,
            user_id,
            strategy,
            binding,
        }
    }

    fn spec() -> OrderSpec {
        OrderSpec {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(0.5),
            price: Some(dec!(42000)),
            stop_price: None,
            auto_adjust: false,
        }
    }

    /// Place an order whose REST call times out, leaving a PENDING row, then
    /// queue a cancel for it.
    async fn pending_order_with_queued_cancel(f: &Fixture) -> (String, i64) {
        f.mock
            .script_create(Err(crate::error::ExchangeError::Network("timeout".into())));
        let _ = f.manager.create_order(&f.strategy, &f.binding, &spec()).await;
        let row = f
            .db
            .open_orders_for_user(f.user_id, &OpenOrderFilter::default())
            .await
            .unwrap()
            .remove(0);
        let outcome = f
            .manager
            .cancel_order_for_user(f.user_id, &row.exchange_order_id)
            .await
            .unwrap();
        let CancelOutcome::Queued { queue_id } = outcome else {
            panic!("expected queued cancel");
        };
        (row.client_order_id.unwrap(), queue_id)
    }

    #[tokio::test]
    async fn still_pending_order_backs_off_exponentially() {
        let f = fixture().await;
        let (_client_ref, queue_id) = pending_order_with_queued_cancel(&f).await;

        let report = f.worker.run_pass().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.retried, 1);

        let item = f.db.cancel_item_by_id(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, CancelQueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        // next_retry_at = now + 2^1 s, so nothing is due immediately.
        assert!(f.db.due_cancel_items(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn advanced_order_gets_a_real_cancel() {
        let f = fixture().await;
        let (client_ref, queue_id) = pending_order_with_queued_cancel(&f).await;

        // Reconciliation patched the real id in the meantime.
        let row = f.db.open_order_by_client_id(&client_ref).await.unwrap().unwrap();
        f.db.patch_exchange_order_id(row.id, "real-9", OrderStatus::Open, dec!(0))
            .await
            .unwrap();
        f.mock.open_orders.lock().push(MockExchange::order(
            "real-9",
            &crate::types::OrderRequest {
                symbol: "BTC/USDT".into(),
                side: OrderSide::Buy,
                order_type: OrderType::Limit,
                quantity: dec!(0.5),
                price: Some(dec!(42000)),
                stop_price: None,
                client_order_id: Some(client_ref),
            },
            OrderStatus::Open,
            dec!(0),
        ));

        let report = f.worker.run_pass().await.unwrap();
        assert_eq!(report.succeeded, 1);

        let item = f.db.cancel_item_by_id(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, CancelQueueStatus::Success);
        assert!(f.db.open_order_by_exchange_id("real-9").await.unwrap().is_none());
        assert_eq!(f.mock.cancelled.lock().as_slice(), ["real-9"]);
    }

    #[tokio::test]
    async fn resolved_order_marks_the_item_success() {
        let f = fixture().await;
        let (client_ref, queue_id) = pending_order_with_queued_cancel(&f).await;

        // The order vanished (filled elsewhere and cleaned up).
        let row = f.db.open_order_by_client_id(&client_ref).await.unwrap().unwrap();
        f.db.delete_open_order(&row.exchange_order_id).await.unwrap();

        let report = f.worker.run_pass().await.unwrap();
        assert_eq!(report.succeeded, 1);
        let item = f.db.cancel_item_by_id(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, CancelQueueStatus::Success);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_item_failed() {
        let f = fixture().await;
        let (_client_ref, queue_id) = pending_order_with_queued_cancel(&f).await;

        // Drive the item to its retry ceiling.
        for _ in 0..super::super::manager::CANCEL_MAX_RETRIES {
            let item = f.db.cancel_item_by_id(queue_id).await.unwrap().unwrap();
            if item.status != CancelQueueStatus::Pending {
                break;
            }
            // Make it due immediately.
            f.db.update_cancel_item(
                queue_id,
                CancelQueueStatus::Pending,
                item.retry_count,
                Utc::now(),
                None,
            )
            .await
            .unwrap();
            f.worker.run_pass().await.unwrap();
        }

        let item = f.db.cancel_item_by_id(queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, CancelQueueStatus::Failed);
        assert!(item.error_message.is_some());
    }
}
