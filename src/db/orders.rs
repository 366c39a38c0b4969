// =============================================================================
// Order persistence — open orders, failed orders, cancel queue
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

use crate::types::{MarketType, OrderSide, OrderStatus, OrderType};

use super::models::*;
use super::{dec_to_sql, opt_dec_to_sql, Database};

/// Prefix of the placeholder exchange id a row carries until the create-order
/// call returns the real one.
pub const PENDING_ID_PREFIX: &str = "PENDING-";

/// Optional filters for listing/bulk-cancelling a user's open orders.
#[derive(Debug, Clone, Default)]
pub struct OpenOrderFilter {
    pub strategy_id: Option<i64>,
    pub account_id: Option<i64>,
    pub symbol: Option<String>,
    pub side: Option<OrderSide>,
}

impl OpenOrderFilter {
    /// Human-readable filter description echoed in bulk-cancel responses.
    pub fn conditions(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(id) = self.strategy_id {
            out.push(format!("strategy_id={id}"));
        }
        if let Some(id) = self.account_id {
            out.push(format!("account_id={id}"));
        }
        if let Some(symbol) = &self.symbol {
            out.push(format!("symbol={symbol}"));
        }
        if let Some(side) = self.side {
            out.push(format!("side={side}"));
        }
        out
    }
}

impl Database {
    // -------------------------------------------------------------------------
    // Open orders
    // -------------------------------------------------------------------------

    /// Insert the PENDING row. Committed on return — a WebSocket fill arriving
    /// before the REST response can already find the order by client id.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_pending_order(
        &self,
        strategy_account_id: i64,
        placeholder_id: &str,
        client_order_id: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        quantity: Decimal,
        market_type: MarketType,
    ) -> Result<OpenOrderRow> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO open_orders (strategy_account_id, exchange_order_id,
                client_order_id, symbol, side, order_type, price, stop_price,
                quantity, filled_quantity, status, market_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, '0', ?10, ?11, ?12, ?12)",
            params![
                strategy_account_id,
                placeholder_id,
                client_order_id,
                symbol,
                side.as_str(),
                order_type.as_str(),
                opt_dec_to_sql(price),
                opt_dec_to_sql(stop_price),
                dec_to_sql(quantity),
                OrderStatus::Pending.as_str(),
                market_type.as_str(),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT * FROM open_orders WHERE id = ?1",
            params![id],
            |row| OpenOrderRow::from_row(row),
        )
        .context("re-read pending order")
    }

    /// Patch the placeholder with the real exchange id once the REST call
    /// returns. A no-op when the row is already gone (the WS path saw the
    /// terminal state first) — the patch must never resurrect a closed order.
    pub async fn patch_exchange_order_id(
        &self,
        local_id: i64,
        exchange_order_id: &str,
        status: OrderStatus,
        filled_quantity: Decimal,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let updated = conn.execute(
            "UPDATE open_orders
             SET exchange_order_id = ?2, status = ?3, filled_quantity = ?4,
                 updated_at = ?5
             WHERE id = ?1",
            params![
                local_id,
                exchange_order_id,
                status.as_str(),
                dec_to_sql(filled_quantity),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(updated > 0)
    }

    pub async fn open_order_by_exchange_id(
        &self,
        exchange_order_id: &str,
    ) -> Result<Option<OpenOrderRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM open_orders WHERE exchange_order_id = ?1",
            params![exchange_order_id],
            |row| OpenOrderRow::from_row(row),
        )
        .optional()
        .context("open_order_by_exchange_id")
    }

    pub async fn open_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OpenOrderRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM open_orders WHERE client_order_id = ?1",
            params![client_order_id],
            |row| OpenOrderRow::from_row(row),
        )
        .optional()
        .context("open_order_by_client_id")
    }

    /// Reconcile one row against the latest exchange state: terminal statuses
    /// delete, open statuses update in place.
    pub async fn reconcile_order_status(
        &self,
        exchange_order_id: &str,
        status: OrderStatus,
        filled_quantity: Decimal,
    ) -> Result<()> {
        let conn = self.lock().await;
        if status.is_closed() {
            conn.execute(
                "DELETE FROM open_orders WHERE exchange_order_id = ?1",
                params![exchange_order_id],
            )?;
        } else {
            conn.execute(
                "UPDATE open_orders
                 SET status = ?2, filled_quantity = ?3, updated_at = ?4
                 WHERE exchange_order_id = ?1",
                params![
                    exchange_order_id,
                    status.as_str(),
                    dec_to_sql(filled_quantity),
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    }

    pub async fn delete_open_order(&self, exchange_order_id: &str) -> Result<bool> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM open_orders WHERE exchange_order_id = ?1",
            params![exchange_order_id],
        )?;
        Ok(deleted > 0)
    }

    /// Locally-open orders of one (account, market) pair — the reconciler's
    /// working set.
    pub async fn open_orders_for_account(
        &self,
        account_id: i64,
        market_type: MarketType,
    ) -> Result<Vec<OpenOrderRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT o.* FROM open_orders o
             JOIN strategy_accounts sa ON sa.id = o.strategy_account_id
             WHERE sa.account_id = ?1 AND o.market_type = ?2
             ORDER BY o.id",
        )?;
        let rows = stmt
            .query_map(params![account_id, market_type.as_str()], |row| {
                OpenOrderRow::from_row(row)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// A user's open orders across strategies, newest first, with optional
    /// filters. Authorization is the join itself.
    pub async fn open_orders_for_user(
        &self,
        user_id: i64,
        filter: &OpenOrderFilter,
    ) -> Result<Vec<OpenOrderRow>> {
        let conn = self.lock().await;
        let mut sql = String::from(
            "SELECT o.* FROM open_orders o
             JOIN strategy_accounts sa ON sa.id = o.strategy_account_id
             JOIN strategies s ON s.id = sa.strategy_id
             JOIN accounts a ON a.id = sa.account_id
             WHERE s.user_id = ?1 AND a.is_active = 1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id)];

        if let Some(strategy_id) = filter.strategy_id {
            sql.push_str(&format!(" AND s.id = ?{}", args.len() + 1));
            args.push(Box::new(strategy_id));
        }
        if let Some(account_id) = filter.account_id {
            sql.push_str(&format!(" AND a.id = ?{}", args.len() + 1));
            args.push(Box::new(account_id));
        }
        if let Some(symbol) = &filter.symbol {
            sql.push_str(&format!(" AND o.symbol = ?{}", args.len() + 1));
            args.push(Box::new(symbol.clone()));
        }
        if let Some(side) = filter.side {
            sql.push_str(&format!(" AND o.side = ?{}", args.len() + 1));
            args.push(Box::new(side.as_str().to_string()));
        }
        sql.push_str(" ORDER BY o.created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| OpenOrderRow::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Failed orders
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_failed_order(
        &self,
        strategy_account_id: i64,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        market_type: MarketType,
        reason: &str,
        exchange_error: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO failed_orders (strategy_account_id, symbol, side, order_type,
                quantity, price, stop_price, market_type, reason, exchange_error,
                created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                strategy_account_id,
                symbol,
                side.as_str(),
                order_type.as_str(),
                dec_to_sql(quantity),
                opt_dec_to_sql(price),
                opt_dec_to_sql(stop_price),
                market_type.as_str(),
                reason,
                exchange_error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// A failed order visible to `user_id`, or None. Authorization walks
    /// FailedOrder → StrategyAccount → Strategy → User.
    pub async fn failed_order_for_user(
        &self,
        user_id: i64,
        failed_order_id: i64,
    ) -> Result<Option<FailedOrderRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT f.* FROM failed_orders f
             JOIN strategy_accounts sa ON sa.id = f.strategy_account_id
             JOIN strategies s ON s.id = sa.strategy_id
             WHERE f.id = ?1 AND s.user_id = ?2",
            params![failed_order_id, user_id],
            |row| FailedOrderRow::from_row(row),
        )
        .optional()
        .context("failed_order_for_user")
    }

    pub async fn failed_orders_for_user(
        &self,
        user_id: i64,
        strategy_account_id: Option<i64>,
        symbol: Option<&str>,
    ) -> Result<Vec<FailedOrderRow>> {
        let conn = self.lock().await;
        let mut sql = String::from(
            "SELECT f.* FROM failed_orders f
             JOIN strategy_accounts sa ON sa.id = f.strategy_account_id
             JOIN strategies s ON s.id = sa.strategy_id
             WHERE s.user_id = ?1 AND f.status != 'removed'",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id)];
        if let Some(sa_id) = strategy_account_id {
            sql.push_str(&format!(" AND f.strategy_account_id = ?{}", args.len() + 1));
            args.push(Box::new(sa_id));
        }
        if let Some(symbol) = symbol {
            sql.push_str(&format!(" AND f.symbol = ?{}", args.len() + 1));
            args.push(Box::new(symbol.to_string()));
        }
        sql.push_str(" ORDER BY f.created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| FailedOrderRow::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn update_failed_order(
        &self,
        failed_order_id: i64,
        status: FailedOrderStatus,
        retry_count: i64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE failed_orders SET status = ?2, retry_count = ?3 WHERE id = ?1",
            params![failed_order_id, status.as_str(), retry_count],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cancel queue
    // -------------------------------------------------------------------------

    /// Queue a deferred cancel for an order that has no exchange id yet.
    pub async fn enqueue_cancel(&self, order_ref: &str, max_retries: i64) -> Result<CancelQueueRow> {
        let now = Utc::now();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO cancel_queue (order_ref, status, max_retries, next_retry_at,
                created_at)
             VALUES (?1, 'PENDING', ?2, ?3, ?4)",
            params![order_ref, max_retries, now.to_rfc3339(), now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT * FROM cancel_queue WHERE id = ?1",
            params![id],
            |row| CancelQueueRow::from_row(row),
        )
        .context("re-read cancel queue item")
    }

    /// PENDING items whose retry time has come.
    pub async fn due_cancel_items(&self, now: DateTime<Utc>) -> Result<Vec<CancelQueueRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM cancel_queue
             WHERE status = 'PENDING' AND next_retry_at <= ?1
             ORDER BY next_retry_at",
        )?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], |row| CancelQueueRow::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn update_cancel_item(
        &self,
        id: i64,
        status: CancelQueueStatus,
        retry_count: i64,
        next_retry_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE cancel_queue
             SET status = ?2, retry_count = ?3, next_retry_at = ?4, error_message = ?5
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                retry_count,
                next_retry_at.to_rfc3339(),
                error_message,
            ],
        )?;
        Ok(())
    }

    pub async fn cancel_item_by_id(&self, id: i64) -> Result<Option<CancelQueueRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM cancel_queue WHERE id = ?1",
            params![id],
            |row| CancelQueueRow::from_row(row),
        )
        .optional()
        .context("cancel_item_by_id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn seeded() -> (Database, i64) {
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
        (db, sa)
    }

    async fn insert_order(db: &Database, sa: i64, placeholder: &str, client: &str) -> OpenOrderRow {
        db.insert_pending_order(
            sa,
            placeholder,
            client,
            "BTC/USDT",
            OrderSide::Buy,
            OrderType::Limit,
            Some(dec!(42000)),
            None,
            dec!(0.5),
            MarketType::Spot,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn pending_row_is_findable_by_client_id_before_patch() {
        let (db, sa) = seeded().await;
        let row = insert_order(&db, sa, "PENDING-abc", "cli-1").await;
        assert!(row.has_placeholder_id());
        assert_eq!(row.status, OrderStatus::Pending);

        let found = db.open_order_by_client_id("cli-1").await.unwrap().unwrap();
        assert_eq!(found.id, row.id);

        let patched = db
            .patch_exchange_order_id(row.id, "12345", OrderStatus::Open, dec!(0))
            .await
            .unwrap();
        assert!(patched);
        let after = db.open_order_by_exchange_id("12345").await.unwrap().unwrap();
        assert!(!after.has_placeholder_id());
        assert_eq!(after.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn patch_is_noop_when_row_already_deleted() {
        let (db, sa) = seeded().await;
        let row = insert_order(&db, sa, "PENDING-gone", "cli-gone").await;
        db.delete_open_order("PENDING-gone").await.unwrap();
        let patched = db
            .patch_exchange_order_id(row.id, "999", OrderStatus::Open, dec!(0))
            .await
            .unwrap();
        assert!(!patched);
    }

    #[tokio::test]
    async fn terminal_reconcile_deletes_the_row() {
        let (db, sa) = seeded().await;
        insert_order(&db, sa, "PENDING-x", "cli-x").await;
        db.reconcile_order_status("PENDING-x", OrderStatus::Filled, dec!(0.5))
            .await
            .unwrap();
        assert!(db.open_order_by_exchange_id("PENDING-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_listing_applies_filters() {
        let (db, sa) = seeded().await;
        insert_order(&db, sa, "PENDING-1", "cli-a").await;
        insert_order(&db, sa, "PENDING-2", "cli-b").await;

        let all = db
            .open_orders_for_user(1, &OpenOrderFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let sell_only = db
            .open_orders_for_user(
                1,
                &OpenOrderFilter {
                    side: Some(OrderSide::Sell),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(sell_only.is_empty());
    }

    #[tokio::test]
    async fn cancel_queue_due_items_respect_retry_time() {
        let (db, _) = seeded().await;
        let item = db.enqueue_cancel("PENDING-q", 5).await.unwrap();
        assert_eq!(item.status, CancelQueueStatus::Pending);

        let due = db.due_cancel_items(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        // Push the retry into the future; nothing is due any more.
        db.update_cancel_item(
            item.id,
            CancelQueueStatus::Pending,
            1,
            Utc::now() + chrono::Duration::seconds(60),
            Some("still pending"),
        )
        .await
        .unwrap();
        assert!(db.due_cancel_items(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_order_authorization_walks_ownership() {
        let (db, sa) = seeded().await;
        let id = db
            .insert_failed_order(
                sa,
                "BTC/USDT",
                OrderSide::Buy,
                OrderType::StopLimit,
                dec!(1),
                Some(dec!(100)),
                Some(dec!(99)),
                MarketType::Spot,
                "rejected",
                Some("Order would immediately trigger"),
            )
            .await
            .unwrap();

        assert!(db.failed_order_for_user(1, id).await.unwrap().is_some());
        let stranger = db.insert_user("mallory", "tok-m", false).await.unwrap();
        assert!(db.failed_order_for_user(stranger, id).await.unwrap().is_none());
    }
}
