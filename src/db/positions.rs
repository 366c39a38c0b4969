// =============================================================================
// Positions, capital, and the transactional fill application
// =============================================================================
//
// `apply_fill` is the single write path for executions: one SQLite
// transaction covers dedup, the execution insert, the position update, the
// capital update, and the open-order progress — a crash leaves either all or
// none of it.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

use crate::types::{FillEvent, OrderSide, OrderStatus};

use super::models::*;
use super::{dec_from_sql, dec_to_sql, Database};

/// What one fill did to the books.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    /// The event had already been applied (same exchange_trade_id).
    pub duplicate: bool,
    pub execution_id: Option<i64>,
    /// PnL realized by this fill (zero when it only increased exposure).
    pub realized_pnl: Decimal,
    pub previous_quantity: Decimal,
    pub position: StrategyPositionRow,
    /// The parent open order reached full fill and its row was deleted.
    pub order_deleted: bool,
    /// Order status after this fill, if the order row was found.
    pub order_status: Option<OrderStatus>,
}

/// Average-price accounting for one fill against one position.
///
/// Returns `(new_quantity, new_entry_price, realized_pnl)`:
/// - same-sign fills raise exposure and re-weight the entry price;
/// - opposite-sign fills realize `(price − entry) × closed × sign(old)` and
///   leave the entry untouched;
/// - crossing zero closes the old leg entirely and opens the remainder at
///   the fill price.
pub fn apply_fill_to_position(
    quantity: Decimal,
    entry_price: Decimal,
    side: OrderSide,
    fill_quantity: Decimal,
    fill_price: Decimal,
) -> (Decimal, Decimal, Decimal) {
    let signed_fill = side.sign() * fill_quantity;

    if quantity.is_zero() || quantity.is_sign_positive() == signed_fill.is_sign_positive() {
        // Increasing exposure (or opening fresh).
        let abs_old = quantity.abs();
        let new_quantity = quantity + signed_fill;
        let new_entry = if new_quantity.is_zero() {
            Decimal::ZERO
        } else {
            (abs_old * entry_price + fill_quantity * fill_price) / (abs_old + fill_quantity)
        };
        return (new_quantity, new_entry, Decimal::ZERO);
    }

    // Reducing exposure.
    let position_sign = if quantity.is_sign_positive() {
        Decimal::ONE
    } else {
        -Decimal::ONE
    };
    let abs_old = quantity.abs();
    let closed = abs_old.min(fill_quantity);
    let realized = (fill_price - entry_price) * closed * position_sign;

    let remainder = fill_quantity - closed;
    if remainder.is_zero() {
        let new_quantity = quantity + signed_fill;
        let new_entry = if new_quantity.is_zero() {
            Decimal::ZERO
        } else {
            entry_price
        };
        (new_quantity, new_entry, realized)
    } else {
        // Crossed zero: the remainder is a fresh leg at the fill price.
        let new_quantity = side.sign() * remainder;
        (new_quantity, fill_price, realized)
    }
}

impl Database {
    /// Apply one canonical fill event atomically. Idempotent by
    /// `exchange_trade_id` — replaying an event is a no-op.
    pub async fn apply_fill(&self, fill: &FillEvent) -> Result<FillOutcome> {
        let mut conn = self.lock().await;
        let tx = conn.transaction().context("begin fill transaction")?;

        // 1. Dedup on the exchange trade id.
        if let Some(trade_id) = &fill.exchange_trade_id {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM trade_executions WHERE exchange_trade_id = ?1",
                    params![trade_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                let position = read_or_default_position(
                    &tx,
                    fill.strategy_account_id,
                    &fill.symbol,
                )?;
                tx.commit()?;
                return Ok(FillOutcome {
                    duplicate: true,
                    execution_id: existing,
                    realized_pnl: Decimal::ZERO,
                    previous_quantity: position.quantity,
                    position,
                    order_deleted: false,
                    order_status: None,
                });
            }
        }

        // 2. Load (or create flat) the position row.
        let before = read_or_default_position(&tx, fill.strategy_account_id, &fill.symbol)?;
        let (new_quantity, new_entry, realized) = apply_fill_to_position(
            before.quantity,
            before.entry_price,
            fill.side,
            fill.quantity,
            fill.price,
        );

        // 3. Record the execution with its realized share.
        let realized_sql = if realized.is_zero() {
            None
        } else {
            Some(dec_to_sql(realized))
        };
        tx.execute(
            "INSERT INTO trade_executions (strategy_account_id, exchange_order_id,
                exchange_trade_id, symbol, side, execution_price, execution_quantity,
                commission, is_maker, execution_time, market_type, realized_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                fill.strategy_account_id,
                fill.exchange_order_id,
                fill.exchange_trade_id,
                fill.symbol,
                fill.side.as_str(),
                dec_to_sql(fill.price),
                dec_to_sql(fill.quantity),
                dec_to_sql(fill.commission),
                fill.is_maker,
                fill.execution_time.to_rfc3339(),
                fill.market_type.as_str(),
                realized_sql,
            ],
        )?;
        let execution_id = tx.last_insert_rowid();

        // 4. Position update. The accumulated realized PnL is computed in
        // Decimal here, never in SQLite arithmetic.
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO strategy_positions (strategy_account_id, symbol, quantity,
                entry_price, realized_pnl, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(strategy_account_id, symbol) DO UPDATE SET
                quantity = excluded.quantity,
                entry_price = excluded.entry_price,
                realized_pnl = excluded.realized_pnl,
                updated_at = excluded.updated_at",
            params![
                fill.strategy_account_id,
                fill.symbol,
                dec_to_sql(new_quantity),
                dec_to_sql(new_entry),
                dec_to_sql(before.realized_pnl + realized),
                now,
            ],
        )?;

        // 5. Capital update on closing fills.
        if !realized.is_zero() {
            let capital: Option<String> = tx
                .query_row(
                    "SELECT realized_pnl FROM strategy_capitals
                     WHERE strategy_account_id = ?1",
                    params![fill.strategy_account_id],
                    |row| row.get(0),
                )
                .optional()?;
            let updated = capital
                .map(|raw| dec_from_sql(&raw))
                .transpose()?
                .unwrap_or(Decimal::ZERO)
                + realized;
            tx.execute(
                "INSERT INTO strategy_capitals (strategy_account_id, allocated_capital,
                    realized_pnl, updated_at)
                 VALUES (?1, '0', ?2, ?3)
                 ON CONFLICT(strategy_account_id) DO UPDATE SET
                    realized_pnl = excluded.realized_pnl,
                    updated_at = excluded.updated_at",
                params![fill.strategy_account_id, dec_to_sql(updated), now],
            )?;
        }

        // 6. Progress the parent open order; delete at full fill.
        let mut order_deleted = false;
        let mut order_status = None;
        let order: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT id, quantity, filled_quantity FROM open_orders
                 WHERE exchange_order_id = ?1",
                params![fill.exchange_order_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((order_id, quantity_raw, filled_raw)) = order {
            let quantity = dec_from_sql(&quantity_raw)?;
            let filled = dec_from_sql(&filled_raw)? + fill.quantity;
            if filled >= quantity {
                tx.execute("DELETE FROM open_orders WHERE id = ?1", params![order_id])?;
                order_deleted = true;
                order_status = Some(OrderStatus::Filled);
            } else {
                tx.execute(
                    "UPDATE open_orders
                     SET filled_quantity = ?2, status = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![
                        order_id,
                        dec_to_sql(filled),
                        OrderStatus::PartiallyFilled.as_str(),
                        now,
                    ],
                )?;
                order_status = Some(OrderStatus::PartiallyFilled);
            }
        }

        let position = read_or_default_position(&tx, fill.strategy_account_id, &fill.symbol)?;
        tx.commit().context("commit fill transaction")?;

        Ok(FillOutcome {
            duplicate: false,
            execution_id: Some(execution_id),
            realized_pnl: realized,
            previous_quantity: before.quantity,
            position,
            order_deleted,
            order_status,
        })
    }

    pub async fn position(
        &self,
        strategy_account_id: i64,
        symbol: &str,
    ) -> Result<Option<StrategyPositionRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM strategy_positions
             WHERE strategy_account_id = ?1 AND symbol = ?2",
            params![strategy_account_id, symbol],
            |row| StrategyPositionRow::from_row(row),
        )
        .optional()
        .context("position")
    }

    pub async fn strategy_capital(
        &self,
        strategy_account_id: i64,
    ) -> Result<Option<StrategyCapitalRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM strategy_capitals WHERE strategy_account_id = ?1",
            params![strategy_account_id],
            |row| StrategyCapitalRow::from_row(row),
        )
        .optional()
        .context("strategy_capital")
    }

    pub async fn execution_by_trade_id(
        &self,
        exchange_trade_id: &str,
    ) -> Result<Option<TradeExecutionRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM trade_executions WHERE exchange_trade_id = ?1",
            params![exchange_trade_id],
            |row| TradeExecutionRow::from_row(row),
        )
        .optional()
        .context("execution_by_trade_id")
    }

    pub async fn executions_for_order(
        &self,
        exchange_order_id: &str,
    ) -> Result<Vec<TradeExecutionRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM trade_executions WHERE exchange_order_id = ?1
             ORDER BY execution_time",
        )?;
        let rows = stmt
            .query_map(params![exchange_order_id], |row| {
                TradeExecutionRow::from_row(row)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn read_or_default_position(
    conn: &rusqlite::Connection,
    strategy_account_id: i64,
    symbol: &str,
) -> Result<StrategyPositionRow> {
    let existing = conn
        .query_row(
            "SELECT * FROM strategy_positions
             WHERE strategy_account_id = ?1 AND symbol = ?2",
            params![strategy_account_id, symbol],
            |row| StrategyPositionRow::from_row(row),
        )
        .optional()?;
    Ok(existing.unwrap_or(StrategyPositionRow {
        id: 0,
        strategy_account_id,
        symbol: symbol.to_string(),
        quantity: Decimal::ZERO,
        entry_price: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        updated_at: Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;
    use rust_decimal_macros::dec;

    #[test]
    fn increasing_fills_reweight_entry() {
        let (qty, entry, realized) = apply_fill_to_position(
            dec!(1),
            dec!(100),
            OrderSide::Buy,
            dec!(1),
            dec!(110),
        );
        assert_eq!(qty, dec!(2));
        assert_eq!(entry, dec!(105));
        assert_eq!(realized, Decimal::ZERO);
    }

    #[test]
    fn reducing_fill_realizes_without_moving_entry() {
        let (qty, entry, realized) = apply_fill_to_position(
            dec!(2),
            dec!(100),
            OrderSide::Sell,
            dec!(1),
            dec!(110),
        );
        assert_eq!(qty, dec!(1));
        assert_eq!(entry, dec!(100));
        assert_eq!(realized, dec!(10));
    }

    #[test]
    fn short_position_realizes_with_inverted_sign() {
        let (qty, entry, realized) = apply_fill_to_position(
            dec!(-2),
            dec!(100),
            OrderSide::Buy,
            dec!(1),
            dec!(90),
        );
        assert_eq!(qty, dec!(-1));
        assert_eq!(entry, dec!(100));
        assert_eq!(realized, dec!(10));
    }

    #[test]
    fn crossing_zero_opens_fresh_leg_at_fill_price() {
        let (qty, entry, realized) = apply_fill_to_position(
            dec!(1),
            dec!(100),
            OrderSide::Sell,
            dec!(1.5),
            dec!(110),
        );
        assert_eq!(qty, dec!(-0.5));
        assert_eq!(entry, dec!(110));
        assert_eq!(realized, dec!(10));
    }

    #[test]
    fn closing_to_flat_zeroes_the_entry() {
        let (qty, entry, realized) = apply_fill_to_position(
            dec!(1),
            dec!(100),
            OrderSide::Sell,
            dec!(1),
            dec!(95),
        );
        assert_eq!(qty, Decimal::ZERO);
        assert_eq!(entry, Decimal::ZERO);
        assert_eq!(realized, dec!(-5));
    }

    // -----------------------------------------------------------------------
    // Transactional path
    // -----------------------------------------------------------------------

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

    fn fill(sa: i64, trade_id: &str, side: OrderSide, qty: Decimal, price: Decimal) -> FillEvent {
        FillEvent {
            strategy_account_id: sa,
            symbol: "BTC/USDT".into(),
            side,
            price,
            quantity: qty,
            exchange_trade_id: Some(trade_id.into()),
            exchange_order_id: "ord-1".into(),
            commission: dec!(0.001),
            is_maker: false,
            execution_time: Utc::now(),
            market_type: MarketType::Spot,
        }
    }

    #[tokio::test]
    async fn replaying_a_fill_is_a_noop() {
        let (db, sa) = seeded().await;
        let event = fill(sa, "t-1", OrderSide::Buy, dec!(1), dec!(100));

        let first = db.apply_fill(&event).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.position.quantity, dec!(1));

        let second = db.apply_fill(&event).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.position.quantity, dec!(1));
        assert_eq!(second.position.entry_price, dec!(100));
    }

    #[tokio::test]
    async fn realized_pnl_flows_into_capital() {
        let (db, sa) = seeded().await;
        db.apply_fill(&fill(sa, "t-1", OrderSide::Buy, dec!(2), dec!(100)))
            .await
            .unwrap();
        let outcome = db
            .apply_fill(&fill(sa, "t-2", OrderSide::Sell, dec!(1), dec!(120)))
            .await
            .unwrap();
        assert_eq!(outcome.realized_pnl, dec!(20));

        let capital = db.strategy_capital(sa).await.unwrap().unwrap();
        assert_eq!(capital.realized_pnl, dec!(20));
        let position = db.position(sa, "BTC/USDT").await.unwrap().unwrap();
        assert_eq!(position.quantity, dec!(1));
        assert_eq!(position.realized_pnl, dec!(20));
    }

    #[tokio::test]
    async fn full_fill_deletes_the_open_order() {
        let (db, sa) = seeded().await;
        db.insert_pending_order(
            sa,
            "ord-1",
            "cli-1",
            "BTC/USDT",
            OrderSide::Buy,
            crate::types::OrderType::Limit,
            Some(dec!(100)),
            None,
            dec!(1),
            MarketType::Spot,
        )
        .await
        .unwrap();

        let outcome = db
            .apply_fill(&fill(sa, "t-1", OrderSide::Buy, dec!(1), dec!(100)))
            .await
            .unwrap();
        assert!(outcome.order_deleted);
        assert_eq!(outcome.order_status, Some(OrderStatus::Filled));
        assert!(db.open_order_by_exchange_id("ord-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_fill_updates_progress() {
        let (db, sa) = seeded().await;
        db.insert_pending_order(
            sa,
            "ord-1",
            "cli-1",
            "BTC/USDT",
            OrderSide::Buy,
            crate::types::OrderType::Limit,
            Some(dec!(100)),
            None,
            dec!(2),
            MarketType::Spot,
        )
        .await
        .unwrap();

        let outcome = db
            .apply_fill(&fill(sa, "t-1", OrderSide::Buy, dec!(0.5), dec!(100)))
            .await
            .unwrap();
        assert!(!outcome.order_deleted);
        assert_eq!(outcome.order_status, Some(OrderStatus::PartiallyFilled));

        let row = db.open_order_by_exchange_id("ord-1").await.unwrap().unwrap();
        assert_eq!(row.filled_quantity, dec!(0.5));
        assert_eq!(row.status, OrderStatus::PartiallyFilled);
    }

    #[tokio::test]
    async fn sequence_of_fills_keeps_cost_weighted_average() {
        let (db, sa) = seeded().await;
        db.apply_fill(&fill(sa, "t-1", OrderSide::Buy, dec!(1), dec!(100)))
            .await
            .unwrap();
        db.apply_fill(&fill(sa, "t-2", OrderSide::Buy, dec!(3), dec!(120)))
            .await
            .unwrap();
        let position = db.position(sa, "BTC/USDT").await.unwrap().unwrap();
        assert_eq!(position.quantity, dec!(4));
        assert_eq!(position.entry_price, dec!(115));
    }
}
