// =============================================================================
// Fill Monitor — canonical fill events from WS and reconciliation paths
// =============================================================================
//
// Both delivery paths (WebSocket user streams and periodic reconciliation)
// funnel into `process_fill`. The database transaction is idempotent by
// exchange_trade_id, so at-least-once delivery from either path is safe; the
// SSE fan-out only happens on the first application.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::{Database, FillOutcome, OpenOrderRow};
use crate::exchange::ExchangeTrade;
use crate::sse::{AccountInfo, EventHub, OrderEvent, PositionEvent};
use crate::types::{FillEvent, MarketType, OrderStatus};

/// Attempts against transient database failures before giving up and leaving
/// the event to the next reconciliation pass.
const DB_RETRY_ATTEMPTS: u32 = 3;

pub struct FillMonitor {
    db: Database,
    hub: Arc<EventHub>,
}

impl FillMonitor {
    pub fn new(db: Database, hub: Arc<EventHub>) -> Self {
        Self { db, hub }
    }

    /// Bind an exchange-reported trade to its strategy account, producing the
    /// canonical event shape.
    pub fn fill_from_trade(
        strategy_account_id: i64,
        market_type: MarketType,
        trade: &ExchangeTrade,
    ) -> FillEvent {
        FillEvent {
            strategy_account_id,
            symbol: trade.symbol.clone(),
            side: trade.side,
            price: trade.price,
            quantity: trade.quantity,
            exchange_trade_id: trade.exchange_trade_id.clone(),
            exchange_order_id: trade.exchange_order_id.clone(),
            commission: trade.commission,
            is_maker: trade.is_maker,
            execution_time: trade.time,
            market_type,
        }
    }

    /// Apply one fill and fan out the resulting events. Returns the database
    /// outcome so callers can aggregate.
    pub async fn process_fill(&self, fill: &FillEvent) -> Result<FillOutcome> {
        // Order context is read before the transaction may delete the row.
        let order_before = self
            .db
            .open_order_by_exchange_id(&fill.exchange_order_id)
            .await?;

        let outcome = self.apply_with_retry(fill).await?;

        if outcome.duplicate {
            debug!(
                trade_id = ?fill.exchange_trade_id,
                order_id = %fill.exchange_order_id,
                "duplicate fill discarded"
            );
            return Ok(outcome);
        }

        info!(
            order_id = %fill.exchange_order_id,
            symbol = %fill.symbol,
            side = %fill.side,
            quantity = %fill.quantity,
            price = %fill.price,
            realized_pnl = %outcome.realized_pnl,
            "fill applied"
        );

        self.publish_events(fill, &outcome, order_before.as_ref())
            .await;
        Ok(outcome)
    }

    async fn apply_with_retry(&self, fill: &FillEvent) -> Result<FillOutcome> {
        let mut last_err = None;
        for attempt in 1..=DB_RETRY_ATTEMPTS {
            match self.db.apply_fill(fill).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(
                        attempt,
                        order_id = %fill.exchange_order_id,
                        error = %e,
                        "fill transaction failed"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64))
                        .await;
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }

    /// Emit `order_update` and `position_update` for one applied fill, both
    /// tied to the same strategy.
    async fn publish_events(
        &self,
        fill: &FillEvent,
        outcome: &FillOutcome,
        order_before: Option<&OpenOrderRow>,
    ) {
        let context = match self.db.binding_context(fill.strategy_account_id).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                debug!(
                    strategy_account_id = fill.strategy_account_id,
                    "no binding context — events skipped"
                );
                return;
            }
            Err(e) => {
                warn!(error = %e, "binding context lookup failed — events skipped");
                return;
            }
        };

        let account = AccountInfo {
            name: context.account_name.clone(),
            exchange: context.exchange.clone(),
        };
        let now = Utc::now().to_rfc3339();

        let order_event_type = if outcome.order_deleted
            || outcome.order_status == Some(OrderStatus::Filled)
        {
            "order_filled"
        } else {
            "order_updated"
        };
        self.hub
            .emit_order_event(OrderEvent {
                event_type: order_event_type.to_string(),
                order_id: fill.exchange_order_id.clone(),
                symbol: fill.symbol.clone(),
                strategy_id: context.strategy_id,
                user_id: context.user_id,
                side: fill.side.as_str().to_string(),
                order_type: order_before
                    .map(|o| o.order_type.as_str().to_string())
                    .unwrap_or_else(|| "MARKET".to_string()),
                quantity: fill.quantity.to_string(),
                price: Some(fill.price.to_string()),
                stop_price: order_before
                    .and_then(|o| o.stop_price)
                    .map(|p| p.to_string()),
                status: outcome
                    .order_status
                    .unwrap_or(OrderStatus::Filled)
                    .as_str()
                    .to_string(),
                account: account.clone(),
                timestamp: now.clone(),
                suppress_toast: false,
            })
            .await;

        let position_event_type = if outcome.position.quantity.is_zero() {
            "position_closed"
        } else if outcome.previous_quantity.is_zero() {
            "position_created"
        } else {
            "position_updated"
        };
        self.hub
            .emit_position_event(PositionEvent {
                event_type: position_event_type.to_string(),
                position_id: outcome.position.id,
                symbol: fill.symbol.clone(),
                strategy_id: context.strategy_id,
                user_id: context.user_id,
                quantity: outcome.position.quantity.to_string(),
                entry_price: outcome.position.entry_price.to_string(),
                previous_quantity: Some(outcome.previous_quantity.to_string()),
                account,
                timestamp: now,
            })
            .await;
    }
}

impl std::fmt::Debug for FillMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FillMonitor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, OrderType};
    use rust_decimal_macros::dec;

    async fn fixture() -> (FillMonitor, Database, Arc<EventHub>, i64, i64, i64) {
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
        let monitor = FillMonitor::new(db.clone(), hub.clone());
        (monitor, db, hub, user, strategy, sa)
    }

    fn fill(sa: i64, trade_id: &str) -> FillEvent {
        FillEvent {
            strategy_account_id: sa,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            price: dec!(42000),
            quantity: dec!(0.5),
            exchange_trade_id: Some(trade_id.into()),
            exchange_order_id: "ord-1".into(),
            commission: dec!(0.0005),
            is_maker: true,
            execution_time: Utc::now(),
            market_type: MarketType::Spot,
        }
    }

    #[tokio::test]
    async fn fill_publishes_order_and_position_events() {
        let (monitor, db, hub, user, strategy, sa) = fixture().await;
        db.insert_pending_order(
            sa,
            "ord-1",
            "cli-1",
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

        let mut sub = hub.subscribe(user, strategy);
        let _connection = sub.receiver.recv().await.unwrap();

        let outcome = monitor.process_fill(&fill(sa, "t-1")).await.unwrap();
        assert!(outcome.order_deleted);

        let order = sub.receiver.recv().await.unwrap();
        assert_eq!(order.event_type, "order_update");
        assert_eq!(order.data["event_type"], "order_filled");
        assert_eq!(order.data["strategy_id"], strategy);

        let position = sub.receiver.recv().await.unwrap();
        assert_eq!(position.event_type, "position_update");
        assert_eq!(position.data["event_type"], "position_created");
        assert_eq!(position.data["strategy_id"], strategy);
    }

    #[tokio::test]
    async fn duplicate_fill_publishes_nothing() {
        let (monitor, _db, hub, user, strategy, sa) = fixture().await;
        let mut sub = hub.subscribe(user, strategy);
        let _connection = sub.receiver.recv().await.unwrap();

        let first = monitor.process_fill(&fill(sa, "t-1")).await.unwrap();
        assert!(!first.duplicate);
        let _order = sub.receiver.recv().await.unwrap();
        let _position = sub.receiver.recv().await.unwrap();

        let second = monitor.process_fill(&fill(sa, "t-1")).await.unwrap();
        assert!(second.duplicate);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_fill_emits_position_closed() {
        let (monitor, _db, hub, user, strategy, sa) = fixture().await;
        monitor.process_fill(&fill(sa, "t-1")).await.unwrap();

        let mut sub = hub.subscribe(user, strategy);
        let _connection = sub.receiver.recv().await.unwrap();

        let mut closing = fill(sa, "t-2");
        closing.side = OrderSide::Sell;
        closing.exchange_order_id = "ord-2".into();
        monitor.process_fill(&closing).await.unwrap();

        let _order = sub.receiver.recv().await.unwrap();
        let position = sub.receiver.recv().await.unwrap();
        assert_eq!(position.data["event_type"], "position_closed");
        assert_eq!(position.data["quantity"], "0");
    }

    #[test]
    fn trade_binding_preserves_identifiers() {
        let trade = ExchangeTrade {
            exchange_order_id: "o-9".into(),
            exchange_trade_id: Some("t-9".into()),
            symbol: "ETH/USDT".into(),
            side: OrderSide::Sell,
            price: dec!(3000),
            quantity: dec!(2),
            commission: dec!(0.01),
            is_maker: false,
            time: Utc::now(),
        };
        let fill = FillMonitor::fill_from_trade(7, MarketType::Futures, &trade);
        assert_eq!(fill.strategy_account_id, 7);
        assert_eq!(fill.exchange_order_id, "o-9");
        assert_eq!(fill.exchange_trade_id.as_deref(), Some("t-9"));
        assert_eq!(fill.market_type, MarketType::Futures);
    }
}
