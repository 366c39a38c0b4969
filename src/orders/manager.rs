// =============================================================================
// Order Manager — creation, cancellation, and exchange reconciliation
// =============================================================================
//
// The creation sequence is two transactions by design: the PENDING row (with
// a placeholder exchange id and a unique client reference) commits BEFORE the
// REST call goes out, so a WebSocket fill racing the response can already
// find the order. The REST completion then patches the real id — and never
// resurrects a row the fill path has deleted.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{
    BindingRow, Database, FailedOrderStatus, OpenOrderFilter, OpenOrderRow, StrategyRow,
    PENDING_ID_PREFIX,
};
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::{AdapterSource, ExchangeAdapter};
use crate::exchange::precision::prepare_order;
use crate::fills::FillMonitor;
use crate::sse::{AccountInfo, EventHub, OrderEvent};
use crate::types::{MarketInfo, MarketType, OrderRequest, OrderSide, OrderStatus, OrderType};

/// Rows that never received a real exchange id (or vanished from the venue)
/// are resolved after this long.
const RECONCILE_GRACE: Duration = Duration::from_secs(60);

/// Retries a cancel-queue item receives before being marked FAILED.
pub const CANCEL_MAX_RETRIES: i64 = 5;

/// What the caller asks the manager to place.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Bump undersized quantities to 2x the venue minimum instead of
    /// rejecting.
    pub auto_adjust: bool,
}

/// Successful placement summary.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub executed_quantity: Decimal,
    pub executed_price: Option<Decimal>,
    /// Set when the precision preprocessor changed the quantity.
    pub adjustment: Option<String>,
}

/// Outcome of a single-order cancel.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The exchange confirmed (or the order was already gone on the venue).
    Cancelled { symbol: String },
    /// The order had no exchange id yet; a cancel-queue item now tracks it.
    Queued { queue_id: i64 },
}

/// Aggregate response of a bulk cancel.
#[derive(Debug, Clone, Serialize)]
pub struct BulkCancelReport {
    pub cancelled_orders: Vec<serde_json::Value>,
    pub failed_orders: Vec<serde_json::Value>,
    pub total_processed: usize,
    pub filter_conditions: Vec<String>,
}

/// Summary of one reconciliation pass over one (account, market).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    pub filled: usize,
    pub cancelled: usize,
    pub patched_ids: usize,
}

pub struct OrderManager {
    db: Database,
    fills: Arc<FillMonitor>,
    hub: Arc<EventHub>,
    adapters: Arc<dyn AdapterSource>,
    /// Accounts whose credentials failed; no new orders until a call succeeds.
    unhealthy_accounts: RwLock<HashSet<i64>>,
}

impl OrderManager {
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
            unhealthy_accounts: RwLock::new(HashSet::new()),
        }
    }

    pub fn account_is_healthy(&self, account_id: i64) -> bool {
        !self.unhealthy_accounts.read().contains(&account_id)
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    pub async fn create_order(
        &self,
        strategy: &StrategyRow,
        binding: &BindingRow,
        spec: &OrderSpec,
    ) -> ExchangeResult<PlacedOrder> {
        if !strategy.is_active {
            return Err(ExchangeError::Validation(format!(
                "strategy {} is inactive",
                strategy.id
            )));
        }
        if !binding.strategy_account.is_active || !binding.account.is_active {
            return Err(ExchangeError::Validation(
                "strategy account binding is inactive".into(),
            ));
        }
        if !self.account_is_healthy(binding.account.id) {
            return Err(ExchangeError::Auth(format!(
                "account {} flagged unhealthy after auth failure",
                binding.account.id
            )));
        }
        if spec.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Validation(format!(
                "quantity must be positive, got {}",
                spec.quantity
            )));
        }

        let adapter = self
            .adapters
            .adapter_for(&binding.account, strategy.market_type)
            .await?;

        // Precision preprocessing against the live (or rule-based) market.
        let market = self.market_for(adapter.as_ref(), &spec.symbol).await?;
        let reference_price = if spec.price.is_none() && market.min_notional > Decimal::ZERO {
            Some(adapter.fetch_quote(&spec.symbol).await?.last)
        } else {
            None
        };
        let request = OrderRequest {
            symbol: spec.symbol.clone(),
            side: spec.side,
            order_type: spec.order_type,
            quantity: spec.quantity,
            price: spec.price,
            stop_price: spec.stop_price,
            client_order_id: None,
        };
        let prepared = prepare_order(&request, &market, reference_price, spec.auto_adjust)?;
        if let Some(adjustment) = &prepared.adjustment {
            info!(symbol = %spec.symbol, adjustment = %adjustment, "order auto-adjusted");
        }

        // The PENDING row commits before the wire call (own transaction).
        let placeholder = format!("{PENDING_ID_PREFIX}{}", Uuid::new_v4());
        let client_order_id = format!("sg-{}", Uuid::new_v4().simple());
        let row = self
            .db
            .insert_pending_order(
                binding.strategy_account.id,
                &placeholder,
                &client_order_id,
                &spec.symbol,
                spec.side,
                spec.order_type,
                prepared.price,
                prepared.stop_price,
                prepared.quantity,
                strategy.market_type,
            )
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?;

        let wire_request = OrderRequest {
            quantity: prepared.quantity,
            price: prepared.price,
            stop_price: prepared.stop_price,
            client_order_id: Some(client_order_id.clone()),
            ..request
        };

        match adapter.create_order(&wire_request).await {
            Ok(order) => {
                self.unhealthy_accounts.write().remove(&binding.account.id);
                self.complete_placement(strategy, binding, spec, &prepared.adjustment, row, order, adapter.as_ref())
                    .await
            }
            Err(e) => {
                self.handle_placement_error(binding, spec, &row, e).await
            }
        }
    }

    /// Patch the local row with the exchange's answer and hand terminal
    /// results to the fill pipeline.
    async fn complete_placement(
        &self,
        strategy: &StrategyRow,
        binding: &BindingRow,
        spec: &OrderSpec,
        adjustment: &Option<String>,
        row: OpenOrderRow,
        order: crate::types::Order,
        adapter: &dyn ExchangeAdapter,
    ) -> ExchangeResult<PlacedOrder> {
        // The row never carries a terminal status: the fill event (stream,
        // synthetic, or reconciliation) is what records the execution and
        // deletes it.
        let row_status = if order.status.is_closed() {
            OrderStatus::Open
        } else {
            order.status
        };

        let patched = self
            .db
            .patch_exchange_order_id(row.id, &order.order_id, row_status, order.filled_quantity)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?;
        if !patched {
            // A WebSocket fill beat the REST response and already closed the
            // order. The execution trail is complete; nothing to do.
            debug!(order_id = %order.order_id, "row already closed by stream fill");
            return Ok(PlacedOrder {
                exchange_order_id: order.order_id,
                status: OrderStatus::Filled,
                executed_quantity: order.filled_quantity,
                executed_price: order.average_price,
                adjustment: adjustment.clone(),
            });
        }

        if order.status.is_closed() {
            if adapter.supports_user_stream() {
                // WS delivers the fill with real trade ids; reconciliation is
                // the backstop. The row stays matchable until then.
                debug!(order_id = %order.order_id, "terminal on REST — awaiting stream fill");
            } else if order.status == OrderStatus::Filled
                || !order.filled_quantity.is_zero()
            {
                // Venues without a user stream never push fills: synthesize
                // one now, with the same stable id scheme reconciliation uses.
                let executed = if order.filled_quantity.is_zero() {
                    order.quantity
                } else {
                    order.filled_quantity
                };
                let price = order
                    .average_price
                    .or(order.price)
                    .or(spec.price)
                    .unwrap_or(Decimal::ZERO);
                let fill = crate::types::FillEvent {
                    strategy_account_id: binding.strategy_account.id,
                    symbol: spec.symbol.clone(),
                    side: spec.side,
                    price,
                    quantity: executed,
                    exchange_trade_id: Some(format!("{}-fill", order.order_id)),
                    exchange_order_id: order.order_id.clone(),
                    commission: Decimal::ZERO,
                    is_maker: false,
                    execution_time: Utc::now(),
                    market_type: strategy.market_type,
                };
                if let Err(e) = self.fills.process_fill(&fill).await {
                    warn!(order_id = %order.order_id, error = %e, "synthetic fill failed");
                }
            } else {
                // Rejected/expired synchronously after acceptance: drop it.
                let _ = self.db.delete_open_order(&order.order_id).await;
            }
        } else {
            self.emit_order_event(
                binding,
                strategy.id,
                "order_created",
                &order.order_id,
                spec,
                row_status,
                false,
            )
            .await;
        }

        Ok(PlacedOrder {
            exchange_order_id: order.order_id,
            status: order.status,
            executed_quantity: order.filled_quantity,
            executed_price: order.average_price,
            adjustment: adjustment.clone(),
        })
    }

    /// Error classification per failure class: business rejections become
    /// durable FailedOrder rows, network errors defer to reconciliation,
    /// auth errors flag the account.
    async fn handle_placement_error(
        &self,
        binding: &BindingRow,
        spec: &OrderSpec,
        row: &OpenOrderRow,
        error: ExchangeError,
    ) -> ExchangeResult<PlacedOrder> {
        match &error {
            ExchangeError::Auth(msg) => {
                warn!(
                    account_id = binding.account.id,
                    error = %msg,
                    "auth failure — account flagged unhealthy"
                );
                self.unhealthy_accounts.write().insert(binding.account.id);
                let _ = self.db.delete_open_order(&row.exchange_order_id).await;
            }
            ExchangeError::Rejected(msg)
            | ExchangeError::MinNotional(msg)
            | ExchangeError::Validation(msg) => {
                let reason = match &error {
                    ExchangeError::Rejected(_) => "rejected",
                    ExchangeError::MinNotional(_) => "below_minimum",
                    _ => "invalid_order",
                };
                if let Err(e) = self
                    .db
                    .insert_failed_order(
                        binding.strategy_account.id,
                        &spec.symbol,
                        spec.side,
                        spec.order_type,
                        spec.quantity,
                        spec.price,
                        spec.stop_price,
                        row.market_type,
                        reason,
                        Some(msg),
                    )
                    .await
                {
                    warn!(error = %e, "failed to persist FailedOrder");
                }
                let _ = self.db.delete_open_order(&row.exchange_order_id).await;
            }
            ExchangeError::Network(msg) | ExchangeError::RateLimited(msg) => {
                // The order may have landed. The row stays PENDING and
                // reconciliation resolves it by client reference or grace
                // timeout.
                warn!(
                    order_ref = %row.exchange_order_id,
                    error = %msg,
                    "network failure during placement — deferring to reconciliation"
                );
            }
            _ => {
                let _ = self.db.delete_open_order(&row.exchange_order_id).await;
            }
        }
        Err(error)
    }

    /// Market metadata for one symbol; rule-based venues (empty markets map)
    /// get a synthetic whole-share entry.
    async fn market_for(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
    ) -> ExchangeResult<MarketInfo> {
        let markets = adapter.load_markets(false).await?;
        if let Some(market) = markets.get(symbol) {
            return Ok(market.clone());
        }
        if markets.is_empty() {
            let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "KRW"));
            return Ok(MarketInfo {
                symbol: symbol.to_string(),
                base: base.to_string(),
                quote: quote.to_string(),
                step_size: Decimal::ONE,
                tick_size: Decimal::ZERO,
                min_qty: Decimal::ONE,
                min_notional: Decimal::ZERO,
                max_qty: None,
                active: true,
            });
        }
        Err(ExchangeError::Validation(format!(
            "unknown symbol {symbol} on {}",
            adapter.exchange_name()
        )))
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel one order on behalf of a user. Terminal orders are a conflict;
    /// orders without an exchange id yet go to the cancel queue.
    pub async fn cancel_order_for_user(
        &self,
        user_id: i64,
        exchange_order_id: &str,
    ) -> ExchangeResult<CancelOutcome> {
        let Some(row) = self
            .db
            .open_order_by_exchange_id(exchange_order_id)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
        else {
            // Not open any more. Distinguish "already filled" (conflict)
            // from "never existed" (not found) via the execution trail.
            let executions = self
                .db
                .executions_for_order(exchange_order_id)
                .await
                .map_err(|e| ExchangeError::Internal(e.to_string()))?;
            return if executions.is_empty() {
                Err(ExchangeError::OrderNotFound(exchange_order_id.to_string()))
            } else {
                Err(ExchangeError::Rejected(format!(
                    "order {exchange_order_id} already filled"
                )))
            };
        };

        let context = self
            .db
            .binding_context(row.strategy_account_id)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
            .ok_or_else(|| ExchangeError::Internal("binding context missing".into()))?;
        if context.user_id != user_id {
            return Err(ExchangeError::Permission(
                "order belongs to another user".into(),
            ));
        }

        if row.status == OrderStatus::Pending {
            // No exchange id to cancel against yet; the queue worker retries
            // until the id appears or the order resolves. The client
            // reference survives the id patch, so the item stays resolvable.
            let order_ref = row
                .client_order_id
                .clone()
                .unwrap_or_else(|| row.exchange_order_id.clone());
            let item = self
                .db
                .enqueue_cancel(&order_ref, CANCEL_MAX_RETRIES)
                .await
                .map_err(|e| ExchangeError::Internal(e.to_string()))?;
            info!(order_ref = %row.exchange_order_id, queue_id = item.id, "cancel queued");
            return Ok(CancelOutcome::Queued { queue_id: item.id });
        }

        self.cancel_open_row(&row, &context).await
    }

    /// Cancel a row that has a real exchange id.
    async fn cancel_open_row(
        &self,
        row: &OpenOrderRow,
        context: &crate::db::BindingContext,
    ) -> ExchangeResult<CancelOutcome> {
        let account = self
            .db
            .account_by_id(context.account_id)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
            .ok_or_else(|| ExchangeError::Internal("account missing".into()))?;
        let adapter = self
            .adapters
            .adapter_for(&account, row.market_type)
            .await?;

        match adapter
            .cancel_order(&row.exchange_order_id, Some(&row.symbol))
            .await
        {
            Ok(_) | Err(ExchangeError::OrderNotFound(_)) => {
                // Gone on the venue either way; reconciliation records any
                // fill that slipped in before the cancel.
                self.db
                    .delete_open_order(&row.exchange_order_id)
                    .await
                    .map_err(|e| ExchangeError::Internal(e.to_string()))?;
                self.emit_cancel_event(row, context).await;
                info!(order_id = %row.exchange_order_id, "order cancelled");
                Ok(CancelOutcome::Cancelled {
                    symbol: row.symbol.clone(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Bulk cancel across a user's open orders, with optional filters.
    pub async fn cancel_all_for_user(
        &self,
        user_id: i64,
        filter: &OpenOrderFilter,
    ) -> Result<BulkCancelReport> {
        let rows = self.db.open_orders_for_user(user_id, filter).await?;
        let filter_conditions = filter.conditions();

        if rows.is_empty() {
            info!(user_id, ?filter_conditions, "bulk cancel: nothing to do");
            return Ok(BulkCancelReport {
                cancelled_orders: vec![],
                failed_orders: vec![],
                total_processed: 0,
                filter_conditions,
            });
        }

        info!(user_id, orders = rows.len(), ?filter_conditions, "bulk cancel started");

        let mut cancelled = Vec::new();
        let mut failed = Vec::new();
        let mut per_type: HashMap<OrderType, u32> = HashMap::new();
        let mut batch_key: Option<(i64, i64)> = None;

        for row in &rows {
            let summary = json!({
                "order_id": row.exchange_order_id,
                "symbol": row.symbol,
                "strategy_account_id": row.strategy_account_id,
            });
            match self
                .cancel_order_for_user(user_id, &row.exchange_order_id)
                .await
            {
                Ok(outcome) => {
                    let mut value = summary;
                    if let CancelOutcome::Queued { queue_id } = outcome {
                        value["queued"] = json!(true);
                        value["queue_id"] = json!(queue_id);
                    }
                    *per_type.entry(row.order_type).or_default() += 1;
                    if batch_key.is_none() {
                        if let Ok(Some(ctx)) =
                            self.db.binding_context(row.strategy_account_id).await
                        {
                            batch_key = Some((ctx.user_id, ctx.strategy_id));
                        }
                    }
                    cancelled.push(value);
                }
                Err(e) => {
                    let mut value = summary;
                    value["error"] = json!(e.to_string());
                    failed.push(value);
                }
            }
        }

        // One collapsed frame instead of a toast per order.
        if let Some((event_user, event_strategy)) = batch_key {
            let summaries = per_type
                .into_iter()
                .map(|(order_type, count)| crate::sse::OrderBatchSummary {
                    order_type: order_type.as_str().to_string(),
                    created: 0,
                    cancelled: count,
                })
                .collect();
            self.hub
                .emit_order_batch_event(crate::sse::OrderBatchEvent {
                    summaries,
                    strategy_id: event_strategy,
                    user_id: event_user,
                    timestamp: Utc::now().to_rfc3339(),
                })
                .await;
        }

        info!(
            user_id,
            cancelled = cancelled.len(),
            failed = failed.len(),
            "bulk cancel completed"
        );

        Ok(BulkCancelReport {
            total_processed: cancelled.len() + failed.len(),
            cancelled_orders: cancelled,
            failed_orders: failed,
            filter_conditions,
        })
    }

    // -------------------------------------------------------------------------
    // Failed-order retry
    // -------------------------------------------------------------------------

    pub async fn retry_failed_order(
        &self,
        user_id: i64,
        failed_order_id: i64,
    ) -> ExchangeResult<PlacedOrder> {
        let row = self
            .db
            .failed_order_for_user(user_id, failed_order_id)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
            .ok_or_else(|| {
                ExchangeError::OrderNotFound(format!("failed order {failed_order_id}"))
            })?;

        if row.status == FailedOrderStatus::Exhausted || row.status == FailedOrderStatus::Removed {
            return Err(ExchangeError::Rejected(format!(
                "failed order {failed_order_id} is {}",
                row.status.as_str()
            )));
        }
        if row.retry_count >= row.max_retries {
            self.db
                .update_failed_order(row.id, FailedOrderStatus::Exhausted, row.retry_count)
                .await
                .map_err(|e| ExchangeError::Internal(e.to_string()))?;
            return Err(ExchangeError::Rejected(format!(
                "failed order {failed_order_id} exhausted its retries"
            )));
        }

        let (strategy, binding) = self
            .load_binding(row.strategy_account_id)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?;

        self.db
            .update_failed_order(row.id, FailedOrderStatus::Retrying, row.retry_count + 1)
            .await
            .map_err(|e| ExchangeError::Internal(e.to_string()))?;

        let spec = OrderSpec {
            symbol: row.symbol.clone(),
            side: row.side,
            order_type: row.order_type,
            quantity: row.quantity,
            price: row.price,
            stop_price: row.stop_price,
            auto_adjust: false,
        };

        match self.create_order(&strategy, &binding, &spec).await {
            Ok(placed) => {
                self.db
                    .update_failed_order(row.id, FailedOrderStatus::Removed, row.retry_count + 1)
                    .await
                    .map_err(|e| ExchangeError::Internal(e.to_string()))?;
                Ok(placed)
            }
            Err(e) => {
                let status = if row.retry_count + 1 >= row.max_retries {
                    FailedOrderStatus::Exhausted
                } else {
                    FailedOrderStatus::PendingRetry
                };
                self.db
                    .update_failed_order(row.id, status, row.retry_count + 1)
                    .await
                    .map_err(|err| ExchangeError::Internal(err.to_string()))?;
                Err(e)
            }
        }
    }

    async fn load_binding(&self, strategy_account_id: i64) -> Result<(StrategyRow, BindingRow)> {
        let strategy_account = self
            .db
            .strategy_account_by_id(strategy_account_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("strategy account {strategy_account_id} missing"))?;
        let strategy = self
            .db
            .strategy_by_id(strategy_account.strategy_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("strategy missing"))?;
        let account = self
            .db
            .account_by_id(strategy_account.account_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("account missing"))?;
        Ok((
            strategy,
            BindingRow {
                strategy_account,
                account,
            },
        ))
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// One reconciliation pass over one (account, market): fold recent trades
    /// through the fill pipeline, patch placeholder ids by client reference,
    /// resolve rows the exchange no longer lists.
    pub async fn reconcile_account(
        &self,
        account: &crate::db::AccountRow,
        market_type: MarketType,
    ) -> Result<ReconcileReport> {
        let rows = self
            .db
            .open_orders_for_account(account.id, market_type)
            .await?;
        if rows.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let adapter = self.adapters.adapter_for(account, market_type).await?;
        let mut report = ReconcileReport {
            checked: rows.len(),
            ..Default::default()
        };

        // Recent trades per distinct symbol, keyed by exchange order id.
        let symbols: HashSet<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
        let mut trades_by_order: HashMap<String, Vec<crate::exchange::ExchangeTrade>> =
            HashMap::new();
        for symbol in &symbols {
            match adapter.fetch_recent_trades(Some(symbol), 100).await {
                Ok(trades) => {
                    for trade in trades {
                        trades_by_order
                            .entry(trade.exchange_order_id.clone())
                            .or_default()
                            .push(trade);
                    }
                }
                Err(e) => warn!(symbol, error = %e, "recent trades fetch failed"),
            }
        }

        // Exchange view of outstanding orders.
        let exchange_orders = adapter.fetch_open_orders(None).await?;
        let by_id: HashMap<&str, &crate::types::Order> = exchange_orders
            .iter()
            .map(|o| (o.order_id.as_str(), o))
            .collect();
        let by_client: HashMap<&str, &crate::types::Order> = exchange_orders
            .iter()
            .filter_map(|o| o.client_order_id.as_deref().map(|c| (c, o)))
            .collect();

        for row in rows {
            let mut row = row;

            // Placeholder rows: recover the real id through the client
            // reference the exchange echoes back.
            if row.has_placeholder_id() {
                let matched = row
                    .client_order_id
                    .as_deref()
                    .and_then(|c| by_client.get(c));
                match matched {
                    Some(exchange_order) => {
                        self.db
                            .patch_exchange_order_id(
                                row.id,
                                &exchange_order.order_id,
                                exchange_order.status,
                                exchange_order.filled_quantity,
                            )
                            .await?;
                        report.patched_ids += 1;
                        row.exchange_order_id = exchange_order.order_id.clone();
                        row.status = exchange_order.status;
                    }
                    None => {
                        let age = Utc::now() - row.created_at;
                        if age.to_std().unwrap_or_default() > RECONCILE_GRACE {
                            warn!(
                                order_ref = %row.exchange_order_id,
                                "pending order never reached the exchange — dropping"
                            );
                            self.db.delete_open_order(&row.exchange_order_id).await?;
                            report.cancelled += 1;
                        }
                        continue;
                    }
                }
            }

            // Fold any fills through the canonical pipeline (idempotent).
            if let Some(trades) = trades_by_order.get(&row.exchange_order_id) {
                for trade in trades {
                    let fill = FillMonitor::fill_from_trade(
                        row.strategy_account_id,
                        market_type,
                        trade,
                    );
                    match self.fills.process_fill(&fill).await {
                        Ok(outcome) if outcome.order_deleted => report.filled += 1,
                        Ok(_) => {}
                        Err(e) => warn!(order_id = %row.exchange_order_id, error = %e, "reconcile fill failed"),
                    }
                }
            }

            // The fill pipeline may have deleted the row already.
            let Some(current) = self
                .db
                .open_order_by_exchange_id(&row.exchange_order_id)
                .await?
            else {
                continue;
            };

            if let Some(exchange_order) = by_id.get(current.exchange_order_id.as_str()) {
                if exchange_order.status != current.status
                    || exchange_order.filled_quantity != current.filled_quantity
                {
                    self.db
                        .reconcile_order_status(
                            &current.exchange_order_id,
                            exchange_order.status,
                            exchange_order.filled_quantity,
                        )
                        .await?;
                    report.updated += 1;
                }
            } else {
                // Not listed and no fills recorded: after the grace period it
                // was cancelled on the venue.
                let age = Utc::now() - current.updated_at;
                if age.to_std().unwrap_or_default() > RECONCILE_GRACE {
                    self.db
                        .delete_open_order(&current.exchange_order_id)
                        .await?;
                    if let Ok(Some(context)) =
                        self.db.binding_context(current.strategy_account_id).await
                    {
                        self.emit_cancel_event(&current, &context).await;
                    }
                    report.cancelled += 1;
                }
            }
        }

        if report.updated + report.filled + report.cancelled + report.patched_ids > 0 {
            info!(
                account_id = account.id,
                market_type = %market_type,
                checked = report.checked,
                updated = report.updated,
                filled = report.filled,
                cancelled = report.cancelled,
                patched = report.patched_ids,
                "reconciliation pass completed"
            );
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn emit_order_event(
        &self,
        binding: &BindingRow,
        strategy_id: i64,
        event_type: &str,
        order_id: &str,
        spec: &OrderSpec,
        status: OrderStatus,
        suppress_toast: bool,
    ) {
        self.hub
            .emit_order_event(OrderEvent {
                event_type: event_type.to_string(),
                order_id: order_id.to_string(),
                symbol: spec.symbol.clone(),
                strategy_id,
                user_id: binding.account.user_id,
                side: spec.side.as_str().to_string(),
                order_type: spec.order_type.as_str().to_string(),
                quantity: spec.quantity.to_string(),
                price: spec.price.map(|p| p.to_string()),
                stop_price: spec.stop_price.map(|p| p.to_string()),
                status: status.as_str().to_string(),
                account: AccountInfo {
                    name: binding.account.name.clone(),
                    exchange: binding.account.exchange.clone(),
                },
                timestamp: Utc::now().to_rfc3339(),
                suppress_toast,
            })
            .await;
    }

    async fn emit_cancel_event(&self, row: &OpenOrderRow, context: &crate::db::BindingContext) {
        self.hub
            .emit_order_event(OrderEvent {
                event_type: "order_cancelled".to_string(),
                order_id: row.exchange_order_id.clone(),
                symbol: row.symbol.clone(),
                strategy_id: context.strategy_id,
                user_id: context.user_id,
                side: row.side.as_str().to_string(),
                order_type: row.order_type.as_str().to_string(),
                quantity: row.quantity.to_string(),
                price: row.price.map(|p| p.to_string()),
                stop_price: row.stop_price.map(|p| p.to_string()),
                status: OrderStatus::Canceled.as_str().to_string(),
                account: AccountInfo {
                    name: context.account_name.clone(),
                    exchange: context.exchange.clone(),
                },
                timestamp: Utc::now().to_rfc3339(),
                suppress_toast: false,
            })
            .await;
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("unhealthy_accounts", &self.unhealthy_accounts.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::{MockExchange, MockSource};
    use crate::exchange::ExchangeTrade;
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Database,
        hub: Arc<EventHub>,
        mock: Arc<MockExchange>,
        manager: OrderManager,
        user_id: i64,
        strategy: StrategyRow,
        binding: BindingRow,
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
        let sa_id = db
            .insert_strategy_account(strategy_id, account_id, dec!(1))
            .await
            .unwrap();

        let strategy = db.strategy_by_id(strategy_id).await.unwrap().unwrap();
        let bindings = db.active_bindings(strategy_id).await.unwrap();
        let binding = bindings.into_iter().next().unwrap();
        assert_eq!(binding.strategy_account.id, sa_id);

        let hub = Arc::new(EventHub::new(db.clone()));
        let fills = Arc::new(FillMonitor::new(db.clone(), hub.clone()));
        let mock = Arc::new(MockExchange::new(MarketType::Spot));
        let manager = OrderManager::new(
            db.clone(),
            fills,
            hub.clone(),
            Arc::new(MockSource { mock: mock.clone() }),
        );

        Fixture {
            db,
            hub,
            mock,
            manager,
            user_id,
            strategy,
            binding,
        }
    }

    fn limit_spec() -> OrderSpec {
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

    #[tokio::test]
    async fn creation_replaces_placeholder_with_real_id() {
        let f = fixture().await;
        let placed = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap();

        // The placeholder is gone and exactly one row carries the real id.
        let row = f
            .db
            .open_order_by_exchange_id(&placed.exchange_order_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!row.has_placeholder_id());
        assert_eq!(row.status, OrderStatus::Open);
        assert!(row.client_order_id.is_some());

        // The wire request carried the client reference.
        let sent = f.mock.created.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].client_order_id, row.client_order_id);
    }

    #[tokio::test]
    async fn inactive_strategy_is_rejected_before_the_wire() {
        let mut f = fixture().await;
        f.strategy.is_active = false;
        let err = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
        assert!(f.mock.created.lock().is_empty());
    }

    #[tokio::test]
    async fn immediate_trigger_rejection_becomes_failed_order() {
        let f = fixture().await;
        f.mock.script_create(Err(ExchangeError::Rejected(
            "Order would immediately trigger".into(),
        )));

        let spec = OrderSpec {
            order_type: OrderType::StopLimit,
            stop_price: Some(dec!(41999)),
            ..limit_spec()
        };
        let err = f
            .manager
            .create_order(&f.strategy, &f.binding, &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));

        // Durable FailedOrder, no lingering open order.
        let failed = f
            .db
            .failed_orders_for_user(f.user_id, None, None)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, "rejected");
        assert_eq!(
            failed[0].exchange_error.as_deref(),
            Some("Order would immediately trigger")
        );
        let open = f
            .db
            .open_orders_for_user(f.user_id, &OpenOrderFilter::default())
            .await
            .unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn network_error_leaves_the_pending_row_for_reconciliation() {
        let f = fixture().await;
        f.mock
            .script_create(Err(ExchangeError::Network("timed out".into())));

        let err = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Network(_)));

        let open = f
            .db
            .open_orders_for_user(f.user_id, &OpenOrderFilter::default())
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].has_placeholder_id());
        assert_eq!(open[0].status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn auth_error_flags_the_account() {
        let f = fixture().await;
        f.mock
            .script_create(Err(ExchangeError::Auth("invalid api key".into())));

        let _ = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap_err();
        assert!(!f.manager.account_is_healthy(f.binding.account.id));

        // Subsequent attempts are rejected locally.
        let err = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
        assert_eq!(f.mock.created.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancelling_a_pending_order_queues_it() {
        let f = fixture().await;
        f.mock
            .script_create(Err(ExchangeError::Network("timed out".into())));
        let _ = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await;

        let row = &f
            .db
            .open_orders_for_user(f.user_id, &OpenOrderFilter::default())
            .await
            .unwrap()[0];
        let outcome = f
            .manager
            .cancel_order_for_user(f.user_id, &row.exchange_order_id)
            .await
            .unwrap();
        assert!(matches!(outcome, CancelOutcome::Queued { .. }));
    }

    #[tokio::test]
    async fn cancelling_an_open_order_deletes_the_row() {
        let f = fixture().await;
        let placed = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap();

        let outcome = f
            .manager
            .cancel_order_for_user(f.user_id, &placed.exchange_order_id)
            .await
            .unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled { .. }));
        assert!(f
            .db
            .open_order_by_exchange_id(&placed.exchange_order_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.mock.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancelling_a_filled_order_is_a_conflict_and_unknown_is_not_found() {
        let f = fixture().await;

        // Unknown id -> not found.
        let err = f
            .manager
            .cancel_order_for_user(f.user_id, "no-such-order")
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderNotFound(_)));

        // Filled order (row gone, execution trail present) -> conflict.
        let placed = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap();
        let fill = crate::types::FillEvent {
            strategy_account_id: f.binding.strategy_account.id,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            price: dec!(42000),
            quantity: dec!(0.5),
            exchange_trade_id: Some("t-1".into()),
            exchange_order_id: placed.exchange_order_id.clone(),
            commission: Decimal::ZERO,
            is_maker: false,
            execution_time: Utc::now(),
            market_type: MarketType::Spot,
        };
        f.db.apply_fill(&fill).await.unwrap();

        let err = f
            .manager
            .cancel_order_for_user(f.user_id, &placed.exchange_order_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
    }

    #[tokio::test]
    async fn another_users_order_is_forbidden() {
        let f = fixture().await;
        let placed = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap();
        let stranger = f.db.insert_user("mallory", "tok-m", false).await.unwrap();
        let err = f
            .manager
            .cancel_order_for_user(stranger, &placed.exchange_order_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Permission(_)));
    }

    #[tokio::test]
    async fn bulk_cancel_aggregates_and_respects_filters() {
        let f = fixture().await;
        for _ in 0..3 {
            f.manager
                .create_order(&f.strategy, &f.binding, &limit_spec())
                .await
                .unwrap();
        }

        let report = f
            .manager
            .cancel_all_for_user(
                f.user_id,
                &OpenOrderFilter {
                    strategy_id: Some(f.strategy.id),
                    symbol: Some("BTC/USDT".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.total_processed, 3);
        assert_eq!(report.cancelled_orders.len(), 3);
        assert!(report.failed_orders.is_empty());
        assert!(report
            .filter_conditions
            .iter()
            .any(|c| c.contains("symbol=BTC/USDT")));
        assert!(f
            .db
            .open_orders_for_user(f.user_id, &OpenOrderFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn retry_failed_order_resubmits_and_clears_the_row() {
        let f = fixture().await;
        f.mock.script_create(Err(ExchangeError::Rejected(
            "insufficient balance".into(),
        )));
        let _ = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await;
        let failed = f
            .db
            .failed_orders_for_user(f.user_id, None, None)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);

        // Next attempt succeeds.
        let placed = f
            .manager
            .retry_failed_order(f.user_id, failed[0].id)
            .await
            .unwrap();
        assert!(!placed.exchange_order_id.is_empty());
        // The row is marked removed and disappears from listings.
        let remaining = f
            .db
            .failed_orders_for_user(f.user_id, None, None)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    // -----------------------------------------------------------------------
    // Reconciliation scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn reconcile_records_fill_for_order_missing_from_exchange() {
        // An order filled while the stream was down: the exchange no longer
        // lists it, but recent trades carry its id.
        let f = fixture().await;
        let placed = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap();

        f.mock.recent_trades.lock().push(ExchangeTrade {
            exchange_order_id: placed.exchange_order_id.clone(),
            exchange_trade_id: Some("trade-77".into()),
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            price: dec!(42000),
            quantity: dec!(0.5),
            commission: dec!(0.0005),
            is_maker: true,
            time: Utc::now(),
        });

        let mut sub = f.hub.subscribe(f.user_id, f.strategy.id);
        let _connection = sub.receiver.recv().await.unwrap();

        let report = f
            .manager
            .reconcile_account(&f.binding.account, MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(report.filled, 1);

        // Exactly one execution, row deleted, one order_filled event.
        let execution = f.db.execution_by_trade_id("trade-77").await.unwrap();
        assert!(execution.is_some());
        assert!(f
            .db
            .open_order_by_exchange_id(&placed.exchange_order_id)
            .await
            .unwrap()
            .is_none());
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.data["event_type"], "order_filled");

        // A second pass is a no-op (idempotence under at-least-once).
        let report = f
            .manager
            .reconcile_account(&f.binding.account, MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(report.filled, 0);
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn reconcile_patches_placeholder_via_client_reference() {
        // Placement timed out locally but landed on the venue.
        let f = fixture().await;
        f.mock
            .script_create(Err(ExchangeError::Network("timed out".into())));
        let _ = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await;
        let row = &f
            .db
            .open_orders_for_user(f.user_id, &OpenOrderFilter::default())
            .await
            .unwrap()[0];
        let client_ref = row.client_order_id.clone().unwrap();

        // The venue knows it under a real id with our client reference.
        let request = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(0.5),
            price: Some(dec!(42000)),
            stop_price: None,
            client_order_id: Some(client_ref),
        };
        f.mock
            .open_orders
            .lock()
            .push(MockExchange::order("real-55", &request, OrderStatus::Open, Decimal::ZERO));

        let report = f
            .manager
            .reconcile_account(&f.binding.account, MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(report.patched_ids, 1);

        let patched = f
            .db
            .open_order_by_exchange_id("real-55")
            .await
            .unwrap()
            .unwrap();
        assert!(!patched.has_placeholder_id());
    }

    #[tokio::test]
    async fn reconcile_updates_partial_fill_progress() {
        let f = fixture().await;
        let placed = f
            .manager
            .create_order(&f.strategy, &f.binding, &limit_spec())
            .await
            .unwrap();

        // Exchange still lists it, 0.2 filled.
        let request = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(0.5),
            price: Some(dec!(42000)),
            stop_price: None,
            client_order_id: None,
        };
        f.mock.open_orders.lock().push(MockExchange::order(
            &placed.exchange_order_id,
            &request,
            OrderStatus::PartiallyFilled,
            dec!(0.2),
        ));

        let report = f
            .manager
            .reconcile_account(&f.binding.account, MarketType::Spot)
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        let row = f
            .db
            .open_order_by_exchange_id(&placed.exchange_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, OrderStatus::PartiallyFilled);
        assert_eq!(row.filled_quantity, dec!(0.2));
    }
}
