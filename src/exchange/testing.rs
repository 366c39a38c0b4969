// =============================================================================
// Scriptable mock exchange for lifecycle tests
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    Balance, BatchEntryResult, BatchImplementation, BatchResult, MarketInfo, MarketType, Order,
    OrderRequest, OrderStatus, PriceQuote,
};

use super::{AdapterSource, ExchangeAdapter, ExchangeTrade};
use crate::db::AccountRow;

/// A mock venue driven by scripted responses. Every call is recorded.
pub struct MockExchange {
    pub market_type: MarketType,
    /// Scripted outcomes for successive `create_order` calls; when empty, a
    /// plain OPEN order echoing the request is fabricated.
    create_results: Mutex<VecDeque<ExchangeResult<Order>>>,
    /// Scripted outcomes for `cancel_order`, keyed FIFO.
    cancel_results: Mutex<VecDeque<ExchangeResult<Order>>>,
    pub open_orders: Mutex<Vec<Order>>,
    pub recent_trades: Mutex<Vec<ExchangeTrade>>,
    pub created: Mutex<Vec<OrderRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    next_id: Mutex<u64>,
}

impl MockExchange {
    pub fn new(market_type: MarketType) -> Self {
        Self {
            market_type,
            create_results: Mutex::new(VecDeque::new()),
            cancel_results: Mutex::new(VecDeque::new()),
            open_orders: Mutex::new(Vec::new()),
            recent_trades: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            next_id: Mutex::new(1000),
        }
    }

    pub fn script_create(&self, result: ExchangeResult<Order>) {
        self.create_results.lock().push_back(result);
    }

    pub fn script_cancel(&self, result: ExchangeResult<Order>) {
        self.cancel_results.lock().push_back(result);
    }

    pub fn order(id: &str, request: &OrderRequest, status: OrderStatus, filled: Decimal) -> Order {
        Order {
            order_id: id.to_string(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status,
            price: request.price,
            stop_price: request.stop_price,
            quantity: request.quantity,
            filled_quantity: filled,
            average_price: None,
            timestamp: Utc::now(),
        }
    }

    fn default_market() -> MarketInfo {
        MarketInfo {
            symbol: "BTC/USDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            step_size: dec!(0.00001),
            tick_size: dec!(0.01),
            min_qty: dec!(0.00001),
            min_notional: Decimal::ZERO,
            max_qty: None,
            active: true,
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn exchange_name(&self) -> &'static str {
        "mock"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    async fn load_markets(&self, _reload: bool) -> ExchangeResult<HashMap<String, MarketInfo>> {
        let mut markets = HashMap::new();
        let btc = Self::default_market();
        markets.insert(btc.symbol.clone(), btc);
        let eth = MarketInfo {
            symbol: "ETH/USDT".into(),
            base: "ETH".into(),
            quote: "USDT".into(),
            ..Self::default_market()
        };
        markets.insert(eth.symbol.clone(), eth);
        Ok(markets)
    }

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>> {
        Ok(HashMap::new())
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        self.created.lock().push(request.clone());
        if let Some(result) = self.create_results.lock().pop_front() {
            return result;
        }
        let mut next = self.next_id.lock();
        *next += 1;
        Ok(Self::order(
            &next.to_string(),
            request,
            OrderStatus::Open,
            Decimal::ZERO,
        ))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: Option<&str>) -> ExchangeResult<Order> {
        self.cancelled.lock().push(order_id.to_string());
        if let Some(result) = self.cancel_results.lock().pop_front() {
            return result;
        }
        let mut orders = self.open_orders.lock();
        match orders.iter().position(|o| o.order_id == order_id) {
            Some(index) => {
                let mut order = orders.remove(index);
                order.status = OrderStatus::Canceled;
                Ok(order)
            }
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn fetch_order(&self, order_id: &str, _symbol: Option<&str>) -> ExchangeResult<Order> {
        self.open_orders
            .lock()
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<Order>> {
        Ok(self
            .open_orders
            .lock()
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn fetch_recent_trades(
        &self,
        symbol: Option<&str>,
        _limit: usize,
    ) -> ExchangeResult<Vec<ExchangeTrade>> {
        Ok(self
            .recent_trades
            .lock()
            .iter()
            .filter(|t| symbol.map_or(true, |s| t.symbol == s))
            .cloned()
            .collect())
    }

    async fn fetch_quote(&self, symbol: &str) -> ExchangeResult<PriceQuote> {
        Ok(PriceQuote {
            symbol: symbol.to_string(),
            last: dec!(42000),
            bid: Some(dec!(41999)),
            ask: Some(dec!(42001)),
            volume: dec!(100),
            ts: Utc::now(),
        })
    }

    async fn create_batch_orders(&self, requests: &[OrderRequest]) -> ExchangeResult<BatchResult> {
        let mut results = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            match self.create_order(request).await {
                Ok(order) => results.push(BatchEntryResult {
                    order_index: index,
                    success: true,
                    order_id: Some(order.order_id.clone()),
                    order: Some(order),
                    error: None,
                }),
                Err(e) => results.push(BatchEntryResult {
                    order_index: index,
                    success: false,
                    order_id: None,
                    order: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(BatchResult::from_entries(
            results,
            BatchImplementation::SequentialFallback,
        ))
    }

    fn to_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String> {
        Ok(symbol.replace('/', ""))
    }

    fn from_exchange_symbol(&self, symbol: &str) -> ExchangeResult<String> {
        if symbol.contains('/') {
            Ok(symbol.to_string())
        } else if let Some(base) = symbol.strip_suffix("USDT") {
            Ok(format!("{base}/USDT"))
        } else {
            Ok(symbol.to_string())
        }
    }
}

/// AdapterSource that always returns the same mock instance.
pub struct MockSource {
    pub mock: Arc<MockExchange>,
}

#[async_trait]
impl AdapterSource for MockSource {
    async fn adapter_for(
        &self,
        _account: &AccountRow,
        _market_type: MarketType,
    ) -> ExchangeResult<Arc<dyn ExchangeAdapter>> {
        Ok(self.mock.clone())
    }
}
