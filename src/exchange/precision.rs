// =============================================================================
// Precision & symbol registry — deterministic floor-rounding of order fields
// =============================================================================
//
// Two regimes feed the same rounding code: API-based venues (Binance) cache
// live market metadata, rule-based venues (Upbit/Bithumb/KIS KRW) derive the
// tick from a price-band table.  Rounding is always floor — an order may end
// up slightly smaller than requested, never larger.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{MarketInfo, OrderRequest, OrderType};

/// How long a loaded markets map stays fresh.
pub const MARKETS_TTL: Duration = Duration::from_secs(300);

/// Factor applied to the minimum when auto-adjust bumps an undersized order.
const AUTO_ADJUST_FACTOR: Decimal = dec!(2);

// ---------------------------------------------------------------------------
// Floor rounding
// ---------------------------------------------------------------------------

/// Floor `value` to an integral multiple of `step`. For all `q, step > 0`:
/// `0 <= q - floor_to_step(q, step) < step`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).floor();
    (steps * step).normalize()
}

/// Upbit/Bithumb KRW price-band tick table. Rule-based venues have no
/// per-symbol precision API; the tick follows the quoted price.
pub fn krw_tick_size(price: Decimal) -> Decimal {
    if price >= dec!(2000000) {
        dec!(1000)
    } else if price >= dec!(1000000) {
        dec!(500)
    } else if price >= dec!(500000) {
        dec!(100)
    } else if price >= dec!(100000) {
        dec!(50)
    } else if price >= dec!(10000) {
        dec!(10)
    } else if price >= dec!(1000) {
        dec!(1)
    } else if price >= dec!(100) {
        dec!(0.1)
    } else if price >= dec!(10) {
        dec!(0.01)
    } else if price >= dec!(1) {
        dec!(0.001)
    } else {
        dec!(0.0001)
    }
}

// ---------------------------------------------------------------------------
// Order preprocessing
// ---------------------------------------------------------------------------

/// Order fields after precision preprocessing.
#[derive(Debug, Clone)]
pub struct PreparedOrder {
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Human-readable description when auto-adjust changed the quantity.
    /// Clamping is a caller-visible concern, never hidden.
    pub adjustment: Option<String>,
}

/// Validate and floor an order against its market. With `auto_adjust`, a
/// below-minimum quantity is scaled to twice the minimum (floored to step)
/// instead of rejected.
pub fn prepare_order(
    request: &OrderRequest,
    market: &MarketInfo,
    reference_price: Option<Decimal>,
    auto_adjust: bool,
) -> ExchangeResult<PreparedOrder> {
    if !market.active {
        return Err(ExchangeError::Validation(format!(
            "market {} is not active",
            market.symbol
        )));
    }
    if request.quantity <= Decimal::ZERO {
        return Err(ExchangeError::Validation(format!(
            "quantity must be positive, got {}",
            request.quantity
        )));
    }
    if request.order_type.requires_price() && request.price.is_none() {
        return Err(ExchangeError::Validation(format!(
            "{} order requires a price",
            request.order_type
        )));
    }
    if request.order_type.requires_stop_price() && request.stop_price.is_none() {
        return Err(ExchangeError::Validation(format!(
            "{} order requires a stop price",
            request.order_type
        )));
    }

    let price = request.price.map(|p| floor_to_step(p, market.tick_size));
    let stop_price = request
        .stop_price
        .map(|p| floor_to_step(p, market.tick_size));
    let mut quantity = floor_to_step(request.quantity, market.step_size);
    let mut adjustment = None;

    // The notional check needs some price; MARKET orders fall back to the
    // caller-provided reference quote.
    let effective_price = price.or(reference_price);

    let below_min_qty = quantity < market.min_qty;
    let below_notional = match effective_price {
        Some(p) if market.min_notional > Decimal::ZERO => quantity * p < market.min_notional,
        _ => false,
    };

    if below_min_qty || below_notional {
        if !auto_adjust {
            return Err(ExchangeError::MinNotional(format!(
                "quantity {} below minimum for {} (min_qty {}, min_notional {})",
                quantity, market.symbol, market.min_qty, market.min_notional
            )));
        }

        // Scale to 2x whichever minimum binds, then floor back to step.
        let qty_floor = market.min_qty;
        let notional_floor = match effective_price {
            Some(p) if p > Decimal::ZERO => market.min_notional / p,
            _ => Decimal::ZERO,
        };
        let target = qty_floor.max(notional_floor) * AUTO_ADJUST_FACTOR;
        let adjusted = floor_to_step(target, market.step_size).max(market.min_qty);

        adjustment = Some(format!(
            "quantity adjusted {} -> {} to satisfy exchange minimums",
            quantity, adjusted
        ));
        quantity = adjusted;
    }

    if let Some(max_qty) = market.max_qty {
        if quantity > max_qty {
            return Err(ExchangeError::Validation(format!(
                "quantity {} exceeds market maximum {}",
                quantity, max_qty
            )));
        }
    }

    Ok(PreparedOrder {
        quantity,
        price,
        stop_price,
        adjustment,
    })
}

// ---------------------------------------------------------------------------
// Markets cache
// ---------------------------------------------------------------------------

/// Per-adapter TTL cache of the normalized markets map.
pub struct MarketCache {
    inner: RwLock<Option<(HashMap<String, MarketInfo>, Instant)>>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<HashMap<String, MarketInfo>> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some((markets, loaded_at)) if loaded_at.elapsed() < MARKETS_TTL => {
                Some(markets.clone())
            }
            _ => None,
        }
    }

    pub fn put(&self, markets: HashMap<String, MarketInfo>) {
        *self.inner.write() = Some((markets, Instant::now()));
    }

    /// Resolve a canonical symbol from the cache, trying slash insertion and
    /// a prioritized quote list before giving up.
    pub fn resolve_symbol(&self, raw: &str) -> Option<String> {
        let guard = self.inner.read();
        let (markets, _) = guard.as_ref()?;

        if markets.contains_key(raw) {
            return Some(raw.to_string());
        }

        // Slash removal: `BTC/USDT` handed to an exchange-format lookup.
        let squashed = raw.replace('/', "");
        if markets.contains_key(&squashed) {
            return Some(squashed);
        }

        // Slash insertion against a prioritized quote list.
        const QUOTES: &[&str] = &["USDT", "KRW", "BTC", "USDC", "ETH"];
        for quote in QUOTES {
            if let Some(base) = squashed.strip_suffix(quote) {
                if base.is_empty() {
                    continue;
                }
                let candidate = format!("{base}/{quote}");
                if markets.contains_key(&candidate) {
                    return Some(candidate);
                }
            }
        }

        None
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;

    fn market(step: Decimal, tick: Decimal, min_qty: Decimal, min_notional: Decimal) -> MarketInfo {
        MarketInfo {
            symbol: "BTC/USDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            step_size: step,
            tick_size: tick,
            min_qty,
            min_notional,
            max_qty: None,
            active: true,
        }
    }

    fn limit_request(quantity: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            client_order_id: None,
        }
    }

    #[test]
    fn floor_never_rounds_up() {
        let step = dec!(0.00001);
        for raw in [dec!(0.040000001), dec!(0.04), dec!(0.0399999999)] {
            let floored = floor_to_step(raw, step);
            assert!(floored <= raw);
            assert!(raw - floored < step);
        }
        assert_eq!(floor_to_step(dec!(0.049999), dec!(0.001)), dec!(0.049));
    }

    #[test]
    fn step_boundary_stays_exact() {
        // q = k*step + eps floors to k*step.
        assert_eq!(floor_to_step(dec!(0.0200003), dec!(0.00001)), dec!(0.02));
        assert_eq!(floor_to_step(dec!(0.02), dec!(0.00001)), dec!(0.02));
    }

    #[test]
    fn krw_tick_bands() {
        assert_eq!(krw_tick_size(dec!(2500000)), dec!(1000));
        assert_eq!(krw_tick_size(dec!(750000)), dec!(100));
        assert_eq!(krw_tick_size(dec!(55000)), dec!(10));
        assert_eq!(krw_tick_size(dec!(0.5)), dec!(0.0001));
    }

    #[test]
    fn quantity_at_exact_minimum_is_accepted() {
        let m = market(dec!(0.001), dec!(0.01), dec!(0.001), Decimal::ZERO);
        let prepared = prepare_order(&limit_request(dec!(0.001), dec!(100)), &m, None, false)
            .unwrap();
        assert_eq!(prepared.quantity, dec!(0.001));
        assert!(prepared.adjustment.is_none());
    }

    #[test]
    fn below_minimum_without_auto_adjust_rejects() {
        let m = market(dec!(0.001), dec!(0.01), dec!(0.01), Decimal::ZERO);
        let err = prepare_order(&limit_request(dec!(0.005), dec!(100)), &m, None, false)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MinNotional(_)));
    }

    #[test]
    fn auto_adjust_scales_to_twice_the_minimum() {
        let m = market(dec!(0.001), dec!(0.01), dec!(0.01), Decimal::ZERO);
        let prepared = prepare_order(&limit_request(dec!(0.009), dec!(100)), &m, None, true)
            .unwrap();
        assert_eq!(prepared.quantity, dec!(0.02));
        assert!(prepared.adjustment.is_some());
    }

    #[test]
    fn min_notional_uses_reference_price_for_market_orders() {
        let m = market(dec!(0.00001), dec!(0.01), dec!(0.00001), dec!(10));
        let request = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.0001),
            price: None,
            stop_price: None,
            client_order_id: None,
        };
        // 0.0001 * 50000 = 5 < 10 -> rejected without auto-adjust.
        let err = prepare_order(&request, &m, Some(dec!(50000)), false).unwrap_err();
        assert!(matches!(err, ExchangeError::MinNotional(_)));

        let prepared = prepare_order(&request, &m, Some(dec!(50000)), true).unwrap();
        // 2 * (10 / 50000) = 0.0004
        assert_eq!(prepared.quantity, dec!(0.0004));
    }

    #[test]
    fn missing_price_on_limit_is_a_validation_error() {
        let m = market(dec!(0.001), dec!(0.01), dec!(0.001), Decimal::ZERO);
        let request = OrderRequest {
            price: None,
            ..limit_request(dec!(1), dec!(100))
        };
        assert!(matches!(
            prepare_order(&request, &m, None, false),
            Err(ExchangeError::Validation(_))
        ));
    }

    #[test]
    fn cache_resolves_squashed_symbols() {
        let cache = MarketCache::new();
        let mut markets = HashMap::new();
        markets.insert(
            "BTC/USDT".to_string(),
            market(dec!(0.001), dec!(0.01), dec!(0.001), Decimal::ZERO),
        );
        cache.put(markets);

        assert_eq!(cache.resolve_symbol("BTC/USDT").unwrap(), "BTC/USDT");
        assert_eq!(cache.resolve_symbol("BTCUSDT").unwrap(), "BTC/USDT");
        assert!(cache.resolve_symbol("DOGE/KRW").is_none());
    }
}
