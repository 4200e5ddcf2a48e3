// ===============================
// src/strategy.rs
// ===============================
//
// Algos run on the trading thread: they see market data and order status for
// their instrument and hand back order requests for the core to batch.
//
// Built-in:
// - mean_reversion : buy below rolling mean - edge, sell above mean + edge
// - none           : no algo for the instrument
//
use ahash::AHashSet as HashSet;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

use crate::domain::{
    FieldKind, Instrument, MarketData, OrderId, OrderRequest, OrderStatusEvent, OrderType, PortfolioId, Side,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("unknown strategy {0}")]
    UnknownStrategy(String),
}

pub trait Algo {
    fn name(&self) -> &'static str;

    fn on_market_data(&mut self, md: &MarketData) -> Vec<OrderRequest>;

    /// Orders created from the requests returned by the last `on_market_data`.
    /// Requests the filter vetoed or the manager rejected are absent.
    fn on_orders_created(&mut self, _order_ids: &[OrderId]) {}

    /// Status of any order on this algo's instrument; `alive` is the order's
    /// state after the status was applied.
    fn on_order_status(&mut self, _ev: &OrderStatusEvent, _alive: bool) {}
}

fn mid_price(bid: i64, ask: i64) -> i64 { (bid + ask) / 2 }

// -----------------------------------------------------------------------------
// MEAN-REVERSION
//   ask < mean(N mids) - edge  -> Buy at ask
//   bid > mean(N mids) + edge  -> Sell at bid
//   Works in ranging markets, fights strong trends (the limits filter guards it).
// -----------------------------------------------------------------------------
pub struct MeanReversion {
    portfolio_id: PortfolioId,
    window: VecDeque<i64>,
    sum: i64,
    edge: i64,
    w: usize,
    qty: i64,
    max_working: usize,
    owned: HashSet<OrderId>,
}

impl MeanReversion {
    pub fn new(portfolio_id: PortfolioId, w: usize, edge: i64, qty: i64, max_working: usize) -> Self {
        Self {
            portfolio_id,
            window: VecDeque::with_capacity(w),
            sum: 0,
            edge,
            w: w.max(1),
            qty,
            max_working,
            owned: HashSet::new(),
        }
    }

    fn fair(&self) -> Option<i64> {
        if self.window.len() >= self.w { Some(self.sum / self.w as i64) } else { None }
    }

    /// Live orders created by this algo.
    pub fn working(&self) -> usize { self.owned.len() }
}

impl Algo for MeanReversion {
    fn name(&self) -> &'static str { "mean_reversion" }

    fn on_market_data(&mut self, md: &MarketData) -> Vec<OrderRequest> {
        let (Some(bid), Some(ask)) = (md.field(FieldKind::Bid), md.field(FieldKind::Ask)) else {
            return Vec::new();
        };
        if self.window.len() == self.w {
            if let Some(x) = self.window.pop_front() {
                self.sum -= x;
            }
        }
        let mid = mid_price(bid, ask);
        self.window.push_back(mid);
        self.sum += mid;

        let Some(fair) = self.fair() else { return Vec::new() };
        if self.owned.len() >= self.max_working {
            return Vec::new();
        }
        let order = if ask < fair - self.edge {
            Some((Side::Buy, ask))
        } else if bid > fair + self.edge {
            Some((Side::Sell, bid))
        } else {
            None
        };
        match order {
            Some((side, px)) => {
                debug!(instrument_id = md.instrument_id, ?side, px, fair, "mean reversion signal");
                vec![OrderRequest::create(self.portfolio_id, side, OrderType::Limit, px, self.qty)]
            }
            None => Vec::new(),
        }
    }

    fn on_orders_created(&mut self, order_ids: &[OrderId]) { self.owned.extend(order_ids.iter().cloned()); }

    fn on_order_status(&mut self, ev: &OrderStatusEvent, alive: bool) {
        if !alive && self.owned.remove(&ev.order_id) {
            debug!(order_id = %ev.order_id, status = ?ev.status, working = self.owned.len(), "algo order done");
        }
    }
}

/// Name -> constructor. `None` for "none".
pub fn build(
    name: &str,
    instrument: &Instrument,
    portfolio_id: PortfolioId,
) -> Result<Option<Box<dyn Algo>>, StrategyError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "mean_reversion" | "meanreversion" | "mr" => {
            debug!(symbol = %instrument.symbol, "algo mean_reversion");
            // window 64, edge 3 ticks, 10 lots, 4 orders in flight
            Ok(Some(Box::new(MeanReversion::new(portfolio_id, 64, 3, 10, 4))))
        }
        "none" | "" => Ok(None),
        other => Err(StrategyError::UnknownStrategy(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MdField, OrderStatus};

    fn quote(bid: i64, ask: i64) -> MarketData {
        MarketData {
            instrument_id: 1,
            ts_ns: 0,
            fields: vec![MdField { kind: FieldKind::Bid, value: bid }, MdField { kind: FieldKind::Ask, value: ask }],
        }
    }

    fn status(order_id: &str, status: OrderStatus) -> OrderStatusEvent {
        OrderStatusEvent {
            order_id: order_id.into(),
            algo_id: 0,
            status,
            exchange_id: None,
            last_px: 0,
            exec_qty: 0,
            ts_ns: 0,
        }
    }

    #[test]
    fn waits_for_full_window() {
        let mut mr = MeanReversion::new(1, 3, 1, 10, 4);
        assert!(mr.on_market_data(&quote(100, 102)).is_empty());
        assert!(mr.on_market_data(&quote(100, 102)).is_empty());
    }

    #[test]
    fn buys_below_mean_and_sells_above() {
        let mut mr = MeanReversion::new(9, 2, 1, 10, 4);
        mr.on_market_data(&quote(100, 102));
        // mids 101, 91 -> fair 96, ask 92 < 95
        let reqs = mr.on_market_data(&quote(90, 92));
        assert_eq!(reqs.len(), 1);
        assert_eq!((reqs[0].side, reqs[0].px, reqs[0].qty, reqs[0].portfolio_id), (Side::Buy, 92, 10, 9));

        // mids 91, 121 -> fair 106, bid 120 > 107
        let reqs = mr.on_market_data(&quote(120, 122));
        assert_eq!((reqs[0].side, reqs[0].px), (Side::Sell, 120));
    }

    #[test]
    fn working_cap_holds_until_orders_finish() {
        let mut mr = MeanReversion::new(1, 1, 0, 1, 1);
        // window of one: fair == mid, so a wide ask never trades; use a crossed quote
        assert_eq!(mr.on_market_data(&quote(110, 90)).len(), 1);
        mr.on_orders_created(&["T-1".to_string()]);
        assert!(mr.on_market_data(&quote(110, 90)).is_empty());
        mr.on_order_status(&status("T-1", OrderStatus::New), true);
        assert!(mr.on_market_data(&quote(110, 90)).is_empty());
        mr.on_order_status(&status("T-1", OrderStatus::Filled), false);
        assert_eq!(mr.working(), 0);
        assert_eq!(mr.on_market_data(&quote(110, 90)).len(), 1);
    }

    #[test]
    fn request_that_created_no_order_holds_no_slot() {
        let mut mr = MeanReversion::new(1, 1, 0, 1, 1);
        assert_eq!(mr.on_market_data(&quote(110, 90)).len(), 1);
        // vetoed downstream
        mr.on_orders_created(&[]);
        assert_eq!(mr.working(), 0);
        assert_eq!(mr.on_market_data(&quote(110, 90)).len(), 1);
    }

    #[test]
    fn only_own_dead_orders_free_slots() {
        let mut mr = MeanReversion::new(1, 1, 0, 1, 1);
        mr.on_market_data(&quote(110, 90));
        mr.on_orders_created(&["T-1".to_string()]);

        // somebody else's order finishing
        mr.on_order_status(&status("T-9", OrderStatus::Filled), false);
        assert_eq!(mr.working(), 1);
        assert!(mr.on_market_data(&quote(110, 90)).is_empty());

        // last partial fill: the status kind is not Filled but the order is gone
        mr.on_order_status(&status("T-1", OrderStatus::PartiallyFilled), false);
        assert_eq!(mr.working(), 0);
    }

    #[test]
    fn missing_quote_side_is_ignored() {
        let mut mr = MeanReversion::new(1, 1, 0, 1, 1);
        let md = MarketData { instrument_id: 1, ts_ns: 0, fields: vec![MdField { kind: FieldKind::Bid, value: 1 }] };
        assert!(mr.on_market_data(&md).is_empty());
    }

    #[test]
    fn build_by_name() {
        let inst = Instrument { id: 1, market_id: 1, symbol: "BTCUSDT".into(), multiplier: 1.0 };
        assert!(build("mean_reversion", &inst, 1).unwrap().is_some());
        assert!(build("none", &inst, 1).unwrap().is_none());
        let err = build("ma_crossover", &inst, 1).err().unwrap();
        assert_eq!(err, StrategyError::UnknownStrategy("ma_crossover".into()));
        assert_eq!(err.to_string(), "unknown strategy ma_crossover");
    }
}
