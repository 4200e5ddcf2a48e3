// ===============================
// src/book.rs
// ===============================
//
// Client-side order book: tracks our own working orders per price level, each
// level holding buy and sell queues in creation-time order, plus an id index.
// Market orders sit on a synthetic zero-price level.
//
// Owned by the trading thread only, hence Rc/RefCell.
//
use ahash::AHashMap as HashMap;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::domain::{InstrumentId, Order, OrderId};

pub type OrderRef = Rc<RefCell<Order>>;

/// (creation time, insertion seq): earliest first, seq breaks ties.
type QueueKey = (i128, u64);

fn queue_key(order: &Order) -> QueueKey { (order.state.created_ns, order.seq) }

#[derive(Debug, Default)]
pub struct PriceEntry {
    px: i64,
    buys: BTreeMap<QueueKey, OrderRef>,
    sells: BTreeMap<QueueKey, OrderRef>,
}

impl PriceEntry {
    pub fn new(px: i64) -> Self { Self { px, ..Default::default() } }

    pub fn px(&self) -> i64 { self.px }

    fn queue_mut(&mut self, buy: bool) -> &mut BTreeMap<QueueKey, OrderRef> {
        if buy { &mut self.buys } else { &mut self.sells }
    }

    pub fn add(&mut self, order: OrderRef) {
        let (buy, key) = {
            let o = order.borrow();
            (o.side.is_buy(), queue_key(&o))
        };
        self.queue_mut(buy).insert(key, order);
    }

    pub fn remove(&mut self, order: &Order) -> Option<OrderRef> {
        self.queue_mut(order.side.is_buy()).remove(&queue_key(order))
    }

    /// Buy queue, earliest first.
    pub fn buys(&self) -> impl Iterator<Item = &OrderRef> { self.buys.values() }

    /// Sell queue, earliest first.
    pub fn sells(&self) -> impl Iterator<Item = &OrderRef> { self.sells.values() }

    pub fn is_empty(&self) -> bool { self.buys.is_empty() && self.sells.is_empty() }

    pub fn len(&self) -> usize { self.buys.len() + self.sells.len() }

    fn outstanding(&self, buy: bool) -> i64 {
        let queue = if buy { &self.buys } else { &self.sells };
        queue.values().map(|o| o.borrow().pending_or_on_market()).sum()
    }
}

#[derive(Debug)]
pub struct OrderBook {
    instrument_id: InstrumentId,
    levels: BTreeMap<i64, PriceEntry>,
    market: PriceEntry,
    index: HashMap<OrderId, OrderRef>,
}

impl OrderBook {
    pub fn new(instrument_id: InstrumentId) -> Self {
        Self { instrument_id, levels: BTreeMap::new(), market: PriceEntry::new(0), index: HashMap::new() }
    }

    pub fn instrument_id(&self) -> InstrumentId { self.instrument_id }

    pub fn add(&mut self, order: OrderRef) {
        let (is_market, px, id) = {
            let o = order.borrow();
            (o.is_market(), o.state.px, o.order_id.clone())
        };
        if !id.is_empty() {
            self.index.insert(id, order.clone());
        }
        if is_market {
            self.market.add(order);
        } else {
            self.levels.entry(px).or_insert_with(|| PriceEntry::new(px)).add(order);
        }
    }

    /// Symmetric to `add`. The order's price must not have changed since it
    /// was added. Returns false if it was not in the book.
    pub fn remove(&mut self, order: &OrderRef) -> bool {
        let o = order.borrow();
        if !o.order_id.is_empty() {
            self.index.remove(&o.order_id);
        }
        if o.is_market() {
            return self.market.remove(&o).is_some();
        }
        let Some(level) = self.levels.get_mut(&o.state.px) else { return false };
        let removed = level.remove(&o).is_some();
        if level.is_empty() {
            self.levels.remove(&o.state.px);
        }
        removed
    }

    pub fn get(&self, order_id: &str) -> Option<OrderRef> { self.index.get(order_id).cloned() }

    pub fn level(&self, px: i64) -> Option<&PriceEntry> { self.levels.get(&px) }

    pub fn market_level(&self) -> &PriceEntry { &self.market }

    /// Orders resting at `px` on one side, time priority order.
    pub fn orders_at(&self, px: i64, buy: bool) -> Vec<OrderRef> {
        let level = if px == 0 { Some(&self.market) } else { self.levels.get(&px) };
        level
            .map(|l| if buy { l.buys().cloned().collect() } else { l.sells().cloned().collect() })
            .unwrap_or_default()
    }

    /// Full scan over every level, recomputed on each call.
    pub fn outstanding_buy_qty(&self) -> i64 { self.outstanding(true) }

    /// Full scan over every level, recomputed on each call.
    pub fn outstanding_sell_qty(&self) -> i64 { self.outstanding(false) }

    fn outstanding(&self, buy: bool) -> i64 {
        self.levels.values().map(|l| l.outstanding(buy)).sum::<i64>() + self.market.outstanding(buy)
    }

    /// Indexed orders only.
    pub fn len(&self) -> usize { self.index.len() }

    pub fn is_empty(&self) -> bool { self.index.is_empty() }

    pub fn level_count(&self) -> usize { self.levels.len() }
}
