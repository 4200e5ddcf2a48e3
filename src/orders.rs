// ===============================
// src/orders.rs
// ===============================
//
// Per-instrument order manager. Requests are queued with `add` and applied in
// one `process` batch: valid requests become new/updated orders and exactly one
// send event per non-empty batch, invalid ones go to reject handling, and the
// pending list is always cleared.
//
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::EventAggregator;
use crate::book::{OrderBook, OrderRef};
use crate::clock::Clock;
use crate::domain::{
    Event, Instrument, Order, OrderId, OrderRejectEvent, OrderRequest, OrderSendEvent, OrderStatus,
    OrderStatusEvent, RejectReason, RequestType, Trade,
};
use crate::filter::Filter;
use crate::metrics::{EXECS, ORDERS_SENT, ORDER_BATCHES, REJECTS};

/// Unique order ids shared by every manager of the engine.
#[derive(Debug)]
pub struct OrderIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl OrderIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self { Self { prefix: prefix.into(), next: AtomicU64::new(1) } }

    /// New id plus its sequence number (used as the book insertion seq).
    pub fn next_id(&self) -> (OrderId, u64) {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        (format!("{}-{}", self.prefix, n), n)
    }
}

/// Applies a request's fields to an order.
pub struct OrderStateManager;

impl OrderStateManager {
    pub fn new_request(order: &mut Order, req: &OrderRequest) {
        order.state.alive = true;
        order.state.pending = true;
        if req.request_type != RequestType::Cancel {
            order.state.px = req.px;
            // quantity only grows
            if req.qty > order.state.qty {
                order.state.qty = req.qty;
            }
        }
        order.state.entry = Some(req.entry());
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub sent: usize,
    pub filtered: usize,
    pub rejected: usize,
    /// Ids of the orders this batch created, in request order.
    pub created: Vec<OrderId>,
}

/// Result of applying a gateway status to this manager's book.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// The order id is not tracked here.
    Unknown,
    Updated,
    Fill(Trade),
}

pub struct OrderManager {
    instrument: Instrument,
    book: OrderBook,
    filter: Box<dyn Filter>,
    ids: Arc<OrderIdGenerator>,
    clock: Arc<dyn Clock>,
    pending: Vec<OrderRequest>,
}

impl OrderManager {
    pub fn new(
        instrument: Instrument,
        filter: Box<dyn Filter>,
        ids: Arc<OrderIdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let book = OrderBook::new(instrument.id);
        Self { instrument, book, filter, ids, clock, pending: Vec::new() }
    }

    pub fn instrument(&self) -> &Instrument { &self.instrument }

    pub fn book(&self) -> &OrderBook { &self.book }

    pub fn book_mut(&mut self) -> &mut OrderBook { &mut self.book }

    pub fn pending(&self) -> usize { self.pending.len() }

    /// Queue a request; nothing is validated here.
    pub fn add(&mut self, req: OrderRequest) { self.pending.push(req); }

    pub fn process(&mut self, bus: &EventAggregator) -> ProcessSummary {
        // taking the list is the "clear" step: it happens whatever the outcome
        let mut pending = std::mem::take(&mut self.pending);
        let mut summary = ProcessSummary::default();

        // 1) apply valid requests
        let mut batch: Vec<Order> = Vec::new();
        for req in pending.iter_mut().filter(|r| r.valid) {
            req.instrument_id = self.instrument.id;
            req.market_id = self.instrument.market_id;

            if matches!(req.request_type, RequestType::Create | RequestType::Amend) && !self.filter.check(req) {
                summary.filtered += 1;
                continue;
            }

            let order = match req.request_type {
                RequestType::Create => {
                    let order = self.create(req);
                    summary.created.push(order.borrow().order_id.clone());
                    order
                }
                RequestType::Amend | RequestType::Cancel => match self.modify(req) {
                    Some(o) => o,
                    None => continue,
                },
            };
            batch.push(order.borrow().clone());
        }

        if !batch.is_empty() {
            summary.sent = batch.len();
            ORDER_BATCHES.inc();
            ORDERS_SENT.inc_by(batch.len() as u64);
            debug!(instrument_id = self.instrument.id, orders = batch.len(), "order batch out");
            bus.publish(&Event::OrderSend(OrderSendEvent { instrument_id: self.instrument.id, orders: batch }));
        }

        // 2) process rejects
        for req in pending.into_iter().filter(|r| !r.valid) {
            summary.rejected += 1;
            self.on_reject(req, bus);
        }
        summary
    }

    fn create(&mut self, req: &OrderRequest) -> OrderRef {
        let (order_id, seq) = self.ids.next_id();
        let mut order = Order::from_request(order_id, seq, self.clock.now_ns(), req);
        OrderStateManager::new_request(&mut order, req);
        let order = Rc::new(RefCell::new(order));
        self.book.add(order.clone());
        order
    }

    fn modify(&mut self, req: &mut OrderRequest) -> Option<OrderRef> {
        let target = req.dependent_order_id.as_deref().and_then(|id| self.book.get(id));
        let Some(order) = target else {
            req.reject(RejectReason::DependantOrder);
            warn!(
                instrument_id = self.instrument.id,
                dependent_order_id = ?req.dependent_order_id,
                request = ?req.request_type,
                reason = ?RejectReason::DependantOrder,
                "target order not found"
            );
            return None;
        };

        if req.request_type == RequestType::Amend && order.borrow().is_market() {
            req.reject(RejectReason::InvalidAmend);
            warn!(order_id = %order.borrow().order_id, reason = ?RejectReason::InvalidAmend, "market orders cannot be amended");
            return None;
        }

        // re-level the order if the amend moves its price
        let reprice = req.request_type == RequestType::Amend && order.borrow().state.px != req.px;
        if reprice {
            self.book.remove(&order);
        }
        OrderStateManager::new_request(&mut order.borrow_mut(), req);
        if reprice {
            self.book.add(order.clone());
        }
        Some(order)
    }

    fn on_reject(&self, req: OrderRequest, bus: &EventAggregator) {
        let reason = req.reject_reason.unwrap_or(RejectReason::Unknown);
        warn!(
            instrument_id = self.instrument.id,
            request = ?req.request_type,
            dependent_order_id = ?req.dependent_order_id,
            reason = ?reason,
            "order request rejected"
        );
        REJECTS.with_label_values(&[reason.label()]).inc();
        bus.publish(&Event::OrderReject(OrderRejectEvent { instrument_id: self.instrument.id, request: req }));
    }

    /// Apply a gateway acknowledgement. Dead orders leave the book here.
    pub fn on_status(&mut self, ev: &OrderStatusEvent) -> StatusOutcome {
        let Some(order) = self.book.get(&ev.order_id) else { return StatusOutcome::Unknown };

        let outcome = {
            let mut o = order.borrow_mut();
            o.state.pending = false;
            if ev.exchange_id.is_some() {
                o.exchange_id = ev.exchange_id.clone();
            }
            match ev.status {
                OrderStatus::New => StatusOutcome::Updated,
                OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                    o.state.filled_qty += ev.exec_qty;
                    if ev.status == OrderStatus::Filled || o.state.filled_qty >= o.state.qty {
                        o.state.alive = false;
                    }
                    StatusOutcome::Fill(Trade {
                        instrument_id: o.instrument_id,
                        portfolio_id: o.portfolio_id,
                        order_id: o.order_id.clone(),
                        px: ev.last_px,
                        qty: o.side.sign() * ev.exec_qty,
                        ts_ns: ev.ts_ns,
                    })
                }
                OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::NoExchange => {
                    o.state.alive = false;
                    StatusOutcome::Updated
                }
            }
        };
        EXECS.with_label_values(&[status_label(ev.status)]).inc();

        if !order.borrow().state.alive {
            self.book.remove(&order);
            info!(order_id = %ev.order_id, status = ?ev.status, "order done");
        }
        outcome
    }
}

fn status_label(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::New => "new",
        OrderStatus::PartiallyFilled => "partial",
        OrderStatus::Filled => "filled",
        OrderStatus::Cancelled => "cancelled",
        OrderStatus::Rejected => "rejected",
        OrderStatus::NoExchange => "no_exchange",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{EventKind, OrderType, Side};
    use crate::filter::AcceptAll;
    use parking_lot::Mutex;

    struct Veto;
    impl Filter for Veto {
        fn check(&mut self, _req: &OrderRequest) -> bool { false }
    }

    fn instrument() -> Instrument {
        Instrument { id: 3, market_id: 9, symbol: "BTCUSDT".into(), multiplier: 1.0 }
    }

    fn manager(filter: Box<dyn Filter>) -> OrderManager {
        OrderManager::new(
            instrument(),
            filter,
            Arc::new(OrderIdGenerator::new("T")),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    /// Bus that records everything published on it.
    fn recording_bus() -> (EventAggregator, Arc<Mutex<Vec<Event>>>) {
        let bus = EventAggregator::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::OrderSend, EventKind::OrderReject] {
            let s = seen.clone();
            bus.subscribe(kind, move |ev| s.lock().push(ev.clone()));
        }
        (bus, seen)
    }

    fn sends(seen: &[Event]) -> Vec<&OrderSendEvent> {
        seen.iter().filter_map(|e| if let Event::OrderSend(s) = e { Some(s) } else { None }).collect()
    }

    fn rejects(seen: &[Event]) -> Vec<&OrderRejectEvent> {
        seen.iter().filter_map(|e| if let Event::OrderReject(r) = e { Some(r) } else { None }).collect()
    }

    fn buy(px: i64, qty: i64) -> OrderRequest { OrderRequest::create(1, Side::Buy, OrderType::Limit, px, qty) }

    fn place(m: &mut OrderManager, bus: &EventAggregator, px: i64, qty: i64) -> String {
        m.add(buy(px, qty));
        m.process(bus);
        let id = m.book().orders_at(px, true).last().unwrap().borrow().order_id.clone();
        id
    }

    #[test]
    fn one_bad_request_does_not_spoil_the_batch() {
        let (bus, seen) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));

        let mut bad = buy(100, 1);
        bad.reject(RejectReason::Unknown);
        m.add(buy(100, 10));
        m.add(bad);

        let summary = m.process(&bus);
        assert_eq!((summary.sent, summary.filtered, summary.rejected), (1, 0, 1));
        assert_eq!(summary.created, vec!["T-1".to_string()]);
        assert_eq!(m.book().len(), 1);
        assert_eq!(m.pending(), 0);

        let seen = seen.lock();
        let sends = sends(&seen);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].orders.len(), 1);
        assert_eq!(sends[0].orders[0].instrument_id, 3);
        assert_eq!(sends[0].orders[0].market_id, 9);
        assert_eq!(rejects(&seen).len(), 1);
    }

    #[test]
    fn batch_produces_single_send_event() {
        let (bus, seen) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        for px in [100, 101, 102] {
            m.add(buy(px, 1));
        }
        m.process(&bus);
        let seen = seen.lock();
        assert_eq!(sends(&seen).len(), 1);
        assert_eq!(sends(&seen)[0].orders.len(), 3);
    }

    #[test]
    fn empty_batch_publishes_nothing() {
        let (bus, seen) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        assert_eq!(m.process(&bus), ProcessSummary::default());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn missing_dependant_order_is_rejected_and_batch_continues() {
        let (bus, seen) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        m.add(OrderRequest::amend(1, "T-404", Side::Buy, 100, 5));
        m.add(buy(100, 2));

        let summary = m.process(&bus);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.rejected, 1);
        // the amend created nothing
        assert_eq!(summary.created.len(), 1);

        let seen = seen.lock();
        let rej = rejects(&seen);
        assert_eq!(rej[0].request.reject_reason, Some(RejectReason::DependantOrder));
        assert!(!rej[0].request.valid);
        assert_eq!(rej[0].request.instrument_id, 3);
    }

    #[test]
    fn amend_raises_but_never_lowers_quantity() {
        let (bus, _) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        let id = place(&mut m, &bus, 100, 10);

        m.add(OrderRequest::amend(1, &id, Side::Buy, 101, 5));
        m.process(&bus);
        let o = m.book().get(&id).unwrap();
        assert_eq!(o.borrow().state.qty, 10);
        assert_eq!(o.borrow().state.px, 101);

        m.add(OrderRequest::amend(1, &id, Side::Buy, 99, 15));
        m.process(&bus);
        assert_eq!(o.borrow().state.qty, 15);
        assert_eq!(o.borrow().state.px, 99);
    }

    #[test]
    fn amend_moves_order_to_new_price_level() {
        let (bus, _) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        let id = place(&mut m, &bus, 100, 10);
        m.add(OrderRequest::amend(1, &id, Side::Buy, 105, 10));
        m.process(&bus);
        assert!(m.book().level(100).is_none());
        assert_eq!(m.book().orders_at(105, true).len(), 1);
        assert_eq!(m.book().outstanding_buy_qty(), 10);
    }

    #[test]
    fn cancel_keeps_price_and_quantity_and_records_entry() {
        let (bus, seen) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        let id = place(&mut m, &bus, 100, 10);

        m.add(OrderRequest::cancel(1, &id, Side::Buy));
        m.process(&bus);
        let o = m.book().get(&id).unwrap();
        let o = o.borrow();
        assert_eq!((o.state.px, o.state.qty), (100, 10));
        assert!(o.state.alive && o.state.pending);
        assert_eq!(o.state.entry.as_ref().unwrap().request_type, RequestType::Cancel);
        assert_eq!(sends(&seen.lock()).len(), 2);
    }

    #[test]
    fn filter_veto_skips_request_silently() {
        let (bus, seen) = recording_bus();
        let mut m = manager(Box::new(Veto));
        m.add(buy(100, 10));
        let summary = m.process(&bus);
        assert_eq!(summary, ProcessSummary { sent: 0, filtered: 1, rejected: 0, created: vec![] });
        assert!(m.book().is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let (bus, _) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        let a = place(&mut m, &bus, 100, 1);
        let b = place(&mut m, &bus, 100, 1);
        assert_ne!(a, b);
        assert_eq!(m.book().len(), 2);
    }

    fn status(id: &str, status: OrderStatus, px: i64, qty: i64) -> OrderStatusEvent {
        OrderStatusEvent {
            order_id: id.into(),
            algo_id: 0,
            status,
            exchange_id: Some("EX-1".into()),
            last_px: px,
            exec_qty: qty,
            ts_ns: 5,
        }
    }

    #[test]
    fn acks_and_fills_update_order_and_book() {
        let (bus, _) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        m.add(OrderRequest::create(1, Side::Sell, OrderType::Limit, 100, 10));
        m.process(&bus);
        let id = m.book().orders_at(100, false)[0].borrow().order_id.clone();

        assert_eq!(m.on_status(&status(&id, OrderStatus::New, 0, 0)), StatusOutcome::Updated);
        let o = m.book().get(&id).unwrap();
        assert!(!o.borrow().state.pending);
        assert_eq!(o.borrow().exchange_id.as_deref(), Some("EX-1"));

        match m.on_status(&status(&id, OrderStatus::PartiallyFilled, 100, 4)) {
            StatusOutcome::Fill(t) => assert_eq!((t.qty, t.px), (-4, 100)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.book().outstanding_sell_qty(), 6);

        assert!(matches!(m.on_status(&status(&id, OrderStatus::Filled, 100, 6)), StatusOutcome::Fill(_)));
        assert!(m.book().get(&id).is_none());
        assert_eq!(m.book().outstanding_sell_qty(), 0);
    }

    #[test]
    fn cancel_ack_removes_order_and_unknown_ids_are_reported() {
        let (bus, _) = recording_bus();
        let mut m = manager(Box::new(AcceptAll));
        let id = place(&mut m, &bus, 100, 10);
        assert_eq!(m.on_status(&status(&id, OrderStatus::Cancelled, 0, 0)), StatusOutcome::Updated);
        assert!(m.book().is_empty());
        assert_eq!(m.on_status(&status(&id, OrderStatus::Filled, 100, 1)), StatusOutcome::Unknown);
    }
}
