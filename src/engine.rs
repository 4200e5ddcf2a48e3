// ===============================
// src/engine.rs
// ===============================
//
// The trading core: sole owner of the order managers and sole writer of
// positions in steady state. It runs as the handler of the trading bridge, so
// every event it sees arrives on one thread, in enqueue order.
//
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::aggregator::EventAggregator;
use crate::bridge::{EventHandler, HandlerResult};
use crate::clock::Clock;
use crate::domain::{
    Event, EventKind, Instrument, InstrumentId, MarketData, OrderRequest, OrderStatusEvent, StartOfDay,
};
use crate::filter::Filter;
use crate::metrics::{EVENTS, LAT_DISPATCH};
use crate::orders::{OrderIdGenerator, OrderManager, StatusOutcome};
use crate::positions::{PositionBook, PositionError};
use crate::strategy::Algo;
use crate::timer::TimerDispatcher;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error("{0:?} events are outbound only")]
    Outbound(EventKind),
}

pub type FilterFactory = Box<dyn Fn(&Instrument) -> Box<dyn Filter> + Send>;
pub type AlgoFactory = Box<dyn Fn(&Instrument) -> Option<Box<dyn Algo>> + Send>;

/// Everything the core needs, assembled by the composition root. Sent to the
/// consumer thread and turned into a `TradingCore` there.
pub struct CoreParts {
    pub instruments: Vec<Instrument>,
    pub positions: Vec<Arc<PositionBook>>,
    pub bus: Arc<EventAggregator>,
    pub timers: TimerDispatcher,
    pub ids: Arc<OrderIdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub filters: FilterFactory,
    pub algos: AlgoFactory,
}

pub struct TradingCore {
    managers: HashMap<InstrumentId, OrderManager>,
    positions: HashMap<InstrumentId, Arc<PositionBook>>,
    algos: HashMap<InstrumentId, Box<dyn Algo>>,
    bus: Arc<EventAggregator>,
    timers: TimerDispatcher,
}

impl TradingCore {
    pub fn build(parts: CoreParts) -> Self {
        let CoreParts { instruments, positions, bus, timers, ids, clock, filters, algos: make_algo } = parts;
        let mut managers = HashMap::new();
        let mut algos = HashMap::new();
        for inst in instruments {
            if let Some(algo) = make_algo(&inst) {
                debug!(instrument_id = inst.id, algo = algo.name(), "algo attached");
                algos.insert(inst.id, algo);
            }
            let filter = filters(&inst);
            managers.insert(inst.id, OrderManager::new(inst, filter, ids.clone(), clock.clone()));
        }
        let positions = positions.into_iter().map(|b| (b.instrument().id, b)).collect();
        Self { managers, positions, algos, bus, timers }
    }

    pub fn manager(&self, instrument_id: InstrumentId) -> Option<&OrderManager> { self.managers.get(&instrument_id) }

    pub fn on_event(&mut self, event: Event) -> Result<(), CoreError> {
        let kind = event.kind();
        EVENTS.with_label_values(&[kind.label()]).inc();
        let t0 = Instant::now();

        let result = match &event {
            Event::MarketData(md) => {
                self.on_market_data(md);
                Ok(())
            }
            Event::Requests { instrument_id, requests } => {
                self.on_requests(*instrument_id, requests.clone());
                Ok(())
            }
            Event::OrderStatus(st) => self.on_order_status(st),
            Event::Timer(t) => {
                self.timers.dispatch(t);
                Ok(())
            }
            Event::StartOfDay(sod) => self.on_start_of_day(sod),
            Event::OrderSend(_) | Event::OrderReject(_) | Event::Trade(_) => Err(CoreError::Outbound(kind)),
        };

        // subscribers see the inbound event after the core has applied it
        if result.is_ok() {
            self.bus.publish(&event);
        }
        LAT_DISPATCH.observe(t0.elapsed().as_secs_f64() * 1e6);
        result
    }

    fn on_market_data(&mut self, md: &MarketData) {
        let Some(manager) = self.managers.get_mut(&md.instrument_id) else {
            warn!(instrument_id = md.instrument_id, "market data for unknown instrument, dropped");
            return;
        };
        let Some(algo) = self.algos.get_mut(&md.instrument_id) else { return };
        let requests = algo.on_market_data(md);
        if requests.is_empty() {
            return;
        }
        for req in requests {
            manager.add(req);
        }
        let summary = manager.process(&self.bus);
        if summary.filtered + summary.rejected > 0 {
            debug!(instrument_id = md.instrument_id, filtered = summary.filtered, rejected = summary.rejected, "algo requests dropped");
        }
        algo.on_orders_created(&summary.created);
    }

    fn on_requests(&mut self, instrument_id: InstrumentId, requests: Vec<OrderRequest>) {
        let Some(manager) = self.managers.get_mut(&instrument_id) else {
            warn!(instrument_id, count = requests.len(), "requests for unknown instrument, dropped");
            return;
        };
        for req in requests {
            manager.add(req);
        }
        let summary = manager.process(&self.bus);
        debug!(instrument_id, sent = summary.sent, filtered = summary.filtered, rejected = summary.rejected, "requests processed");
    }

    fn on_order_status(&mut self, st: &OrderStatusEvent) -> Result<(), CoreError> {
        let hit = self.managers.iter_mut().find_map(|(id, m)| match m.on_status(st) {
            StatusOutcome::Unknown => None,
            outcome => Some((*id, outcome)),
        });
        let Some((instrument_id, outcome)) = hit else {
            warn!(order_id = %st.order_id, status = ?st.status, "status for unknown order, dropped");
            return Ok(());
        };

        if let Some(algo) = self.algos.get_mut(&instrument_id) {
            // dead orders have already left the book
            let alive = self
                .managers
                .get(&instrument_id)
                .and_then(|m| m.book().get(&st.order_id))
                .is_some_and(|o| o.borrow().state.alive);
            algo.on_order_status(st, alive);
        }
        if let StatusOutcome::Fill(trade) = outcome {
            match self.positions.get(&instrument_id) {
                Some(book) => book.on_trade(&trade)?,
                None => error!(instrument_id, order_id = %trade.order_id, "no position book for fill"),
            }
            self.bus.publish(&Event::Trade(trade));
        }
        Ok(())
    }

    fn on_start_of_day(&mut self, sod: &StartOfDay) -> Result<(), CoreError> {
        match self.positions.get(&sod.instrument_id) {
            Some(book) => book.on_start_of_day(sod)?,
            None => warn!(instrument_id = sod.instrument_id, "start of day for unknown instrument, dropped"),
        }
        Ok(())
    }
}

impl EventHandler<Event> for TradingCore {
    fn handle_event(&mut self, event: Event) -> HandlerResult { self.on_event(event).map_err(Into::into) }
}
