// ===============================
// src/positions.rs (position ledger)
// ===============================
//
// One Position per (portfolio, instrument). Creation is lazy and exactly-once
// under contention; mutation happens on the trading thread only, the RwLock
// around each position is there for readers (metrics, portfolio aggregates).
//
use ahash::AHashMap as HashMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Instrument, InstrumentId, PortfolioId, StartOfDay, Trade};
use crate::metrics::POSITION_NET;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("instrument mismatch: position {expected}, event {got}")]
    InstrumentMismatch { expected: InstrumentId, got: InstrumentId },
    #[error("portfolio mismatch: position {expected}, event {got}")]
    PortfolioMismatch { expected: PortfolioId, got: PortfolioId },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub portfolio_id: PortfolioId,
    pub instrument_id: InstrumentId,
    pub multiplier: f64,
    pub long_volume: i64,
    pub short_volume: i64,
    pub long_cash_flow: f64,
    pub short_cash_flow: f64,
    pub entry_px: i64,
    pub opened_ns: i128,
}

impl Position {
    pub fn new(portfolio_id: PortfolioId, instrument: &Instrument) -> Self {
        Self { portfolio_id, instrument_id: instrument.id, multiplier: instrument.multiplier, ..Default::default() }
    }

    pub fn net(&self) -> i64 { self.long_volume - self.short_volume }

    /// Cash received from shorts minus cash paid for longs.
    pub fn net_cash_flow(&self) -> f64 { self.short_cash_flow - self.long_cash_flow }

    pub fn reset(&mut self) {
        self.long_volume = 0;
        self.short_volume = 0;
        self.long_cash_flow = 0.0;
        self.short_cash_flow = 0.0;
        self.entry_px = 0;
        self.opened_ns = 0;
    }

    fn check_keys(&self, instrument_id: InstrumentId, portfolio_id: PortfolioId) -> Result<(), PositionError> {
        if self.instrument_id != instrument_id {
            return Err(PositionError::InstrumentMismatch { expected: self.instrument_id, got: instrument_id });
        }
        if self.portfolio_id != portfolio_id {
            return Err(PositionError::PortfolioMismatch { expected: self.portfolio_id, got: portfolio_id });
        }
        Ok(())
    }
}

pub type PositionRef = Arc<RwLock<Position>>;

/// Positions of one portfolio across instruments.
#[derive(Debug)]
pub struct Portfolio {
    id: PortfolioId,
    positions: RwLock<HashMap<InstrumentId, PositionRef>>,
}

impl Portfolio {
    pub fn new(id: PortfolioId) -> Self { Self { id, positions: RwLock::new(HashMap::new()) } }

    pub fn id(&self) -> PortfolioId { self.id }

    pub fn register(&self, position: PositionRef) {
        let instrument_id = position.read().instrument_id;
        self.positions.write().insert(instrument_id, position);
    }

    pub fn position(&self, instrument_id: InstrumentId) -> Option<PositionRef> {
        self.positions.read().get(&instrument_id).cloned()
    }

    pub fn net_position(&self) -> i64 { self.positions.read().values().map(|p| p.read().net()).sum() }

    pub fn net_cash_flow(&self) -> f64 { self.positions.read().values().map(|p| p.read().net_cash_flow()).sum() }
}

pub trait PortfolioResolver: Send + Sync {
    fn resolve(&self, id: PortfolioId) -> Arc<Portfolio>;
}

/// Creates portfolios on first use.
#[derive(Debug, Default)]
pub struct PortfolioRegistry {
    portfolios: DashMap<PortfolioId, Arc<Portfolio>>,
}

impl PortfolioRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, id: PortfolioId) -> Option<Arc<Portfolio>> { self.portfolios.get(&id).map(|p| p.clone()) }

    pub fn len(&self) -> usize { self.portfolios.len() }

    pub fn is_empty(&self) -> bool { self.portfolios.is_empty() }
}

impl PortfolioResolver for PortfolioRegistry {
    fn resolve(&self, id: PortfolioId) -> Arc<Portfolio> {
        self.portfolios.entry(id).or_insert_with(|| Arc::new(Portfolio::new(id))).clone()
    }
}

/// How trades and snapshots change a position.
pub trait PositionUpdater: Send + Sync {
    fn update_trade(&self, position: &mut Position, trade: &Trade) -> Result<(), PositionError>;
    fn update_start_of_day(&self, position: &mut Position, sod: &StartOfDay) -> Result<(), PositionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPositionUpdater;

impl PositionUpdater for DefaultPositionUpdater {
    fn update_trade(&self, p: &mut Position, trade: &Trade) -> Result<(), PositionError> {
        p.check_keys(trade.instrument_id, trade.portfolio_id)?;
        let cash = trade.px as f64 * trade.qty.abs() as f64 * p.multiplier;
        let was_flat = p.net() == 0;
        if trade.qty < 0 {
            p.short_volume += -trade.qty;
            p.short_cash_flow += cash;
        } else {
            p.long_volume += trade.qty;
            p.long_cash_flow += cash;
        }
        // entry describes the current holding: cleared when flat, set on reopen
        if p.net() == 0 {
            p.opened_ns = 0;
            p.entry_px = 0;
        } else if was_flat {
            p.opened_ns = trade.ts_ns;
            p.entry_px = trade.px;
        }
        Ok(())
    }

    fn update_start_of_day(&self, p: &mut Position, sod: &StartOfDay) -> Result<(), PositionError> {
        p.check_keys(sod.instrument_id, sod.portfolio_id)?;
        p.reset();
        if sod.volume >= 0 {
            p.long_volume = sod.volume;
            p.long_cash_flow = sod.cash_flow.abs();
        } else {
            p.short_volume = -sod.volume;
            p.short_cash_flow = sod.cash_flow.abs();
        }
        p.opened_ns = sod.opened_ns;
        p.entry_px = sod.entry_px;
        Ok(())
    }
}

/// All positions on one instrument, keyed by portfolio.
pub struct PositionBook {
    instrument: Instrument,
    positions: DashMap<PortfolioId, PositionRef>,
    resolver: Arc<dyn PortfolioResolver>,
    updater: Box<dyn PositionUpdater>,
}

impl PositionBook {
    pub fn new(instrument: Instrument, resolver: Arc<dyn PortfolioResolver>) -> Self {
        Self::with_updater(instrument, resolver, Box::new(DefaultPositionUpdater))
    }

    pub fn with_updater(
        instrument: Instrument,
        resolver: Arc<dyn PortfolioResolver>,
        updater: Box<dyn PositionUpdater>,
    ) -> Self {
        Self { instrument, positions: DashMap::new(), resolver, updater }
    }

    pub fn instrument(&self) -> &Instrument { &self.instrument }

    pub fn len(&self) -> usize { self.positions.len() }

    pub fn is_empty(&self) -> bool { self.positions.is_empty() }

    /// Existing position, or a new one inserted exactly once. Losers of a
    /// first-access race drop their candidate and get the winner.
    pub fn get_position_for(&self, portfolio_id: PortfolioId) -> PositionRef {
        if let Some(p) = self.positions.get(&portfolio_id) {
            return p.clone();
        }
        let candidate = Arc::new(RwLock::new(Position::new(portfolio_id, &self.instrument)));
        match self.positions.entry(portfolio_id) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                e.insert(candidate.clone());
                // the portfolio is resolved outside the shard lock
                self.resolver.resolve(portfolio_id).register(candidate.clone());
                debug!(portfolio_id, instrument_id = self.instrument.id, "position created");
                candidate
            }
        }
    }

    pub fn on_trade(&self, trade: &Trade) -> Result<(), PositionError> {
        let pos = self.get_position_for(trade.portfolio_id);
        let net = {
            let mut p = pos.write();
            self.updater.update_trade(&mut p, trade)?;
            p.net()
        };
        POSITION_NET
            .with_label_values(&[&trade.portfolio_id.to_string(), &self.instrument.id.to_string()])
            .set(net);
        Ok(())
    }

    pub fn on_start_of_day(&self, sod: &StartOfDay) -> Result<(), PositionError> {
        let pos = self.get_position_for(sod.portfolio_id);
        let mut p = pos.write();
        self.updater.update_start_of_day(&mut p, sod)?;
        info!(portfolio_id = sod.portfolio_id, instrument_id = sod.instrument_id, net = p.net(), "start of day applied");
        Ok(())
    }
}
