// ===============================
// src/feed.rs
// ===============================
//
// Market data boundary:
// - SymbolMap : external symbol -> instrument id; unmapped symbols never get in
// - run_mock  : random-walk quote generator (~200 ticks/s per symbol)
//
// Prices are integer ticks (2 decimals, 100.00 == 10_000).
//
use ahash::AHashMap as HashMap;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::bridge::BridgeProducer;
use crate::domain::{Event, FieldKind, Instrument, InstrumentId, MarketData, MdField};
use crate::metrics::{MD_DROPPED, TICKS};

#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    ids: HashMap<String, InstrumentId>,
}

impl SymbolMap {
    pub fn from_instruments(instruments: &[Instrument]) -> Self {
        Self { ids: instruments.iter().map(|i| (i.symbol.clone(), i.id)).collect() }
    }

    pub fn insert(&mut self, symbol: impl Into<String>, id: InstrumentId) { self.ids.insert(symbol.into(), id); }

    pub fn get(&self, symbol: &str) -> Option<InstrumentId> { self.ids.get(symbol).copied() }

    /// Remap an external quote. Unmapped symbols are logged, counted and dropped.
    pub fn remap(&self, symbol: &str, ts_ns: i128, fields: Vec<MdField>) -> Option<MarketData> {
        match self.get(symbol) {
            Some(instrument_id) => Some(MarketData { instrument_id, ts_ns, fields }),
            None => {
                warn!(%symbol, "market data for unmapped symbol, dropped");
                MD_DROPPED.with_label_values(&[symbol]).inc();
                None
            }
        }
    }
}

pub fn quote_fields(bid: i64, ask: i64, bid_size: i64, ask_size: i64) -> Vec<MdField> {
    vec![
        MdField { kind: FieldKind::Bid, value: bid },
        MdField { kind: FieldKind::Ask, value: ask },
        MdField { kind: FieldKind::BidSize, value: bid_size },
        MdField { kind: FieldKind::AskSize, value: ask_size },
    ]
}

/// Random-walk quotes for one symbol into the trading bridge.
pub async fn run_mock(tx: BridgeProducer<Event>, map: SymbolMap, symbol: String, tick_every: Duration) {
    info!(%symbol, "mock feed started");
    let mut px_bid: i64 = 100_00; // 100.00
    loop {
        // ThreadRng is not Send: keep it out of the .await
        let (step, bid_size, ask_size) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-3..=3), rng.gen_range(1..=50), rng.gen_range(1..=50))
        };
        px_bid = (px_bid + step).max(50_00);
        let ts_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128;
        if let Some(md) = map.remap(&symbol, ts_ns, quote_fields(px_bid, px_bid + 1, bid_size, ask_size)) {
            if !tx.on_event(Event::MarketData(md)) {
                info!(%symbol, "trading bridge closed, mock feed stopping");
                return;
            }
            TICKS.inc();
        }
        sleep(tick_every).await;
    }
}
