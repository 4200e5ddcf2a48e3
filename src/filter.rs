// ===============================
// src/filter.rs
// ===============================
//
// Pre-trade filters. A filter only answers yes/no; the reason for a "no" is
// logged here, by the filter itself.
//
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::clock::Clock;
use crate::config::Limits;
use crate::domain::OrderRequest;
use crate::metrics::FILTER_VETOES;

/// Burst window for the throttle.
const THROTTLE_WINDOW_NS: i128 = 20_000_000;

pub trait Filter: Send {
    fn check(&mut self, req: &OrderRequest) -> bool;
}

/// Lets everything through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Filter for AcceptAll {
    fn check(&mut self, _req: &OrderRequest) -> bool { true }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("Notional limit exceeded")]
    Notional,
    #[error("Price out of band")]
    PriceBand,
    #[error("Throttle exceeded")]
    Throttle,
}

impl Violation {
    fn label(&self) -> &'static str {
        match self {
            Violation::Notional => "notional",
            Violation::PriceBand => "price_band",
            Violation::Throttle => "throttle",
        }
    }
}

/// Simple throttle state: counts requests inside a short window
#[derive(Debug, Default)]
struct ThrottleState {
    last_ns: i128,
    counter: u32,
}

/// Notional cap, price band and burst throttle.
pub struct LimitsFilter {
    limits: Limits,
    thr: ThrottleState,
    clock: Arc<dyn Clock>,
}

impl LimitsFilter {
    pub fn new(limits: Limits, clock: Arc<dyn Clock>) -> Self {
        Self { limits, thr: ThrottleState::default(), clock }
    }

    fn evaluate(&mut self, req: &OrderRequest) -> Result<(), Violation> {
        let lim = &self.limits;

        // 1) Notional limit (px * qty)
        let notional = req.px.saturating_mul(req.qty);
        if notional > lim.max_notional {
            return Err(Violation::Notional);
        }

        // 2) Price band (market orders carry no price)
        if req.px != 0 && (req.px < lim.px_min || req.px > lim.px_max) {
            return Err(Violation::PriceBand);
        }

        // 3) Throttle: more than max_qps requests inside one window -> reject
        let now = self.clock.now_ns();
        if now - self.thr.last_ns < THROTTLE_WINDOW_NS {
            self.thr.counter += 1;
            if self.thr.counter > lim.max_qps {
                return Err(Violation::Throttle);
            }
        } else {
            self.thr.counter = 0;
            self.thr.last_ns = now;
        }
        Ok(())
    }
}

impl Filter for LimitsFilter {
    fn check(&mut self, req: &OrderRequest) -> bool {
        match self.evaluate(req) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    reason = %e,
                    instrument_id = req.instrument_id,
                    request = ?req.request_type,
                    px = req.px,
                    qty = req.qty,
                    "filter rejected request"
                );
                FILTER_VETOES.with_label_values(&[e.label()]).inc();
                false
            }
        }
    }
}

/// Name -> constructor, resolved once at start-up.
pub fn build(name: &str, limits: &Limits, clock: Arc<dyn Clock>) -> Option<Box<dyn Filter>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "limits" | "risk" => Some(Box::new(LimitsFilter::new(limits.clone(), clock))),
        "accept_all" | "none" => Some(Box::new(AcceptAll)),
        _ => None,
    }
}
