// ===============================
// src/clock.rs
// ===============================
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

pub const NANOS_PER_MILLI: i128 = 1_000_000;

pub trait Clock: Send + Sync {
    fn now_ns(&self) -> i128;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> i128 { Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128 }
}

/// Virtual time for tests and replay. Only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock { ns: AtomicI64 }

impl ManualClock {
    pub fn new(start_ns: i64) -> Self { Self { ns: AtomicI64::new(start_ns) } }
    pub fn set(&self, ns: i64) { self.ns.store(ns, Ordering::SeqCst); }
    pub fn advance_ms(&self, ms: i64) { self.ns.fetch_add(ms * NANOS_PER_MILLI as i64, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i128 { self.ns.load(Ordering::SeqCst) as i128 }
}
