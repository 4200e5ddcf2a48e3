// ===============================
// src/timer.rs
// ===============================
//
// Fixed-rate timer service. A dedicated thread wakes every quantum and fires
// every request whose timeout has passed, oldest first. Fired timers travel
// through a sink (normally the trading bridge) and are matched to their
// listener on the consumer thread via `TimerDispatcher`.
//
use ahash::AHashMap as HashMap;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::BridgeProducer;
use crate::clock::{Clock, NANOS_PER_MILLI};
use crate::domain::{TimerEvent, TimerId};
use crate::metrics::{TIMERS_FIRED, TIMERS_STALE};
use crate::service::{ServiceState, ServiceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit { Milliseconds, Seconds, Minutes, Hours }

impl TimeUnit {
    pub fn to_nanos(&self, amount: i64) -> i128 {
        let ms: i128 = match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
        };
        amount as i128 * ms * NANOS_PER_MILLI
    }
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer duration must be positive, got {0}")]
    InvalidDuration(i64),
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub id: TimerId,
    pub timeout_ns: i128,
    pub duration: i64,
    pub unit: TimeUnit,
    pub repeat: bool,
    seq: u64,
}

impl TimerRequest {
    /// Fixed rate: the next firing is scheduled from the previous timeout,
    /// not from the time it actually fired.
    fn next(&self, seq: u64) -> Self {
        Self { timeout_ns: self.timeout_ns + self.unit.to_nanos(self.duration), seq, ..self.clone() }
    }
}

impl PartialEq for TimerRequest {
    fn eq(&self, other: &Self) -> bool { self.timeout_ns == other.timeout_ns && self.seq == other.seq }
}

impl Eq for TimerRequest {}

impl PartialOrd for TimerRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> { Some(self.cmp(other)) }
}

// BinaryHeap pops the max, so compare reversed: earliest timeout (then
// earliest submission) is the "greatest".
impl Ord for TimerRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .timeout_ns
            .cmp(&self.timeout_ns)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub trait TimerListener: Send + Sync {
    fn on_timer(&self, event: &TimerEvent);
}

impl<F> TimerListener for F
where
    F: Fn(&TimerEvent) + Send + Sync,
{
    fn on_timer(&self, event: &TimerEvent) { self(event) }
}

/// Where fired timers go. Returns false if the event was dropped.
pub trait TimerSink: Send + Sync {
    fn deliver(&self, event: TimerEvent) -> bool;
}

impl<E> TimerSink for BridgeProducer<E>
where
    E: From<TimerEvent> + Send,
{
    fn deliver(&self, event: TimerEvent) -> bool { self.on_event(E::from(event)) }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<TimerRequest>>,
    listeners: RwLock<HashMap<TimerId, Arc<dyn TimerListener>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl TimerShared {
    fn seq(&self) -> u64 { self.next_seq.fetch_add(1, Ordering::Relaxed) }

    fn fire_due(&self, sink: &dyn TimerSink) -> usize {
        let now = self.clock.now_ns();
        let mut fired = 0;
        loop {
            // pop + re-arm under one lock so a concurrent cancel sees either
            // the old request or its successor, never neither
            let due = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    Some(req) if req.timeout_ns <= now => {
                        let req = queue.pop();
                        if let Some(r) = req.as_ref().filter(|r| r.repeat) {
                            queue.push(r.next(self.seq()));
                        }
                        req
                    }
                    _ => None,
                }
            };
            let Some(req) = due else { break };
            debug!(timer_id = req.id, timeout_ns = %req.timeout_ns, "timer due");
            sink.deliver(TimerEvent { id: req.id, is_last: !req.repeat });
            fired += 1;
        }
        fired
    }
}

/// Consumer-side half: matches fired events to their listeners.
#[derive(Clone)]
pub struct TimerDispatcher {
    shared: Arc<TimerShared>,
}

impl TimerDispatcher {
    /// Returns false when the timer is no longer subscribed (event dropped).
    pub fn dispatch(&self, event: &TimerEvent) -> bool {
        let listener = self.shared.listeners.read().get(&event.id).cloned();
        let Some(listener) = listener else {
            warn!(timer_id = event.id, "timer fired without a listener, dropped");
            TIMERS_STALE.inc();
            return false;
        };
        listener.on_timer(event);
        if event.is_last {
            self.shared.listeners.write().remove(&event.id);
        }
        TIMERS_FIRED.inc();
        true
    }
}

pub struct TimerScheduler {
    shared: Arc<TimerShared>,
    quantum: Duration,
    status: Arc<ServiceStatus>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TimerScheduler {
    pub fn new(clock: Arc<dyn Clock>, quantum: Duration) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                queue: Mutex::new(BinaryHeap::new()),
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
                clock,
            }),
            quantum,
            status: Arc::new(ServiceStatus::default()),
            stop_tx: None,
            worker: None,
        }
    }

    pub fn dispatcher(&self) -> TimerDispatcher { TimerDispatcher { shared: self.shared.clone() } }

    pub fn subscribe<L>(&self, duration: i64, unit: TimeUnit, repeat: bool, listener: L) -> Result<TimerId, TimerError>
    where
        L: TimerListener + 'static,
    {
        if duration <= 0 {
            return Err(TimerError::InvalidDuration(duration));
        }
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.listeners.write().insert(id, Arc::new(listener));
        let timeout_ns = shared.clock.now_ns() + unit.to_nanos(duration);
        shared.queue.lock().push(TimerRequest { id, timeout_ns, duration, unit, repeat, seq: shared.seq() });
        debug!(timer_id = id, duration, ?unit, repeat, "timer subscribed");
        Ok(id)
    }

    /// Best effort: the listener is removed at once; a request already fired
    /// is simply not found. Returns whether a queued request was removed.
    pub fn unsubscribe(&self, id: TimerId) -> bool {
        self.shared.listeners.write().remove(&id);
        let mut queue = self.shared.queue.lock();
        let before = queue.len();
        queue.retain(|r| r.id != id);
        let removed = queue.len() != before;
        debug!(timer_id = id, removed, "timer unsubscribed");
        removed
    }

    /// Fire everything due at the clock's current time. Exposed so tests and
    /// replays can drive the scheduler without its thread.
    pub fn fire_due(&self, sink: &dyn TimerSink) -> usize { self.shared.fire_due(sink) }

    pub fn pending(&self) -> usize { self.shared.queue.lock().len() }

    pub fn state(&self) -> ServiceState { self.status.get() }

    pub fn start<S>(&mut self, sink: S) -> Result<(), TimerError>
    where
        S: TimerSink + 'static,
    {
        if !self.status.starting() {
            warn!("timer scheduler already started");
            return Ok(());
        }
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = self.shared.clone();
        let status = self.status.clone();
        let quantum = self.quantum;
        let worker = thread::Builder::new().name("timer-scheduler".into()).spawn(move || {
            status.running();
            info!(quantum_ms = quantum.as_millis() as u64, "timer scheduler started");
            loop {
                match stop_rx.recv_timeout(quantum) {
                    Err(RecvTimeoutError::Timeout) => {
                        shared.fire_due(&sink);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            status.stopped();
            info!("timer scheduler stopped");
        })?;
        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else { return };
        self.status.stopping();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if worker.join().is_err() {
            warn!("timer thread panicked");
            self.status.stopped();
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) { self.stop(); }
}
