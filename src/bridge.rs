// ===============================
// src/bridge.rs
// ===============================
//
// Multi-producer / single-consumer bridge: any number of threads call
// `on_event`, exactly one dedicated thread runs `handle_event`, in enqueue order.
//
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics::{BRIDGE_DEPTH, ENQUEUE_DROPPED, HANDLER_FAILURES};
use crate::service::{ServiceState, ServiceStatus};

/// How long a blocked producer waits before re-checking the stop flag.
const ENQUEUE_RETRY: Duration = Duration::from_millis(50);

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Implemented by the component that owns the consumer side of a bridge.
pub trait EventHandler<E> {
    fn handle_event(&mut self, event: E) -> HandlerResult;
}

impl<E, F> EventHandler<E> for F
where
    F: FnMut(E) -> HandlerResult,
{
    fn handle_event(&mut self, event: E) -> HandlerResult { self(event) }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub name: String,
    /// 0 = unbounded.
    pub capacity: usize,
    pub poll_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { name: "bridge".into(), capacity: 0, poll_timeout: Duration::from_secs(1) }
    }
}

/// Cheap, cloneable producer handle.
pub struct BridgeProducer<E> {
    name: Arc<str>,
    tx: Sender<E>,
    running: Arc<AtomicBool>,
    bounded: bool,
}

impl<E> Clone for BridgeProducer<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            running: self.running.clone(),
            bounded: self.bounded,
        }
    }
}

impl<E> BridgeProducer<E> {
    /// Enqueue an event. Never blocks on an unbounded bridge; on a bounded one
    /// it waits for space until the bridge is asked to stop. Returns false if
    /// the event was dropped.
    pub fn on_event(&self, event: E) -> bool {
        if !self.bounded {
            return match self.tx.send(event) {
                Ok(()) => true,
                Err(_) => {
                    warn!(bridge = %self.name, "bridge closed, event dropped");
                    ENQUEUE_DROPPED.with_label_values(&[self.name.as_ref()]).inc();
                    false
                }
            };
        }

        let mut event = event;
        loop {
            if !self.running.load(Ordering::Acquire) {
                warn!(bridge = %self.name, "enqueue interrupted by shutdown, event dropped");
                ENQUEUE_DROPPED.with_label_values(&[self.name.as_ref()]).inc();
                return false;
            }
            match self.tx.send_timeout(event, ENQUEUE_RETRY) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => event = back,
                Err(SendTimeoutError::Disconnected(_)) => {
                    warn!(bridge = %self.name, "bridge closed, event dropped");
                    ENQUEUE_DROPPED.with_label_values(&[self.name.as_ref()]).inc();
                    return false;
                }
            }
        }
    }

    pub fn len(&self) -> usize { self.tx.len() }

    pub fn is_empty(&self) -> bool { self.tx.is_empty() }
}

pub struct QueueBridge<E> {
    producer: BridgeProducer<E>,
    status: Arc<ServiceStatus>,
    worker: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> QueueBridge<E> {
    /// Spawn the consumer thread. The handler is built on that thread, so it
    /// may own state that is not `Send`.
    pub fn start<H, F>(cfg: BridgeConfig, make_handler: F) -> Result<Self, BridgeError>
    where
        F: FnOnce() -> H + Send + 'static,
        H: EventHandler<E> + 'static,
    {
        let (tx, rx) = if cfg.capacity == 0 {
            channel::unbounded()
        } else {
            channel::bounded(cfg.capacity)
        };
        let name: Arc<str> = Arc::from(cfg.name.as_str());
        let running = Arc::new(AtomicBool::new(true));
        let status = Arc::new(ServiceStatus::default());
        status.starting();

        let worker = thread::Builder::new().name(cfg.name.clone()).spawn({
            let name = name.clone();
            let running = running.clone();
            let status = status.clone();
            let poll = cfg.poll_timeout;
            move || {
                let mut handler = make_handler();
                status.running();
                info!(bridge = %name, "consumer started");
                consume(&name, &rx, &mut handler, &running, poll);
                if !rx.is_empty() {
                    debug!(bridge = %name, remaining = rx.len(), "undelivered events discarded on stop");
                }
                status.stopped();
                info!(bridge = %name, "consumer stopped");
            }
        })?;

        Ok(Self {
            producer: BridgeProducer { name, tx, running, bounded: cfg.capacity != 0 },
            status,
            worker: Some(worker),
        })
    }
}

impl<E> QueueBridge<E> {
    pub fn producer(&self) -> BridgeProducer<E> { self.producer.clone() }

    pub fn on_event(&self, event: E) -> bool { self.producer.on_event(event) }

    pub fn state(&self) -> ServiceState { self.status.get() }

    /// Flip the cooperative stop flag without waiting for the consumer.
    pub fn request_stop(&self) {
        self.status.stopping();
        self.producer.running.store(false, Ordering::Release);
    }

    /// Stop and join the consumer. Idempotent.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else { return };
        self.request_stop();
        if worker.join().is_err() {
            error!(bridge = %self.producer.name, "consumer thread panicked");
            self.status.stopped();
        }
    }
}

impl<E> Drop for QueueBridge<E> {
    fn drop(&mut self) { self.stop(); }
}

fn consume<E, H: EventHandler<E>>(
    name: &str,
    rx: &Receiver<E>,
    handler: &mut H,
    running: &AtomicBool,
    poll: Duration,
) {
    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(poll) {
            Ok(event) => {
                dispatch(name, handler, event);
                BRIDGE_DEPTH.with_label_values(&[name]).set(rx.len() as i64);
            }
            // idle tick
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// One failing event must not take the consumer thread down with it.
fn dispatch<E, H: EventHandler<E>>(name: &str, handler: &mut H, event: E) {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(bridge = %name, error = %e, "event handler failed");
            HANDLER_FAILURES.with_label_values(&[name]).inc();
        }
        Err(payload) => {
            error!(bridge = %name, panic = %panic_message(&payload), "event handler panicked, event dropped");
            HANDLER_FAILURES.with_label_values(&[name]).inc();
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn cfg(name: &str, capacity: usize) -> BridgeConfig {
        BridgeConfig { name: name.into(), capacity, poll_timeout: Duration::from_millis(20) }
    }

    #[test]
    fn delivers_every_event_once_in_producer_order() {
        let seen = Arc::new(Mutex::new(Vec::<(usize, usize)>::new()));
        let sink = seen.clone();
        let mut bridge = QueueBridge::start(cfg("fifo", 0), move || {
            move |ev: (usize, usize)| -> HandlerResult {
                sink.lock().push(ev);
                Ok(())
            }
        })
        .unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let tx = bridge.producer();
                thread::spawn(move || {
                    for i in 0..500 {
                        assert!(tx.on_event((p, i)));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 2000));
        bridge.stop();

        let seen = seen.lock();
        for p in 0..4 {
            let seqs: Vec<usize> = seen.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(seqs, (0..500).collect::<Vec<_>>());
        }
    }

    #[test]
    fn single_producer_order_is_preserved() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let bridge = QueueBridge::start(cfg("order", 0), move || {
            move |ev: u32| -> HandlerResult {
                sink.lock().push(ev);
                Ok(())
            }
        })
        .unwrap();
        for i in 0..100 {
            bridge.on_event(i);
        }
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 100));
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn failing_event_does_not_stop_consumer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut bridge = QueueBridge::start(cfg("contain", 0), move || {
            move |ev: u32| -> HandlerResult {
                match ev {
                    1 => panic!("boom"),
                    2 => Err("bad event".into()),
                    _ => {
                        sink.lock().push(ev);
                        Ok(())
                    }
                }
            }
        })
        .unwrap();

        for i in 0..5 {
            bridge.on_event(i);
        }
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 3));
        assert_eq!(*seen.lock(), vec![0, 3, 4]);
        assert_eq!(bridge.state(), ServiceState::Running);
        bridge.stop();
        assert_eq!(bridge.state(), ServiceState::Stopped);
    }

    #[test]
    fn idle_consumer_observes_stop_promptly() {
        let mut bridge = QueueBridge::start(cfg("idle", 0), || |_: u8| -> HandlerResult { Ok(()) }).unwrap();
        assert!(wait_until(Duration::from_secs(1), || bridge.state() == ServiceState::Running));
        let t0 = Instant::now();
        bridge.stop();
        assert!(t0.elapsed() < Duration::from_millis(500));
        assert_eq!(bridge.state(), ServiceState::Stopped);
        // closed bridge drops instead of failing loudly
        assert!(!bridge.on_event(1));
    }

    #[test]
    fn blocked_bounded_producer_is_released_by_stop() {
        let (started_tx, started_rx) = channel::unbounded::<()>();
        let (gate_tx, gate_rx) = channel::unbounded::<()>();
        let mut bridge = QueueBridge::start(cfg("bounded", 1), move || {
            move |_: u32| -> HandlerResult {
                let _ = started_tx.send(());
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                Ok(())
            }
        })
        .unwrap();

        assert!(bridge.on_event(1));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // consumer is parked in the handler: this one fills the queue
        assert!(bridge.on_event(2));

        let tx = bridge.producer();
        let blocked = thread::spawn(move || tx.on_event(3));
        thread::sleep(Duration::from_millis(100));
        assert!(!blocked.is_finished());

        bridge.request_stop();
        assert!(!blocked.join().unwrap());

        let _ = gate_tx.send(());
        let _ = gate_tx.send(());
        bridge.stop();
    }
}
