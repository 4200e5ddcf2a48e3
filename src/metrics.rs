// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{debug, error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Serialized event path --------
pub static EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("events_total", "events handled by the trading core"), &["kind"]).unwrap()
});

pub static HANDLER_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("handler_failures_total", "events whose handler failed or panicked"),
        &["bridge"],
    )
    .unwrap()
});

pub static ENQUEUE_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bridge_enqueue_dropped_total", "events dropped at enqueue (shutdown/closed)"),
        &["bridge"],
    )
    .unwrap()
});

pub static BRIDGE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("bridge_queue_depth", "events waiting in the bridge"), &["bridge"]).unwrap()
});

// Dispatch latency on the consumer thread (microseconds)
pub static LAT_DISPATCH: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("dispatch_latency_us", "time spent handling one event (us)")
            .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0]),
    )
    .unwrap()
});

// -------- Orders --------
pub static ORDER_BATCHES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("order_batches_total", "outbound order send batches").unwrap());

pub static ORDERS_SENT: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_sent_total", "orders in outbound batches").unwrap());

pub static REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("order_rejects_total", "rejected order requests"), &["reason"]).unwrap()
});

pub static FILTER_VETOES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("filter_vetoes_total", "requests vetoed by the filter"), &["rule"]).unwrap()
});

pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("order_status_total", "order status events applied"), &["status"]).unwrap()
});

// -------- Timers --------
pub static TIMERS_FIRED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("timers_fired_total", "timer events delivered to listeners").unwrap());

pub static TIMERS_STALE: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("timers_stale_total", "timer events with no listener").unwrap());

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data events forwarded").unwrap());

pub static MD_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("md_unmapped_total", "market data dropped for unmapped symbols"), &["symbol"])
        .unwrap()
});

// -------- Positions --------
pub static POSITION_NET: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("position_net", "net volume per portfolio/instrument"),
        &["portfolio", "instrument"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(EVENTS.clone())),
        REGISTRY.register(Box::new(HANDLER_FAILURES.clone())),
        REGISTRY.register(Box::new(ENQUEUE_DROPPED.clone())),
        REGISTRY.register(Box::new(BRIDGE_DEPTH.clone())),
        REGISTRY.register(Box::new(LAT_DISPATCH.clone())),
        REGISTRY.register(Box::new(ORDER_BATCHES.clone())),
        REGISTRY.register(Box::new(ORDERS_SENT.clone())),
        REGISTRY.register(Box::new(REJECTS.clone())),
        REGISTRY.register(Box::new(FILTER_VETOES.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(TIMERS_FIRED.clone())),
        REGISTRY.register(Box::new(TIMERS_STALE.clone())),
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(MD_DROPPED.clone())),
        REGISTRY.register(Box::new(POSITION_NET.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

fn render(registry: &Registry) -> Vec<u8> {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&registry.gather(), &mut buf).is_err() || buf.is_empty() {
        buf = b"# no metrics\n".to_vec();
    }
    buf
}

/// Status line and body for a raw request. Only `GET /` and `GET /metrics`
/// (query string ignored) are served.
fn route(request: &[u8], registry: &Registry) -> (&'static str, Vec<u8>) {
    let line = request.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = String::from_utf8_lossy(line);
    let mut parts = line.split_whitespace();
    let (method, target) = (parts.next(), parts.next());
    let path = target.map(|t| t.split('?').next().unwrap_or(t));
    match (method, path) {
        (Some("GET"), Some("/" | "/metrics")) => ("200 OK", render(registry)),
        (Some("GET"), _) => ("404 Not Found", b"not found\n".to_vec()),
        _ => ("405 Method Not Allowed", b"method not allowed\n".to_vec()),
    }
}

fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = match stream.read(&mut req) {
        Ok(n) => n,
        Err(e) => {
            debug!(?e, "metrics read failed");
            return;
        }
    };
    let (status, body) = route(&req[..n], &REGISTRY);
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if let Err(e) = stream.write_all(head.as_bytes()).and_then(|_| stream.write_all(&body)) {
        debug!(?e, status, "metrics write failed");
    }
}

// Run the metrics server in a dedicated OS thread, away from the trading threads
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        info!(%addr, "metrics listening (/ and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.register(Box::new(ORDERS_SENT.clone())).unwrap();
        ORDERS_SENT.inc();
        registry
    }

    #[test]
    fn encodes_registered_metrics() {
        let (status, body) = route(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n", &registry());
        assert_eq!(status, "200 OK");
        assert!(String::from_utf8(body).unwrap().contains("orders_sent_total"));
    }

    #[test]
    fn root_and_query_string_are_served() {
        let r = registry();
        assert_eq!(route(b"GET / HTTP/1.1\r\n\r\n", &r).0, "200 OK");
        assert_eq!(route(b"GET /metrics?x=1 HTTP/1.0\r\n\r\n", &r).0, "200 OK");
    }

    #[test]
    fn other_paths_and_methods_are_refused() {
        let r = registry();
        assert_eq!(route(b"GET /favicon.ico HTTP/1.1\r\n\r\n", &r).0, "404 Not Found");
        assert_eq!(route(b"POST /metrics HTTP/1.1\r\n\r\n", &r).0, "405 Method Not Allowed");
        assert_eq!(route(b"", &r).0, "405 Method Not Allowed");
    }
}
