// ===============================
// src/gateway.rs (mock order gateway)
// ===============================
//
// Consumes outbound order batches and answers through the trading bridge:
// creates/amends are acked (`New`) then filled after `fill_ms`, cancels are
// answered `Cancelled`.
//
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::aggregator::{EventAggregator, SubscriptionId};
use crate::bridge::BridgeProducer;
use crate::domain::{Event, EventKind, Order, OrderSendEvent, OrderStatus, OrderStatusEvent, RequestType};

fn now_ns() -> i128 { Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128 }

/// Forward every outbound batch published on the bus to the gateway task.
/// Runs on the publisher's (trading) thread, so it only hands off.
pub fn attach(bus: &EventAggregator, tx: mpsc::UnboundedSender<OrderSendEvent>) -> SubscriptionId {
    bus.subscribe(EventKind::OrderSend, move |ev| {
        if let Event::OrderSend(batch) = ev {
            if tx.send(batch.clone()).is_err() {
                warn!(instrument_id = batch.instrument_id, "gateway gone, batch dropped");
            }
        }
    })
}

fn status(order: &Order, status: OrderStatus, last_px: i64, exec_qty: i64) -> OrderStatusEvent {
    OrderStatusEvent {
        order_id: order.order_id.clone(),
        algo_id: 0,
        status,
        exchange_id: Some(format!("MOCK-{}", order.seq)),
        last_px,
        exec_qty,
        ts_ns: now_ns(),
    }
}

/// Immediate acknowledgement for one order.
pub fn ack(order: &Order) -> OrderStatusEvent {
    match order.state.entry.as_ref().map(|e| e.request_type) {
        Some(RequestType::Cancel) => status(order, OrderStatus::Cancelled, 0, 0),
        _ => status(order, OrderStatus::New, 0, 0),
    }
}

/// Delayed fill, if the order gets one (cancels do not).
pub fn fill(order: &Order) -> Option<OrderStatusEvent> {
    if matches!(order.state.entry.as_ref().map(|e| e.request_type), Some(RequestType::Cancel)) {
        return None;
    }
    let remaining = order.state.qty - order.state.filled_qty;
    (remaining > 0).then(|| status(order, OrderStatus::Filled, order.state.px, remaining))
}

pub async fn run_mock(mut rx: mpsc::UnboundedReceiver<OrderSendEvent>, tx: BridgeProducer<Event>, fill_ms: u64) {
    info!(fill_ms, "mock gateway started");
    while let Some(batch) = rx.recv().await {
        debug!(instrument_id = batch.instrument_id, orders = batch.orders.len(), "gateway batch in");
        for order in &batch.orders {
            tx.on_event(Event::OrderStatus(ack(order)));
        }

        let fills: Vec<OrderStatusEvent> = batch.orders.iter().filter_map(fill).collect();
        if fills.is_empty() {
            continue;
        }
        let tx = tx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(fill_ms)).await;
            for st in fills {
                tx.on_event(Event::OrderStatus(st));
            }
        });
    }
    info!("mock gateway stopped");
}
