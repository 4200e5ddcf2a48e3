// End-to-end: producers on other threads -> trading bridge -> core -> bus,
// with the timer scheduler firing into the same bridge.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use exec_backbone::clock::{Clock, ManualClock};
use exec_backbone::domain::{
    Event, EventKind, Instrument, OrderRequest, OrderStatus, OrderStatusEvent, OrderType, Side, TimerEvent,
};
use exec_backbone::engine::{CoreParts, TradingCore};
use exec_backbone::filter::{AcceptAll, Filter};
use exec_backbone::service::ServiceState;
use exec_backbone::strategy::Algo;
use exec_backbone::{
    BridgeConfig, EventAggregator, OrderIdGenerator, PortfolioRegistry, PositionBook, QueueBridge, TimeUnit,
    TimerScheduler,
};

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

struct Engine {
    bridge: QueueBridge<Event>,
    timers: TimerScheduler,
    clock: Arc<ManualClock>,
    book: Arc<PositionBook>,
    registry: Arc<PortfolioRegistry>,
    seen: Arc<Mutex<Vec<Event>>>,
}

fn engine() -> Engine {
    let instrument = Instrument { id: 1, market_id: 1, symbol: "ESZ5".into(), multiplier: 50.0 };
    let clock = Arc::new(ManualClock::new(1_000_000_000));
    let bus = Arc::new(EventAggregator::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::OrderSend, EventKind::Trade, EventKind::OrderReject] {
        let s = seen.clone();
        bus.subscribe(kind, move |ev| s.lock().push(ev.clone()));
    }
    let registry = Arc::new(PortfolioRegistry::new());
    let book = Arc::new(PositionBook::new(instrument.clone(), registry.clone()));
    let mut timers = TimerScheduler::new(clock.clone() as Arc<dyn Clock>, Duration::from_millis(10));

    let parts = CoreParts {
        instruments: vec![instrument],
        positions: vec![book.clone()],
        bus,
        timers: timers.dispatcher(),
        ids: Arc::new(OrderIdGenerator::new("IT")),
        clock: clock.clone(),
        filters: Box::new(|_: &Instrument| Box::new(AcceptAll) as Box<dyn Filter>),
        algos: Box::new(|_: &Instrument| None::<Box<dyn Algo>>),
    };
    let cfg = BridgeConfig { name: "it-core".into(), capacity: 0, poll_timeout: Duration::from_millis(20) };
    let bridge = QueueBridge::<Event>::start(cfg, move || TradingCore::build(parts)).unwrap();
    timers.start(bridge.producer()).unwrap();
    Engine { bridge, timers, clock, book, registry, seen }
}

fn count(seen: &Mutex<Vec<Event>>, kind: EventKind) -> usize {
    seen.lock().iter().filter(|e| e.kind() == kind).count()
}

fn status(order_id: &str, status: OrderStatus, px: i64, qty: i64) -> Event {
    Event::OrderStatus(OrderStatusEvent {
        order_id: order_id.into(),
        algo_id: 0,
        status,
        exchange_id: Some("X".into()),
        last_px: px,
        exec_qty: qty,
        ts_ns: 0,
    })
}

#[test]
fn order_round_trip_through_the_bridge() {
    let mut e = engine();
    let create = OrderRequest::create(9, Side::SellShort, OrderType::Limit, 4_000, 500);
    let bogus_cancel = OrderRequest::cancel(9, "IT-999", Side::Buy);
    e.bridge.on_event(Event::Requests { instrument_id: 1, requests: vec![create, bogus_cancel] });

    assert!(wait_until(Duration::from_secs(5), || count(&e.seen, EventKind::OrderSend) == 1));
    assert_eq!(count(&e.seen, EventKind::OrderReject), 1);
    let order_id = e
        .seen
        .lock()
        .iter()
        .find_map(|ev| if let Event::OrderSend(s) = ev { Some(s.orders[0].order_id.clone()) } else { None })
        .unwrap();

    // acknowledgements come from a gateway thread
    let tx = e.bridge.producer();
    let id = order_id.clone();
    thread::spawn(move || {
        tx.on_event(status(&id, OrderStatus::New, 0, 0));
        tx.on_event(status(&id, OrderStatus::PartiallyFilled, 4_000, 200));
        tx.on_event(status(&id, OrderStatus::Filled, 4_000, 300));
        // late duplicate: the order is gone by now
        tx.on_event(status(&id, OrderStatus::Filled, 4_000, 300));
    })
    .join()
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || count(&e.seen, EventKind::Trade) == 2));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(count(&e.seen, EventKind::Trade), 2);

    let pos = e.book.get_position_for(9);
    let p = pos.read();
    assert_eq!(p.short_volume, 500);
    assert_eq!(p.short_cash_flow, 500.0 * 4_000.0 * 50.0);
    assert_eq!(e.registry.get(9).unwrap().net_position(), -500);
    drop(p);

    e.timers.stop();
    e.bridge.stop();
    assert_eq!(e.bridge.state(), ServiceState::Stopped);
}

#[test]
fn repeating_timer_catches_up_on_the_consumer_thread() {
    let mut e = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let consumer = Arc::new(Mutex::new(None));
    let c = consumer.clone();
    let id = e
        .timers
        .subscribe(100, TimeUnit::Milliseconds, true, move |_: &TimerEvent| {
            f.fetch_add(1, Ordering::SeqCst);
            *c.lock() = thread::current().name().map(str::to_string);
        })
        .unwrap();

    // three periods overdue at once: fixed rate fires all three
    e.clock.advance_ms(350);
    assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 3));
    assert_eq!(consumer.lock().as_deref(), Some("it-core"));

    e.clock.advance_ms(40);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    e.clock.advance_ms(10);
    assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 4));

    e.timers.unsubscribe(id);
    e.clock.advance_ms(1_000);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), 4);

    e.timers.stop();
    e.bridge.stop();
}
