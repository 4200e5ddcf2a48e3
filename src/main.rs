// ===============================
// src/main.rs
// ===============================
/*
 # quick look at the engine while it runs
 curl -s localhost:9898/metrics | egrep '^(events_total|orders_sent_total|position_net)'

 # knobs: SYMBOLS, MULTIPLIERS, FILTER, STRATEGY, BRIDGE_CAPACITY, TIMER_QUANTUM_MS,
 #        FILL_MS, RECORD_FILE, METRICS_PORT (see config.rs)
*/
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use exec_backbone::clock::{Clock, SystemClock};
use exec_backbone::domain::{Event, Instrument, StartOfDay, TimerEvent};
use exec_backbone::engine::{CoreParts, TradingCore};
use exec_backbone::feed::SymbolMap;
use exec_backbone::filter::{self, AcceptAll, Filter};
use exec_backbone::positions::{PortfolioResolver, PortfolioRegistry, PositionBook};
use exec_backbone::strategy;
use exec_backbone::{config, feed, gateway, metrics, recorder};
use exec_backbone::{BridgeConfig, EventAggregator, OrderIdGenerator, QueueBridge, TimeUnit, TimerScheduler};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config & limits ----
    let (cfg, limits) = config::load();

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(cfg.metrics_port);

    info!(
        symbols = ?cfg.symbols,
        portfolio_id = cfg.portfolio_id,
        filter = %cfg.filter,
        strategy = %cfg.strategy,
        bridge_capacity = cfg.bridge_capacity,
        timer_quantum_ms = cfg.timer_quantum.as_millis() as u64,
        "startup config"
    );

    // ---- Resolve names once, before anything starts ----
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    if filter::build(&cfg.filter, &limits, clock.clone()).is_none() {
        error!(filter = %cfg.filter, "unknown filter");
        return Err(format!("unknown filter {}", cfg.filter).into());
    }
    if let Some(first) = cfg.instruments.first() {
        if let Err(e) = strategy::build(&cfg.strategy, first, cfg.portfolio_id) {
            error!(strategy = %cfg.strategy, error = %e, "strategy rejected");
            return Err(e.into());
        }
    }

    // ---- Shared state ----
    let bus = Arc::new(EventAggregator::new());
    let registry = Arc::new(PortfolioRegistry::new());
    let position_books: Vec<Arc<PositionBook>> = cfg
        .instruments
        .iter()
        .map(|i| Arc::new(PositionBook::new(i.clone(), registry.clone())))
        .collect();

    // ---- Recorder (optional) ----
    if let Some(path) = cfg.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::unbounded_channel::<Event>();
        recorder::attach(&bus, rec_tx);
        tokio::spawn(recorder::run(rec_rx, path));
    }

    // ---- Gateway hand-off (bus -> gateway task) ----
    let (gw_tx, gw_rx) = mpsc::unbounded_channel();
    gateway::attach(&bus, gw_tx);

    // ---- Trading core on its bridge ----
    let mut timers = TimerScheduler::new(clock.clone(), cfg.timer_quantum);
    let parts = CoreParts {
        instruments: cfg.instruments.clone(),
        positions: position_books,
        bus: bus.clone(),
        timers: timers.dispatcher(),
        ids: Arc::new(OrderIdGenerator::new(cfg.order_id_prefix.clone())),
        clock: clock.clone(),
        filters: {
            let (name, limits, clock) = (cfg.filter.clone(), limits.clone(), clock.clone());
            Box::new(move |_: &Instrument| {
                filter::build(&name, &limits, clock.clone()).unwrap_or_else(|| Box::new(AcceptAll) as Box<dyn Filter>)
            })
        },
        algos: {
            let (name, portfolio_id) = (cfg.strategy.clone(), cfg.portfolio_id);
            Box::new(move |inst: &Instrument| strategy::build(&name, inst, portfolio_id).ok().flatten())
        },
    };
    let bridge_cfg = BridgeConfig {
        name: "trading-core".into(),
        capacity: cfg.bridge_capacity,
        poll_timeout: cfg.bridge_poll,
    };
    let mut bridge = QueueBridge::<Event>::start(bridge_cfg, move || TradingCore::build(parts))?;

    // ---- Timers fire into the same bridge ----
    timers.start(bridge.producer())?;
    let heartbeat = {
        let (registry, portfolio_id) = (registry.clone(), cfg.portfolio_id);
        timers.subscribe(cfg.heartbeat_secs.max(1), TimeUnit::Seconds, true, move |ev: &TimerEvent| {
            let pf = registry.resolve(portfolio_id);
            info!(timer_id = ev.id, portfolio_id, net = pf.net_position(), cash = pf.net_cash_flow(), "heartbeat");
        })?
    };

    // ---- Flat start of day for every instrument ----
    for inst in &cfg.instruments {
        bridge.on_event(Event::StartOfDay(StartOfDay {
            instrument_id: inst.id,
            portfolio_id: cfg.portfolio_id,
            volume: 0,
            cash_flow: 0.0,
            opened_ns: clock.now_ns(),
            entry_px: 0,
        }));
    }

    // ---- Boundary adapters ----
    tokio::spawn(gateway::run_mock(gw_rx, bridge.producer(), cfg.fill_ms));
    let symbols = SymbolMap::from_instruments(&cfg.instruments);
    for sym in cfg.symbols.iter().cloned() {
        tokio::spawn(feed::run_mock(bridge.producer(), symbols.clone(), sym, Duration::from_millis(5)));
    }

    // ---- Run until Ctrl-C ----
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "ctrl-c handler failed, shutting down");
    }
    info!("shutdown requested");
    timers.unsubscribe(heartbeat);
    timers.stop();
    bridge.stop();

    if let Some(pf) = registry.get(cfg.portfolio_id) {
        info!(portfolio_id = pf.id(), net = pf.net_position(), cash = pf.net_cash_flow(), "final position");
    }
    Ok(())
}
