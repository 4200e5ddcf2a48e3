// ===============================
// src/lib.rs
// ===============================
//
// Trading execution backbone: serialized event processing (queue bridge +
// fixed-rate timers), client-side order book and order lifecycle, and the
// position ledger.
//
pub mod aggregator;
pub mod book;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod feed;
pub mod filter;
pub mod gateway;
pub mod metrics;
pub mod orders;
pub mod positions;
pub mod recorder;
pub mod service;
pub mod strategy;
pub mod timer;

pub use aggregator::EventAggregator;
pub use bridge::{BridgeConfig, BridgeProducer, QueueBridge};
pub use engine::{CoreParts, TradingCore};
pub use orders::{OrderIdGenerator, OrderManager};
pub use positions::{PortfolioRegistry, PositionBook};
pub use timer::{TimeUnit, TimerScheduler};
