// ===============================
// src/config.rs
// ===============================
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::domain::{Instrument, MarketId, PortfolioId};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub instruments: Vec<Instrument>,
    pub portfolio_id: PortfolioId,

    // bridge / timer
    pub bridge_capacity: usize, // 0 = unbounded
    pub bridge_poll: Duration,
    pub timer_quantum: Duration,
    pub heartbeat_secs: i64,

    // orders
    pub order_id_prefix: String,
    pub filter: String,
    pub strategy: String,
    pub fill_ms: u64,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_notional: i64,
    pub px_min: i64,
    pub px_max: i64,
    pub max_qps: u32,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(%key, %raw, "unparsable value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// `BTCUSDT,ETHUSDT` -> upper-cased, de-duplicated symbols.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let s = s.to_ascii_uppercase();
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

/// `BTCUSDT=1,ESZ5=50` -> (symbol, multiplier) pairs. Bad pairs are skipped.
pub fn parse_multipliers(raw: &str) -> Vec<(String, f64)> {
    raw.split(',')
        .filter_map(|pair| {
            let (sym, mult) = pair.split_once('=')?;
            match mult.trim().parse::<f64>() {
                Ok(m) if m > 0.0 => Some((sym.trim().to_ascii_uppercase(), m)),
                _ => {
                    warn!(%pair, "bad multiplier, skipped");
                    None
                }
            }
        })
        .collect()
}

/// Instrument ids are assigned 1.. in symbol order.
pub fn build_instruments(symbols: &[String], multipliers: &[(String, f64)], market_id: MarketId) -> Vec<Instrument> {
    symbols
        .iter()
        .enumerate()
        .map(|(i, sym)| Instrument {
            id: i as u32 + 1,
            market_id,
            symbol: sym.clone(),
            multiplier: multipliers.iter().find(|(s, _)| s == sym).map_or(1.0, |(_, m)| *m),
        })
        .collect()
}

pub fn load() -> (EngineConfig, Limits) {
    // .env is optional
    let _ = dotenv();

    let symbols = env::var("SYMBOLS").map(|s| parse_symbols(&s)).unwrap_or_default();
    let symbols = if symbols.is_empty() { vec!["BTCUSDT".to_string()] } else { symbols };
    let multipliers = env::var("MULTIPLIERS").map(|s| parse_multipliers(&s)).unwrap_or_default();
    let market_id = var_or("MARKET_ID", 1u32);
    let instruments = build_instruments(&symbols, &multipliers, market_id);

    let cfg = EngineConfig {
        symbols,
        instruments,
        portfolio_id: var_or("PORTFOLIO_ID", 1u32),
        bridge_capacity: var_or("BRIDGE_CAPACITY", 0usize),
        bridge_poll: Duration::from_millis(var_or("BRIDGE_POLL_MS", 1_000u64)),
        timer_quantum: Duration::from_millis(var_or("TIMER_QUANTUM_MS", 500u64)),
        heartbeat_secs: var_or("HEARTBEAT_SECS", 10i64),
        order_id_prefix: env::var("ORDER_ID_PREFIX").unwrap_or_else(|_| "EXB".to_string()),
        filter: env::var("FILTER").unwrap_or_else(|_| "limits".to_string()),
        strategy: env::var("STRATEGY").unwrap_or_else(|_| "mean_reversion".to_string()),
        fill_ms: var_or("FILL_MS", 10u64),
        record_file: env::var("RECORD_FILE").ok().filter(|s| !s.is_empty()),
        metrics_port: var_or("METRICS_PORT", 9898u16),
    };

    // ===== Limits =====
    let limits = Limits {
        max_notional: var_or("MAX_NOTIONAL", 2_000_000_000i64),
        px_min: var_or("PX_MIN", 1_000i64),
        px_max: var_or("PX_MAX", 200_000i64),
        max_qps: var_or("MAX_QPS", 50u32),
    };
    (cfg, limits)
}
