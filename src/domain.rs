// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

pub type InstrumentId = u32;
pub type MarketId = u32;
pub type PortfolioId = u32;
pub type TimerId = u64;
pub type OrderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell, SellShort, BuyToCover }

impl Side {
    pub fn is_buy(&self) -> bool { matches!(self, Side::Buy | Side::BuyToCover) }
    pub fn sign(&self) -> i64 { if self.is_buy() { 1 } else { -1 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType { Market, Limit, Stop, StopLimit }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce { Day, Gtc, Ioc, Fok }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType { Create, Amend, Cancel }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason { DependantOrder, InvalidAmend, Filter, Unknown }

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::DependantOrder => "dependant_order",
            RejectReason::InvalidAmend => "invalid_amend",
            RejectReason::Filter => "filter",
            RejectReason::Unknown => "unknown",
        }
    }
}

/// Static description of a tradable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub market_id: MarketId,
    pub symbol: String,
    pub multiplier: f64,
}

/// Snapshot of the request fields last applied to an order, kept for
/// reconciliation against gateway acknowledgements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub request_type: RequestType,
    pub side: Side,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub px: i64,
    pub qty: i64,
    pub dependent_order_id: Option<OrderId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub alive: bool,
    pub pending: bool,
    pub px: i64,
    pub qty: i64,
    pub filled_qty: i64,
    pub created_ns: i128,
    pub entry: Option<OrderEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub exchange_id: Option<String>,
    pub client_id: Option<String>,
    pub instrument_id: InstrumentId,
    pub market_id: MarketId,
    pub portfolio_id: PortfolioId,
    pub side: Side,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub px: i64,
    pub qty: i64,
    /// Insertion sequence, breaks creation-time ties inside a price level.
    pub seq: u64,
    pub state: OrderState,
}

impl Order {
    pub fn from_request(order_id: OrderId, seq: u64, created_ns: i128, req: &OrderRequest) -> Self {
        Self {
            order_id,
            exchange_id: None,
            client_id: req.client_id.clone(),
            instrument_id: req.instrument_id,
            market_id: req.market_id,
            portfolio_id: req.portfolio_id,
            side: req.side,
            order_type: req.order_type,
            tif: req.tif,
            px: req.px,
            qty: req.qty,
            seq,
            state: OrderState { px: req.px, qty: req.qty, created_ns, ..Default::default() },
        }
    }

    pub fn is_market(&self) -> bool { self.order_type == OrderType::Market }

    /// Quantity still working: pending at the gateway or resting on the market.
    pub fn pending_or_on_market(&self) -> i64 {
        if self.state.alive { (self.state.qty - self.state.filled_qty).max(0) } else { 0 }
    }
}

/// One user/algo intent. Lives for one `OrderManager::process` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub request_type: RequestType,
    pub instrument_id: InstrumentId,
    pub market_id: MarketId,
    pub portfolio_id: PortfolioId,
    pub client_id: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub px: i64,
    pub qty: i64,
    pub dependent_order_id: Option<OrderId>,
    pub valid: bool,
    pub reject_reason: Option<RejectReason>,
}

impl OrderRequest {
    pub fn create(portfolio_id: PortfolioId, side: Side, order_type: OrderType, px: i64, qty: i64) -> Self {
        Self {
            request_type: RequestType::Create,
            instrument_id: 0,
            market_id: 0,
            portfolio_id,
            client_id: None,
            side,
            order_type,
            tif: TimeInForce::Day,
            px,
            qty,
            dependent_order_id: None,
            valid: true,
            reject_reason: None,
        }
    }

    pub fn amend(portfolio_id: PortfolioId, order_id: &str, side: Side, px: i64, qty: i64) -> Self {
        Self {
            request_type: RequestType::Amend,
            dependent_order_id: Some(order_id.to_string()),
            ..Self::create(portfolio_id, side, OrderType::Limit, px, qty)
        }
    }

    pub fn cancel(portfolio_id: PortfolioId, order_id: &str, side: Side) -> Self {
        Self {
            request_type: RequestType::Cancel,
            dependent_order_id: Some(order_id.to_string()),
            ..Self::create(portfolio_id, side, OrderType::Limit, 0, 0)
        }
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> Self { self.tif = tif; self }

    pub fn reject(&mut self, reason: RejectReason) {
        self.valid = false;
        self.reject_reason = Some(reason);
    }

    pub fn entry(&self) -> OrderEntry {
        OrderEntry {
            request_type: self.request_type,
            side: self.side,
            order_type: self.order_type,
            tif: self.tif,
            px: self.px,
            qty: self.qty,
            dependent_order_id: self.dependent_order_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus { New, PartiallyFilled, Filled, Cancelled, Rejected, NoExchange }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub order_id: OrderId,
    pub algo_id: u32,
    pub status: OrderStatus,
    pub exchange_id: Option<String>,
    pub last_px: i64,
    pub exec_qty: i64,
    pub ts_ns: i128,
}

/// One outbound batch per `OrderManager::process` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSendEvent { pub instrument_id: InstrumentId, pub orders: Vec<Order> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRejectEvent { pub instrument_id: InstrumentId, pub request: OrderRequest }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind { Bid, Ask, BidSize, AskSize, Last, LastSize }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdField { pub kind: FieldKind, pub value: i64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData { pub instrument_id: InstrumentId, pub ts_ns: i128, pub fields: Vec<MdField> }

impl MarketData {
    pub fn field(&self, kind: FieldKind) -> Option<i64> {
        self.fields.iter().rev().find(|f| f.kind == kind).map(|f| f.value)
    }
}

/// Signed execution: negative qty is a sell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument_id: InstrumentId,
    pub portfolio_id: PortfolioId,
    pub order_id: OrderId,
    pub px: i64,
    pub qty: i64,
    pub ts_ns: i128,
}

/// Position snapshot applied at the start of a session. Signed volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOfDay {
    pub instrument_id: InstrumentId,
    pub portfolio_id: PortfolioId,
    pub volume: i64,
    pub cash_flow: f64,
    pub opened_ns: i128,
    pub entry_px: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEvent { pub id: TimerId, pub is_last: bool }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind { MarketData, OrderStatus, Timer, Requests, StartOfDay, OrderSend, OrderReject, Trade }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    MarketData(MarketData),
    OrderStatus(OrderStatusEvent),
    Timer(TimerEvent),
    Requests { instrument_id: InstrumentId, requests: Vec<OrderRequest> },
    StartOfDay(StartOfDay),
    OrderSend(OrderSendEvent),
    OrderReject(OrderRejectEvent),
    Trade(Trade),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::MarketData(_) => EventKind::MarketData,
            Event::OrderStatus(_) => EventKind::OrderStatus,
            Event::Timer(_) => EventKind::Timer,
            Event::Requests { .. } => EventKind::Requests,
            Event::StartOfDay(_) => EventKind::StartOfDay,
            Event::OrderSend(_) => EventKind::OrderSend,
            Event::OrderReject(_) => EventKind::OrderReject,
            Event::Trade(_) => EventKind::Trade,
        }
    }
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::MarketData,
        EventKind::OrderStatus,
        EventKind::Timer,
        EventKind::Requests,
        EventKind::StartOfDay,
        EventKind::OrderSend,
        EventKind::OrderReject,
        EventKind::Trade,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EventKind::MarketData => "market_data",
            EventKind::OrderStatus => "order_status",
            EventKind::Timer => "timer",
            EventKind::Requests => "requests",
            EventKind::StartOfDay => "start_of_day",
            EventKind::OrderSend => "order_send",
            EventKind::OrderReject => "order_reject",
            EventKind::Trade => "trade",
        }
    }
}

impl From<TimerEvent> for Event {
    fn from(ev: TimerEvent) -> Self { Event::Timer(ev) }
}
