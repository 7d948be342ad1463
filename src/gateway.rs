use crate::bars::Bar;
use crate::error::Result;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn opposite(&self) -> Self {
        match self {
            OrderAction::Buy => OrderAction::Sell,
            OrderAction::Sell => OrderAction::Buy,
        }
    }
}

/// A trading intent handed in by the (out-of-scope) trigger layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub action: OrderAction,
    /// Entry limit price; None means enter at the latest known price.
    pub entry_price: Option<f64>,
    pub stop_loss: f64,
    pub risk_pct: f64,
    pub reward_ratio: f64,
    pub account_balance: f64,
    pub timeframe: String,
}

/// Execution style for a single order leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderKind {
    Market,
    Limit { price: f64 },
    Stop { stop_price: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Day,
    Gtc,
}

/// Broker-agnostic order request. The ibapi mapping happens inside the
/// gateway implementation so the core never touches wire types.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTicket {
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: f64,
    pub kind: OrderKind,
    pub tif: TimeInForce,
    /// One-cancels-all group shared by bracket children.
    pub oca_group: Option<String>,
    pub parent_id: Option<i32>,
    /// Marks breaker liquidation orders so reconciliation can tell them
    /// apart from bracket legs.
    pub closing: bool,
}

impl OrderTicket {
    pub fn market(symbol: &str, action: OrderAction, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            action,
            quantity,
            kind: OrderKind::Market,
            tif: TimeInForce::Day,
            oca_group: None,
            parent_id: None,
            closing: false,
        }
    }

    pub fn limit(symbol: &str, action: OrderAction, quantity: f64, price: f64) -> Self {
        Self {
            kind: OrderKind::Limit { price },
            ..Self::market(symbol, action, quantity)
        }
    }

    pub fn stop(symbol: &str, action: OrderAction, quantity: f64, stop_price: f64) -> Self {
        Self {
            kind: OrderKind::Stop { stop_price },
            tif: TimeInForce::Gtc,
            ..Self::market(symbol, action, quantity)
        }
    }
}

/// Events pumped from the broker into per-symbol dispatcher channels.
#[derive(Debug, Clone)]
pub struct BarEvent {
    pub symbol: String,
    pub bar: Bar,
}

#[derive(Debug, Clone)]
pub struct TickEvent {
    pub symbol: String,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub mark: Option<f64>,
    pub shortable_shares: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PnlEvent {
    pub daily_pnl: f64,
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
}

/// Broker-reported order lifecycle events, normalized.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    Fill {
        order_id: i32,
        fill_price: f64,
        quantity: f64,
    },
    Status {
        order_id: i32,
        status: BrokerOrderStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOrderStatus {
    Submitted,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ContractInfo {
    pub symbol: String,
    pub contract_id: i32,
    pub exchange: String,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub quantity: f64,
    pub avg_cost: f64,
}

/// The broker capability the engine is written against. The live
/// implementation is `TwsGateway`; tests inject a mockall mock.
///
/// Calls are the engine's only blocking points and must never be made
/// while a symbol lock is held.
#[cfg_attr(test, automock)]
pub trait BrokerGateway: Send + Sync {
    /// Resolve a symbol to a tradable contract.
    fn qualify_contract(&self, symbol: &str) -> Result<ContractInfo>;

    /// Start a tick subscription; events land on `tx` in arrival order.
    fn subscribe_market_data(&self, symbol: &str, tx: mpsc::Sender<TickEvent>) -> Result<()>;

    /// Start a native 5-second bar subscription.
    fn subscribe_realtime_bars(&self, symbol: &str, tx: mpsc::Sender<BarEvent>) -> Result<()>;

    /// Submit an order, returning the broker-assigned id.
    fn place_order(&self, ticket: &OrderTicket) -> Result<i32>;

    fn cancel_order(&self, order_id: i32) -> Result<()>;

    /// Broker-side cancel of every working order.
    fn cancel_all(&self) -> Result<()>;

    /// Ids of orders the broker currently reports as open.
    fn open_order_ids(&self) -> Result<Vec<i32>>;

    /// Historical 5-second-equivalent bars for indicator warmup.
    fn historical_bars(&self, symbol: &str, duration_days: i32) -> Result<Vec<Bar>>;

    /// Account-level PnL stream.
    fn stream_pnl(&self, account: &str, tx: mpsc::Sender<PnlEvent>) -> Result<()>;

    /// Order status / fill stream shared across all orders.
    fn stream_order_events(&self, tx: mpsc::Sender<OrderEvent>) -> Result<()>;

    fn positions(&self) -> Result<Vec<PositionInfo>>;

    /// True during regular trading hours; drives market-vs-limit choice
    /// for liquidation orders.
    fn is_market_open(&self) -> bool;
}
