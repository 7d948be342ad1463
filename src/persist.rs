use crate::gateway::OrderAction;
use chrono::{DateTime, Utc};
use log::info;

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: i32,
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: f64,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub order_id: i32,
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub symbol: String,
    pub quantity: f64,
    pub avg_cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Persistence boundary. Real storage lives outside this crate; the
/// engine only emits records through this trait.
pub trait TradeStore: Send + Sync {
    fn upsert_order(&self, order: &OrderRecord);
    fn insert_trade(&self, trade: &TradeRecord);
    fn record_position(&self, position: &PositionRecord);
}

/// Default store: writes records to the log and nothing else.
pub struct LogTradeStore;

impl TradeStore for LogTradeStore {
    fn upsert_order(&self, order: &OrderRecord) {
        info!(
            "order #{} {} {:?} {} -> {}",
            order.order_id, order.symbol, order.action, order.quantity, order.status
        );
    }

    fn insert_trade(&self, trade: &TradeRecord) {
        info!(
            "trade #{} {} {:?} {} @ {:.2}",
            trade.order_id, trade.symbol, trade.action, trade.quantity, trade.price
        );
    }

    fn record_position(&self, position: &PositionRecord) {
        info!(
            "position {} {} @ {:.2}",
            position.symbol, position.quantity, position.avg_cost
        );
    }
}
