use crate::bars::Bar;
use crate::config::TwsConfig;
use crate::error::{EngineError, Result};
use crate::gateway::{
    BarEvent, BrokerGateway, BrokerOrderStatus, ContractInfo, OrderAction, OrderEvent, OrderKind,
    OrderTicket, PnlEvent, PositionInfo, TickEvent, TimeInForce,
};
use chrono::{DateTime, Datelike, Timelike, Utc};
use ibapi::Client;
use ibapi::accounts::PositionUpdate;
use ibapi::market_data::historical::{
    BarSize as HistoricalBarSize, WhatToShow as HistoricalWhatToShow,
};
use ibapi::market_data::realtime::{BarSize as RealtimeBarSize, WhatToShow as RealtimeWhatToShow};
use ibapi::orders::{Order, Orders, PlaceOrder};
use ibapi::prelude::*;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn broker_err(e: ibapi::Error) -> EngineError {
    EngineError::Transient(e.to_string())
}

/// Live gateway over the TWS / IB Gateway socket API.
///
/// Subscription pumps run on dedicated threads because the ibapi
/// subscription iterators block; events are forwarded into tokio channels
/// with `blocking_send`.
pub struct TwsGateway {
    client: Arc<Client>,
    config: TwsConfig,
    contracts: Mutex<HashMap<String, Contract>>,
    order_events: Arc<Mutex<Option<mpsc::Sender<OrderEvent>>>>,
    /// Tick consumers fed from the single 5s bar subscription per symbol.
    tick_txs: Arc<Mutex<HashMap<String, mpsc::Sender<TickEvent>>>>,
}

impl TwsGateway {
    /// Connects with bounded retry. Exhausting the attempt budget is
    /// fatal: the engine cannot manage live risk without a broker link.
    pub async fn connect(config: TwsConfig) -> Result<Self> {
        let address = format!("{}:{}", config.host, config.port);
        let mut attempt = 0u32;
        let client = loop {
            attempt += 1;
            match Client::connect(&address, config.client_id) {
                Ok(client) => break client,
                Err(e) if attempt < config.max_reconnect_attempts => {
                    warn!(
                        "connect to TWS at {} failed (attempt {}/{}): {}",
                        address, attempt, config.max_reconnect_attempts, e
                    );
                    tokio::time::sleep(Duration::from_secs(config.reconnect_backoff_secs)).await;
                }
                Err(e) => {
                    return Err(EngineError::Fatal(format!(
                        "TWS unreachable after {} attempts: {}",
                        attempt, e
                    )));
                }
            }
        };
        info!("connected to TWS at {}", address);

        Ok(Self {
            client: Arc::new(client),
            config,
            contracts: Mutex::new(HashMap::new()),
            order_events: Arc::new(Mutex::new(None)),
            tick_txs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn account(&self) -> &str {
        &self.config.account
    }

    fn contract_for(&self, symbol: &str) -> Contract {
        let contracts = self.contracts.lock().unwrap();
        contracts
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Contract::stock(symbol))
    }

    fn build_order(ticket: &OrderTicket) -> Order {
        let mut order = Order::default();
        order.action = match ticket.action {
            OrderAction::Buy => Action::Buy,
            OrderAction::Sell => Action::Sell,
        };
        order.total_quantity = ticket.quantity;
        match ticket.kind {
            OrderKind::Market => {
                order.order_type = "MKT".to_string();
            }
            OrderKind::Limit { price } => {
                order.order_type = "LMT".to_string();
                order.limit_price = Some(price);
            }
            OrderKind::Stop { stop_price } => {
                order.order_type = "STP".to_string();
                order.aux_price = Some(stop_price);
            }
        }
        order.tif = match ticket.tif {
            TimeInForce::Day => "DAY",
            TimeInForce::Gtc => "GTC",
        }
        .to_string();
        if let Some(group) = &ticket.oca_group {
            order.oca_group = group.clone();
            order.oca_type = 1; // cancel remaining legs with block
        }
        if let Some(parent_id) = ticket.parent_id {
            order.parent_id = parent_id;
        }
        order
    }

    fn forward_order_events(
        tx: Arc<Mutex<Option<mpsc::Sender<OrderEvent>>>>,
        event: OrderEvent,
    ) {
        let tx = tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            if tx.blocking_send(event).is_err() {
                warn!("order event receiver dropped");
            }
        }
    }
}

impl BrokerGateway for TwsGateway {
    fn qualify_contract(&self, symbol: &str) -> Result<ContractInfo> {
        let mut contract = Contract::stock(symbol);
        contract.exchange = "SMART".to_string();
        contract.currency = "USD".to_string();

        let details = self.client.contract_details(&contract).map_err(broker_err)?;
        let resolved = details.first().ok_or_else(|| {
            EngineError::InvalidState(format!("{}: contract did not resolve", symbol))
        })?;

        let qualified = resolved.contract.clone();
        let info = ContractInfo {
            symbol: symbol.to_string(),
            contract_id: qualified.contract_id,
            exchange: qualified.exchange.clone(),
            currency: qualified.currency.clone(),
        };
        self.contracts
            .lock()
            .unwrap()
            .insert(symbol.to_string(), qualified);
        info!("{}: qualified contract id {}", symbol, info.contract_id);
        Ok(info)
    }

    fn subscribe_market_data(&self, symbol: &str, tx: mpsc::Sender<TickEvent>) -> Result<()> {
        // Top-of-book is approximated from the 5s trade bars, the same
        // subscription that drives the aggregator; registering here just
        // taps that one stream. Good enough for reference pricing, not an
        // order-book feed.
        self.tick_txs
            .lock()
            .unwrap()
            .insert(symbol.to_string(), tx);
        Ok(())
    }

    fn subscribe_realtime_bars(&self, symbol: &str, tx: mpsc::Sender<BarEvent>) -> Result<()> {
        let contract = self.contract_for(symbol);
        let client = self.client.clone();
        let tick_txs = self.tick_txs.clone();
        let symbol = symbol.to_string();

        std::thread::spawn(move || {
            match client.realtime_bars(
                &contract,
                RealtimeBarSize::Sec5,
                RealtimeWhatToShow::Trades,
                false,
            ) {
                Ok(subscription) => {
                    info!("{}: realtime 5s bars subscribed", symbol);
                    for bar in subscription {
                        let timestamp = DateTime::from_timestamp(bar.date.unix_timestamp(), 0)
                            .unwrap_or_else(Utc::now);
                        let event = BarEvent {
                            symbol: symbol.clone(),
                            bar: Bar {
                                timestamp,
                                open: bar.open,
                                high: bar.high,
                                low: bar.low,
                                close: bar.close,
                                volume: bar.volume,
                            },
                        };
                        if tx.blocking_send(event).is_err() {
                            break;
                        }

                        let tick_tx = tick_txs.lock().unwrap().get(&symbol).cloned();
                        if let Some(tick_tx) = tick_tx {
                            let tick = TickEvent {
                                symbol: symbol.clone(),
                                last: Some(bar.close),
                                bid: Some(bar.close - 0.01),
                                ask: Some(bar.close + 0.01),
                                mark: None,
                                shortable_shares: None,
                                timestamp: Utc::now(),
                            };
                            if tick_tx.blocking_send(tick).is_err() {
                                tick_txs.lock().unwrap().remove(&symbol);
                            }
                        }
                    }
                    info!("{}: realtime bar stream ended", symbol);
                }
                Err(e) => error!("{}: realtime bars subscription failed: {}", symbol, e),
            }
        });
        Ok(())
    }

    fn place_order(&self, ticket: &OrderTicket) -> Result<i32> {
        let contract = self.contract_for(&ticket.symbol);
        let order = Self::build_order(ticket);
        let order_id = self.client.next_order_id();
        info!(
            "{}: placing {:?} {} x{} as #{}",
            ticket.symbol, ticket.action, order.order_type, ticket.quantity, order_id
        );

        // The place_order subscription borrows the client, so submission
        // and the status pump both live on the spawned thread. A refused
        // submission surfaces as a Cancelled status for this id.
        let client = self.client.clone();
        let events = self.order_events.clone();
        let symbol = ticket.symbol.clone();
        std::thread::spawn(move || {
            let subscription = match client.place_order(order_id, &contract, &order) {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!("{}: submission of #{} refused: {}", symbol, order_id, e);
                    Self::forward_order_events(
                        events,
                        OrderEvent::Status {
                            order_id,
                            status: BrokerOrderStatus::Cancelled,
                        },
                    );
                    return;
                }
            };
            for update in subscription {
                if let PlaceOrder::OrderStatus(status) = update {
                    let event = match status.status.as_str() {
                        "Filled" if status.remaining == 0.0 => Some(OrderEvent::Fill {
                            order_id: status.order_id,
                            fill_price: status.average_fill_price,
                            quantity: status.filled,
                        }),
                        "Submitted" | "PreSubmitted" => Some(OrderEvent::Status {
                            order_id: status.order_id,
                            status: BrokerOrderStatus::Submitted,
                        }),
                        "Cancelled" | "ApiCancelled" | "Inactive" => Some(OrderEvent::Status {
                            order_id: status.order_id,
                            status: BrokerOrderStatus::Cancelled,
                        }),
                        _ => None,
                    };
                    if let Some(event) = event {
                        Self::forward_order_events(events.clone(), event);
                    }
                }
            }
        });

        Ok(order_id)
    }

    fn cancel_order(&self, order_id: i32) -> Result<()> {
        let _ = self
            .client
            .cancel_order(order_id, "")
            .map_err(broker_err)?;
        info!("cancel requested for #{}", order_id);
        Ok(())
    }

    fn cancel_all(&self) -> Result<()> {
        self.client.global_cancel().map_err(broker_err)?;
        warn!("global cancel issued");
        Ok(())
    }

    fn open_order_ids(&self) -> Result<Vec<i32>> {
        let subscription = self.client.all_open_orders().map_err(broker_err)?;
        let mut ids = Vec::new();
        while let Some(update) = subscription.next_timeout(Duration::from_secs(2)) {
            if let Orders::OrderData(data) = update {
                ids.push(data.order_id);
            }
        }
        Ok(ids)
    }

    fn historical_bars(&self, symbol: &str, duration_days: i32) -> Result<Vec<Bar>> {
        let contract = self.contract_for(symbol);
        let historical = self
            .client
            .historical_data(
                &contract,
                None,
                duration_days.days(),
                HistoricalBarSize::Sec5,
                HistoricalWhatToShow::Trades,
                true,
            )
            .map_err(broker_err)?;

        let bars = historical
            .bars
            .iter()
            .map(|bar| Bar {
                timestamp: DateTime::from_timestamp(bar.date.unix_timestamp(), 0)
                    .unwrap_or_else(Utc::now),
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            })
            .collect::<Vec<_>>();
        info!("{}: loaded {} historical bars", symbol, bars.len());
        Ok(bars)
    }

    fn stream_pnl(&self, account: &str, tx: mpsc::Sender<PnlEvent>) -> Result<()> {
        let client = self.client.clone();
        let account = account.to_string();

        std::thread::spawn(move || match client.pnl(&account, None) {
            Ok(subscription) => {
                for pnl in subscription {
                    let event = PnlEvent {
                        daily_pnl: pnl.daily_pnl,
                        unrealized_pnl: pnl.unrealized_pnl,
                        realized_pnl: pnl.realized_pnl,
                    };
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                info!("PnL stream ended for {}", account);
            }
            Err(e) => error!("PnL subscription failed for {}: {}", account, e),
        });
        Ok(())
    }

    fn stream_order_events(&self, tx: mpsc::Sender<OrderEvent>) -> Result<()> {
        *self.order_events.lock().unwrap() = Some(tx);
        Ok(())
    }

    fn positions(&self) -> Result<Vec<PositionInfo>> {
        let subscription = self.client.positions().map_err(broker_err)?;
        let mut positions = Vec::new();
        while let Some(update) = subscription.next() {
            match update {
                PositionUpdate::Position(position) => {
                    positions.push(PositionInfo {
                        symbol: position.contract.symbol.clone(),
                        quantity: position.position,
                        avg_cost: position.average_cost,
                    });
                }
                PositionUpdate::PositionEnd => {
                    subscription.cancel();
                    break;
                }
            }
        }
        Ok(positions)
    }

    fn is_market_open(&self) -> bool {
        // US equities regular session approximated in UTC (14:30-21:00,
        // Mon-Fri). DST shifts this by an hour; liquidation falls back to
        // limit orders on the conservative side of the boundary.
        let now = Utc::now();
        let weekday = now.weekday().number_from_monday();
        if weekday > 5 {
            return false;
        }
        let minutes = now.hour() * 60 + now.minute();
        (14 * 60 + 30..21 * 60).contains(&minutes)
    }
}
