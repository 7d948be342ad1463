use crate::breaker::RiskBreakerState;
use crate::error::{EngineError, Result};
use crate::gateway::{BrokerGateway, BrokerOrderStatus, OrderAction, OrderIntent, OrderTicket};
use crate::persist::{OrderRecord, PositionRecord, TradeRecord, TradeStore};
use crate::sizing::{PositionSizer, SizedOrder};
use crate::state::SymbolStateStore;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Bracket lifecycle. `Idle` is the absence of a record; `Cancelled` is
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketState {
    EntrySubmitted,
    EntryFilled,
    ChildrenSubmitted,
    Closed,
    Cancelled,
}

impl BracketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BracketState::Closed | BracketState::Cancelled)
    }
}

/// One entry order plus its OCA-grouped stop-loss and take-profit
/// children, keyed by the broker-assigned parent order id.
#[derive(Debug, Clone)]
pub struct BracketOrder {
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_profit: f64,
    pub oca_group: String,
    pub parent_id: i32,
    pub stop_id: Option<i32>,
    pub target_id: Option<i32>,
    pub state: BracketState,
    pub fill_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    stop_cancelled: bool,
    target_cancelled: bool,
}

impl BracketOrder {
    fn new(symbol: &str, sized: &SizedOrder, parent_id: i32) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.to_string(),
            action: sized.action,
            quantity: sized.quantity,
            entry_price: sized.entry_price,
            stop_price: sized.stop_price,
            take_profit: sized.take_profit,
            oca_group: format!("OCA-{}-{}", symbol, parent_id),
            parent_id,
            stop_id: None,
            target_id: None,
            state: BracketState::EntrySubmitted,
            fill_price: None,
            created_at: now,
            updated_at: now,
            stop_cancelled: false,
            target_cancelled: false,
        }
    }

    /// Order ids the broker should still be reporting for this bracket.
    fn in_flight_ids(&self) -> Vec<i32> {
        match self.state {
            BracketState::EntrySubmitted => vec![self.parent_id],
            BracketState::EntryFilled | BracketState::ChildrenSubmitted => {
                let mut ids = Vec::new();
                if let Some(id) = self.stop_id {
                    ids.push(id);
                }
                if let Some(id) = self.target_id {
                    ids.push(id);
                }
                ids
            }
            _ => Vec::new(),
        }
    }
}

/// All order bookkeeping, guarded by one mutex.
#[derive(Default)]
struct Books {
    /// Brackets keyed by parent order id.
    brackets: HashMap<i32, BracketOrder>,
    /// Child order id -> parent order id.
    children: HashMap<i32, i32>,
    /// Symbols with a non-terminal bracket.
    open_symbols: HashSet<String>,
    /// In-flight breaker liquidation orders, id -> symbol.
    close_orders: HashMap<i32, String>,
}

/// Owns the bracket-order state machine: submits entries, attaches OCA
/// children on fill, mirrors broker status, and reconciles against the
/// broker's open-order list.
pub struct OrderOrchestrator {
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<SymbolStateStore>,
    trade_store: Arc<dyn TradeStore>,
    sizer: PositionSizer,
    breaker_state: Arc<RiskBreakerState>,
    books: Mutex<Books>,
    /// Serializes cross-symbol passes (reconcile, cancel-all) against
    /// each other without touching per-symbol event processing.
    coordination: Mutex<()>,
}

impl OrderOrchestrator {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<SymbolStateStore>,
        trade_store: Arc<dyn TradeStore>,
        sizer: PositionSizer,
        breaker_state: Arc<RiskBreakerState>,
    ) -> Self {
        Self {
            gateway,
            store,
            trade_store,
            sizer,
            breaker_state,
            books: Mutex::new(Books::default()),
            coordination: Mutex::new(()),
        }
    }

    /// Sizes and submits the parent entry order for an intent.
    ///
    /// Rejected without side effects when the risk breaker has tripped or
    /// the symbol already has an open bracket. A submission failure
    /// releases the symbol slot and is surfaced, never retried here.
    pub async fn submit_bracket(&self, intent: &OrderIntent) -> Result<i32> {
        if self.breaker_state.is_halted() {
            warn!("{}: entry refused, risk breaker triggered", intent.symbol);
            return Err(EngineError::RiskHalted);
        }

        // Reserve the per-symbol slot before any broker I/O.
        {
            let mut books = self.books.lock().await;
            if books.open_symbols.contains(&intent.symbol) {
                return Err(EngineError::InvalidState(format!(
                    "{}: bracket already open",
                    intent.symbol
                )));
            }
            books.open_symbols.insert(intent.symbol.clone());
        }

        match self.submit_parent(intent).await {
            Ok(parent_id) => Ok(parent_id),
            Err(e) => {
                let mut books = self.books.lock().await;
                books.open_symbols.remove(&intent.symbol);
                error!("{}: bracket submission aborted: {}", intent.symbol, e);
                Err(e)
            }
        }
    }

    async fn submit_parent(&self, intent: &OrderIntent) -> Result<i32> {
        let snapshot = self.store.get(&intent.symbol).await;
        let last_close = snapshot.as_ref().and_then(|s| s.last_close.or(s.last_price));
        let shortable = snapshot.as_ref().and_then(|s| s.shortable_shares);

        let sized = self.sizer.size(intent, last_close, shortable)?;

        let ticket = match intent.entry_price {
            Some(_) => OrderTicket::limit(
                &intent.symbol,
                sized.action,
                sized.quantity,
                sized.entry_price,
            ),
            None => OrderTicket::market(&intent.symbol, sized.action, sized.quantity),
        };
        let parent_id = self.gateway.place_order(&ticket)?;

        let bracket = BracketOrder::new(&intent.symbol, &sized, parent_id);
        info!(
            "{}: bracket parent #{} {:?} {} @ {:.2} (stop {:.2}, target {:.2})",
            intent.symbol,
            parent_id,
            sized.action,
            sized.quantity,
            sized.entry_price,
            sized.stop_price,
            sized.take_profit
        );
        self.trade_store.upsert_order(&OrderRecord {
            order_id: parent_id,
            symbol: intent.symbol.clone(),
            action: sized.action,
            quantity: sized.quantity,
            status: "EntrySubmitted".to_string(),
            timestamp: Utc::now(),
        });

        let mut books = self.books.lock().await;
        books.brackets.insert(parent_id, bracket);
        Ok(parent_id)
    }

    /// Routes a broker fill. Parent fill submits both OCA children; a
    /// child fill closes the bracket and frees the symbol slot. Fills for
    /// unknown or already-closed orders are ignored.
    pub async fn on_fill(&self, order_id: i32, fill_price: f64, quantity: f64) -> Result<()> {
        enum FillKind {
            Parent(BracketOrder),
            Child { parent_id: i32 },
            Close { symbol: String },
            Unknown,
        }

        let kind = {
            let mut books = self.books.lock().await;
            if let Some(bracket) = books.brackets.get_mut(&order_id) {
                if bracket.state != BracketState::EntrySubmitted {
                    debug!("#{}: late parent fill ignored in {:?}", order_id, bracket.state);
                    FillKind::Unknown
                } else {
                    bracket.state = BracketState::EntryFilled;
                    bracket.fill_price = Some(fill_price);
                    bracket.updated_at = Utc::now();
                    FillKind::Parent(bracket.clone())
                }
            } else if let Some(parent_id) = books.children.get(&order_id).copied() {
                FillKind::Child { parent_id }
            } else if let Some(symbol) = books.close_orders.remove(&order_id) {
                FillKind::Close { symbol }
            } else {
                FillKind::Unknown
            }
        };

        match kind {
            FillKind::Parent(bracket) => {
                info!(
                    "{}: entry #{} filled @ {:.2}, submitting children",
                    bracket.symbol, order_id, fill_price
                );
                self.trade_store.insert_trade(&TradeRecord {
                    order_id,
                    symbol: bracket.symbol.clone(),
                    action: bracket.action,
                    quantity,
                    price: fill_price,
                    timestamp: Utc::now(),
                });
                self.submit_children(&bracket).await
            }
            FillKind::Child { parent_id } => {
                let mut books = self.books.lock().await;
                if let Some(bracket) = books.brackets.get_mut(&parent_id) {
                    if bracket.state.is_terminal() {
                        debug!("#{}: late child fill ignored", order_id);
                        return Ok(());
                    }
                    bracket.state = BracketState::Closed;
                    bracket.updated_at = Utc::now();
                    let symbol = bracket.symbol.clone();
                    let action = bracket.action.opposite();
                    books.open_symbols.remove(&symbol);
                    info!("{}: child #{} filled @ {:.2}, bracket closed", symbol, order_id, fill_price);
                    self.trade_store.insert_trade(&TradeRecord {
                        order_id,
                        symbol: symbol.clone(),
                        action,
                        quantity,
                        price: fill_price,
                        timestamp: Utc::now(),
                    });
                    self.trade_store.record_position(&PositionRecord {
                        symbol,
                        quantity: 0.0,
                        avg_cost: fill_price,
                        timestamp: Utc::now(),
                    });
                }
                Ok(())
            }
            FillKind::Close { symbol } => {
                info!("{}: close order #{} filled @ {:.2}", symbol, order_id, fill_price);
                self.trade_store.record_position(&PositionRecord {
                    symbol,
                    quantity: 0.0,
                    avg_cost: fill_price,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            FillKind::Unknown => {
                debug!("#{}: fill for unknown order ignored", order_id);
                Ok(())
            }
        }
    }

    /// Submits the stop-loss and take-profit legs, one-cancels-all. A
    /// failure after the first leg cancels that leg and abandons the
    /// bracket rather than leaving a naked child.
    async fn submit_children(&self, bracket: &BracketOrder) -> Result<()> {
        let child_action = bracket.action.opposite();
        let mut stop = OrderTicket::stop(
            &bracket.symbol,
            child_action,
            bracket.quantity,
            bracket.stop_price,
        );
        stop.oca_group = Some(bracket.oca_group.clone());
        stop.parent_id = Some(bracket.parent_id);
        let mut target = OrderTicket::limit(
            &bracket.symbol,
            child_action,
            bracket.quantity,
            bracket.take_profit,
        );
        target.tif = crate::gateway::TimeInForce::Gtc;
        target.oca_group = Some(bracket.oca_group.clone());
        target.parent_id = Some(bracket.parent_id);

        let stop_id = match self.gateway.place_order(&stop) {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "{}: stop-loss submission failed after entry fill: {}",
                    bracket.symbol, e
                );
                let mut books = self.books.lock().await;
                if let Some(b) = books.brackets.get_mut(&bracket.parent_id) {
                    b.state = BracketState::Cancelled;
                    b.updated_at = Utc::now();
                }
                books.open_symbols.remove(&bracket.symbol);
                return Err(e);
            }
        };
        let target_id = match self.gateway.place_order(&target) {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "{}: take-profit submission failed after stop #{}: {}",
                    bracket.symbol, stop_id, e
                );
                if let Err(cancel_err) = self.gateway.cancel_order(stop_id) {
                    error!("{}: cancel of orphan stop #{} failed: {}", bracket.symbol, stop_id, cancel_err);
                }
                let mut books = self.books.lock().await;
                if let Some(b) = books.brackets.get_mut(&bracket.parent_id) {
                    b.state = BracketState::Cancelled;
                    b.updated_at = Utc::now();
                }
                books.open_symbols.remove(&bracket.symbol);
                return Err(e);
            }
        };

        let mut books = self.books.lock().await;
        books.children.insert(stop_id, bracket.parent_id);
        books.children.insert(target_id, bracket.parent_id);
        if let Some(b) = books.brackets.get_mut(&bracket.parent_id) {
            b.stop_id = Some(stop_id);
            b.target_id = Some(target_id);
            b.state = BracketState::ChildrenSubmitted;
            b.updated_at = Utc::now();
        }
        info!(
            "{}: children working, stop #{} @ {:.2} / target #{} @ {:.2} ({})",
            bracket.symbol, stop_id, bracket.stop_price, target_id, bracket.take_profit, bracket.oca_group
        );
        Ok(())
    }

    /// Mirrors broker-reported terminal statuses into local state.
    /// Idempotent: late or duplicate events for settled brackets are
    /// dropped.
    pub async fn on_status(&self, order_id: i32, status: BrokerOrderStatus) -> Result<()> {
        match status {
            BrokerOrderStatus::Submitted => Ok(()),
            BrokerOrderStatus::Filled => {
                // A Filled status without a fill event (missed message):
                // settle at the locally known price.
                let price = {
                    let books = self.books.lock().await;
                    if let Some(b) = books.brackets.get(&order_id) {
                        Some((b.entry_price, b.quantity))
                    } else if let Some(parent) = books.children.get(&order_id) {
                        books.brackets.get(parent).map(|b| {
                            let px = if Some(order_id) == b.stop_id {
                                b.stop_price
                            } else {
                                b.take_profit
                            };
                            (px, b.quantity)
                        })
                    } else {
                        None
                    }
                };
                if let Some((price, quantity)) = price {
                    self.on_fill(order_id, price, quantity).await
                } else {
                    Ok(())
                }
            }
            BrokerOrderStatus::Cancelled => {
                let mut books = self.books.lock().await;
                if let Some(bracket) = books.brackets.get_mut(&order_id) {
                    if !bracket.state.is_terminal() {
                        bracket.state = BracketState::Cancelled;
                        bracket.updated_at = Utc::now();
                        let symbol = bracket.symbol.clone();
                        books.open_symbols.remove(&symbol);
                        info!("{}: parent #{} cancelled", symbol, order_id);
                    }
                } else if let Some(parent_id) = books.children.get(&order_id).copied() {
                    if let Some(bracket) = books.brackets.get_mut(&parent_id) {
                        if Some(order_id) == bracket.stop_id {
                            bracket.stop_cancelled = true;
                        } else if Some(order_id) == bracket.target_id {
                            bracket.target_cancelled = true;
                        }
                        // One child cancelling is normal OCA behavior
                        // after the sibling fills. Both gone without a
                        // fill means the bracket died upstream.
                        if bracket.stop_cancelled
                            && bracket.target_cancelled
                            && !bracket.state.is_terminal()
                        {
                            bracket.state = BracketState::Cancelled;
                            bracket.updated_at = Utc::now();
                            let symbol = bracket.symbol.clone();
                            books.open_symbols.remove(&symbol);
                            warn!("{}: both children cancelled, bracket dead", symbol);
                        }
                    }
                } else if let Some(symbol) = books.close_orders.remove(&order_id) {
                    warn!("{}: close order #{} cancelled", symbol, order_id);
                }
                Ok(())
            }
        }
    }

    /// Diffs local in-flight orders against the broker's live open-order
    /// list and purges records the broker no longer knows about. This is
    /// how missed events after a reconnect get resolved; nothing is ever
    /// resubmitted from here.
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.coordination.lock().await;
        let live: HashSet<i32> = self.gateway.open_order_ids()?.into_iter().collect();

        let mut books = self.books.lock().await;
        let mut purged: Vec<i32> = Vec::new();
        for (parent_id, bracket) in books.brackets.iter() {
            if bracket.state.is_terminal() {
                continue;
            }
            let in_flight = bracket.in_flight_ids();
            if !in_flight.is_empty() && in_flight.iter().all(|id| !live.contains(id)) {
                purged.push(*parent_id);
            }
        }
        for parent_id in purged {
            if let Some(bracket) = books.brackets.get_mut(&parent_id) {
                warn!(
                    "{}: bracket #{} no longer reported by broker, purging",
                    bracket.symbol, parent_id
                );
                bracket.state = BracketState::Cancelled;
                bracket.updated_at = Utc::now();
                let symbol = bracket.symbol.clone();
                books.open_symbols.remove(&symbol);
            }
        }

        let stale_closes: Vec<i32> = books
            .close_orders
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in stale_closes {
            if let Some(symbol) = books.close_orders.remove(&id) {
                debug!("{}: close order #{} settled or gone, dropping", symbol, id);
            }
        }
        Ok(())
    }

    /// Broker-side global cancel plus local teardown of every
    /// non-terminal bracket. Used by the risk breaker.
    pub async fn cancel_all(&self) -> Result<()> {
        let _guard = self.coordination.lock().await;
        self.gateway.cancel_all()?;
        let mut books = self.books.lock().await;
        for bracket in books.brackets.values_mut() {
            if !bracket.state.is_terminal() {
                bracket.state = BracketState::Cancelled;
                bracket.updated_at = Utc::now();
            }
        }
        books.open_symbols.clear();
        info!("global cancel issued, all local brackets torn down");
        Ok(())
    }

    /// Submits a breaker liquidation order and tracks it so repeated
    /// passes never double-close one position.
    pub async fn submit_close_order(&self, ticket: &OrderTicket) -> Result<i32> {
        let order_id = self.gateway.place_order(ticket)?;
        let mut books = self.books.lock().await;
        books.close_orders.insert(order_id, ticket.symbol.clone());
        self.trade_store.upsert_order(&OrderRecord {
            order_id,
            symbol: ticket.symbol.clone(),
            action: ticket.action,
            quantity: ticket.quantity,
            status: "CloseSubmitted".to_string(),
            timestamp: Utc::now(),
        });
        info!("{}: liquidation order #{} submitted", ticket.symbol, order_id);
        Ok(order_id)
    }

    /// Guard serializing cross-symbol passes. Reconcile and cancel-all
    /// take it internally; the breaker's liquidation pass holds it for
    /// the duration of a pass.
    pub(crate) async fn coordination_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.coordination.lock().await
    }

    pub async fn has_open_bracket(&self, symbol: &str) -> bool {
        self.books.lock().await.open_symbols.contains(symbol)
    }

    pub async fn closing_in_flight(&self, symbol: &str) -> bool {
        self.books
            .lock()
            .await
            .close_orders
            .values()
            .any(|s| s == symbol)
    }

    pub async fn close_orders_in_flight(&self) -> usize {
        self.books.lock().await.close_orders.len()
    }

    pub async fn bracket(&self, parent_id: i32) -> Option<BracketOrder> {
        self.books.lock().await.brackets.get(&parent_id).cloned()
    }
}
