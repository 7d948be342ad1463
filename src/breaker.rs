use crate::error::Result;
use crate::gateway::{BrokerGateway, OrderAction, OrderTicket};
use crate::orchestrator::OrderOrchestrator;
use crate::state::SymbolStateStore;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Process-wide breaker state. Created once at startup, mutated only by
/// `PnLRiskBreaker`, read by the orchestrator's entry gate.
pub struct RiskBreakerState {
    armed: AtomicBool,
    triggered: AtomicBool,
    threshold: f64,
    last_pass: Mutex<Option<DateTime<Utc>>>,
}

impl RiskBreakerState {
    pub fn new(threshold: f64) -> Self {
        Self {
            armed: AtomicBool::new(true),
            triggered: AtomicBool::new(false),
            threshold,
            last_pass: Mutex::new(None),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// New entries are suppressed exactly when armed and triggered.
    pub fn is_halted(&self) -> bool {
        self.is_armed() && self.is_triggered()
    }

    pub async fn last_pass(&self) -> Option<DateTime<Utc>> {
        *self.last_pass.lock().await
    }

    pub(crate) fn trip(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn rearm(&self) {
        self.triggered.store(false, Ordering::SeqCst);
    }

    async fn mark_pass(&self) {
        *self.last_pass.lock().await = Some(Utc::now());
    }
}

/// Daily-loss circuit breaker.
///
/// `Armed -> Triggered -> (liquidation passes) -> Armed` once flat. Each
/// PnL update while triggered drives at most one liquidation order, so a
/// book of many positions unwinds over several updates instead of as an
/// order storm.
pub struct PnLRiskBreaker {
    state: Arc<RiskBreakerState>,
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<SymbolStateStore>,
    orchestrator: Arc<OrderOrchestrator>,
}

impl PnLRiskBreaker {
    pub fn new(
        state: Arc<RiskBreakerState>,
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<SymbolStateStore>,
        orchestrator: Arc<OrderOrchestrator>,
    ) -> Self {
        Self {
            state,
            gateway,
            store,
            orchestrator,
        }
    }

    /// Consumes one daily-PnL observation. Trips the breaker on first
    /// breach (global cancel plus the first liquidation order); while
    /// tripped, each call advances the unwind by one symbol and re-arms
    /// once every position is flat with no close order in flight.
    pub async fn on_pnl_update(&self, daily_pnl: f64) -> Result<()> {
        if !self.state.is_armed() {
            return Ok(());
        }

        if !self.state.is_triggered() {
            if daily_pnl <= self.state.threshold() {
                warn!(
                    "daily PnL {:.2} breached threshold {:.2}: tripping breaker",
                    daily_pnl,
                    self.state.threshold()
                );
                self.state.trip();
                self.orchestrator.cancel_all().await?;
                self.liquidation_pass().await?;
            }
            return Ok(());
        }

        // Already triggered: check for flat first, otherwise keep
        // unwinding one symbol at a time.
        let open: Vec<_> = self
            .gateway
            .positions()?
            .into_iter()
            .filter(|p| p.quantity != 0.0)
            .collect();
        if open.is_empty() && self.orchestrator.close_orders_in_flight().await == 0 {
            info!("book flat, breaker re-armed");
            self.state.rearm();
            return Ok(());
        }
        self.liquidation_pass().await
    }

    /// Closes at most one open position: the first without an in-flight
    /// close order. Market order during regular hours, otherwise a limit
    /// at the best known reference price.
    async fn liquidation_pass(&self) -> Result<()> {
        // Serialize against reconcile and cancel-all passes.
        let _guard = self.orchestrator.coordination_lock().await;
        self.state.mark_pass().await;

        let positions = self.gateway.positions()?;
        for position in positions.iter().filter(|p| p.quantity != 0.0) {
            if self.orchestrator.closing_in_flight(&position.symbol).await {
                continue;
            }

            let action = if position.quantity > 0.0 {
                OrderAction::Sell
            } else {
                OrderAction::Buy
            };
            let quantity = position.quantity.abs();

            let mut ticket = if self.gateway.is_market_open() {
                OrderTicket::market(&position.symbol, action, quantity)
            } else {
                let price = self
                    .store
                    .get(&position.symbol)
                    .await
                    .and_then(|s| s.reference_price());
                match price {
                    Some(p) => OrderTicket::limit(&position.symbol, action, quantity, p),
                    None => {
                        warn!(
                            "{}: no price for off-hours liquidation, skipping this pass",
                            position.symbol
                        );
                        continue;
                    }
                }
            };
            ticket.closing = true;

            self.orchestrator.submit_close_order(&ticket).await?;
            // One symbol per pass; the next PnL update drives the next.
            return Ok(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::gateway::{MockBrokerGateway, OrderKind, PositionInfo};
    use crate::persist::LogTradeStore;
    use crate::sizing::PositionSizer;
    use crate::state::SnapshotPatch;

    fn risk_config() -> RiskConfig {
        RiskConfig {
            daily_loss_threshold: -300.0,
            default_risk_pct: 1.0,
            default_reward_ratio: 2.0,
            commission_reserve: 0.0,
            gap_threshold_pct: 0.4,
            shortable_multiple: 5.0,
        }
    }

    struct Fixture {
        breaker: PnLRiskBreaker,
        state: Arc<RiskBreakerState>,
        store: Arc<SymbolStateStore>,
        orchestrator: Arc<OrderOrchestrator>,
    }

    fn breaker_with(gateway: MockBrokerGateway) -> Fixture {
        let gateway: Arc<dyn BrokerGateway> = Arc::new(gateway);
        let state = Arc::new(RiskBreakerState::new(-300.0));
        let store = Arc::new(SymbolStateStore::new());
        let orchestrator = Arc::new(OrderOrchestrator::new(
            gateway.clone(),
            store.clone(),
            Arc::new(LogTradeStore),
            PositionSizer::new(risk_config()),
            state.clone(),
        ));
        Fixture {
            breaker: PnLRiskBreaker::new(
                state.clone(),
                gateway,
                store.clone(),
                orchestrator.clone(),
            ),
            state,
            store,
            orchestrator,
        }
    }

    fn long(symbol: &str, quantity: f64) -> PositionInfo {
        PositionInfo {
            symbol: symbol.to_string(),
            quantity,
            avg_cost: 100.0,
        }
    }

    #[tokio::test]
    async fn test_loss_above_threshold_does_not_trip() {
        // Threshold -300: -250 is fine, nothing is cancelled.
        let gateway = MockBrokerGateway::new();
        let f = breaker_with(gateway);

        f.breaker.on_pnl_update(-250.0).await.unwrap();
        assert!(!f.state.is_triggered());
        assert!(!f.state.is_halted());
    }

    #[tokio::test]
    async fn test_breach_trips_cancels_and_starts_liquidation() {
        let mut gateway = MockBrokerGateway::new();
        gateway.expect_cancel_all().times(1).returning(|| Ok(()));
        gateway
            .expect_positions()
            .returning(|| Ok(vec![long("AAPL", 100.0)]));
        gateway.expect_is_market_open().returning(|| true);
        gateway
            .expect_place_order()
            .times(1)
            .withf(|t| {
                t.symbol == "AAPL"
                    && t.action == OrderAction::Sell
                    && t.quantity == 100.0
                    && t.closing
                    && matches!(t.kind, OrderKind::Market)
            })
            .returning(|_| Ok(501));
        let f = breaker_with(gateway);

        f.breaker.on_pnl_update(-350.0).await.unwrap();
        assert!(f.state.is_triggered());
        assert!(f.state.is_halted());
        assert!(f.state.last_pass().await.is_some());
    }

    #[tokio::test]
    async fn test_one_close_order_per_pass() {
        let mut gateway = MockBrokerGateway::new();
        gateway.expect_cancel_all().times(1).returning(|| Ok(()));
        gateway
            .expect_positions()
            .returning(|| Ok(vec![long("AAPL", 100.0), long("MSFT", 50.0)]));
        gateway.expect_is_market_open().returning(|| true);
        let mut next_id = 500;
        gateway.expect_place_order().times(2).returning(move |_| {
            next_id += 1;
            Ok(next_id)
        });
        let f = breaker_with(gateway);

        // Trip: first pass closes AAPL only.
        f.breaker.on_pnl_update(-400.0).await.unwrap();
        // Second pass: AAPL close in flight, MSFT gets its order.
        f.breaker.on_pnl_update(-400.0).await.unwrap();
        // Third pass: both in flight, no further orders (mock would
        // panic on a third place_order).
        f.breaker.on_pnl_update(-400.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_rearms_once_flat_with_nothing_in_flight() {
        let mut gateway = MockBrokerGateway::new();
        gateway.expect_cancel_all().times(1).returning(|| Ok(()));
        let mut calls = 0;
        gateway.expect_positions().returning(move || {
            calls += 1;
            if calls == 1 {
                // During the trip pass there is still an open position...
                Ok(vec![long("AAPL", 100.0)])
            } else {
                // ...afterwards the book is flat.
                Ok(vec![])
            }
        });
        gateway.expect_is_market_open().returning(|| true);
        gateway.expect_place_order().times(1).returning(|_| Ok(501));
        gateway
            .expect_open_order_ids()
            .returning(|| Ok(vec![]));
        let f = breaker_with(gateway);

        f.breaker.on_pnl_update(-400.0).await.unwrap();
        assert!(f.state.is_halted());

        // The close order is still tracked; reconcile clears it after the
        // broker stops reporting it, then the next update re-arms.
        f.orchestrator.reconcile().await.unwrap();
        f.breaker.on_pnl_update(-100.0).await.unwrap();
        assert!(!f.state.is_triggered());
        assert!(!f.state.is_halted());
    }

    #[tokio::test]
    async fn test_liquidation_pass_serializes_on_coordination_lock() {
        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_positions()
            .returning(|| Ok(vec![long("AAPL", 100.0)]));
        gateway.expect_is_market_open().returning(|| true);
        let placed = Arc::new(AtomicBool::new(false));
        let seen = placed.clone();
        gateway.expect_place_order().times(1).returning(move |_| {
            seen.store(true, Ordering::SeqCst);
            Ok(501)
        });
        let f = breaker_with(gateway);
        f.state.trip();

        // While another cross-symbol pass holds the coordination lock,
        // the liquidation pass must not place its order.
        let guard = f.orchestrator.coordination_lock().await;
        let breaker = f.breaker;
        let handle = tokio::spawn(async move {
            breaker.on_pnl_update(-400.0).await.unwrap();
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!placed.load(Ordering::SeqCst));

        drop(guard);
        handle.await.unwrap();
        assert!(placed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_off_hours_liquidation_uses_limit_at_reference_price() {
        let mut gateway = MockBrokerGateway::new();
        gateway.expect_cancel_all().times(1).returning(|| Ok(()));
        gateway
            .expect_positions()
            .returning(|| Ok(vec![long("AAPL", -40.0)]));
        gateway.expect_is_market_open().returning(|| false);
        gateway
            .expect_place_order()
            .times(1)
            .withf(|t| {
                t.action == OrderAction::Buy
                    && t.quantity == 40.0
                    && matches!(t.kind, OrderKind::Limit { price } if price == 99.5)
            })
            .returning(|_| Ok(501));
        let f = breaker_with(gateway);
        f.store
            .update(
                "AAPL",
                SnapshotPatch {
                    mark_price: Some(99.5),
                    last_price: Some(99.2),
                    ..Default::default()
                },
            )
            .await;

        f.breaker.on_pnl_update(-400.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_off_hours_without_price_skips_symbol() {
        let mut gateway = MockBrokerGateway::new();
        gateway.expect_cancel_all().times(1).returning(|| Ok(()));
        gateway
            .expect_positions()
            .returning(|| Ok(vec![long("AAPL", 100.0)]));
        gateway.expect_is_market_open().returning(|| false);
        // No snapshot price anywhere: no order may be placed.
        let f = breaker_with(gateway);

        f.breaker.on_pnl_update(-400.0).await.unwrap();
        assert!(f.state.is_triggered());
    }
}
