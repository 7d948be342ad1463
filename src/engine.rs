use crate::bars::{Bar, BarAggregator, TimeFrame};
use crate::breaker::{PnLRiskBreaker, RiskBreakerState};
use crate::config::TradingConfig;
use crate::error::Result;
use crate::gateway::{BarEvent, BrokerGateway, OrderEvent, OrderIntent, PnlEvent, TickEvent};
use crate::orchestrator::OrderOrchestrator;
use crate::persist::TradeStore;
use crate::sizing::PositionSizer;
use crate::state::{SnapshotPatch, SymbolStateStore};
use crate::vstop::VolatilityStopEngine;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

/// Per-symbol bar pipeline: resamples the 5s feed and steps the
/// volatility stop once per completed bucket, caching results in the
/// symbol store. Owned by exactly one dispatcher task, so same-symbol
/// bars are processed strictly in arrival order with no shared locks.
pub struct SymbolPipeline {
    symbol: String,
    timeframes: Vec<TimeFrame>,
    atr_length: usize,
    atr_factor: f64,
    aggregator: BarAggregator,
    vstops: VolatilityStopEngine,
    /// Bucket timestamps already fed to the indicator, per timeframe.
    emitted: HashMap<TimeFrame, i64>,
}

impl SymbolPipeline {
    pub fn new(
        symbol: &str,
        timeframes: Vec<TimeFrame>,
        atr_length: usize,
        atr_factor: f64,
        history_bound: usize,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframes: timeframes.clone(),
            atr_length,
            atr_factor,
            aggregator: BarAggregator::new(timeframes, history_bound),
            vstops: VolatilityStopEngine::new(),
            emitted: HashMap::new(),
        }
    }

    /// Warm the aggregator and indicator from historical bars before live
    /// data arrives.
    pub async fn seed(&mut self, bars: Vec<Bar>, store: &SymbolStateStore) {
        for bar in bars {
            self.on_bar(bar, store).await;
        }
    }

    pub async fn on_bar(&mut self, bar: Bar, store: &SymbolStateStore) {
        store
            .update(
                &self.symbol,
                SnapshotPatch {
                    last_close: Some(bar.close),
                    ..Default::default()
                },
            )
            .await;
        self.aggregator.feed(&self.symbol, bar);

        for tf in self.timeframes.clone() {
            let series = self.aggregator.get_bars(&self.symbol, tf);
            // The final element is the open bucket; everything before it
            // is final. Step the indicator over closed buckets only so a
            // bucket is never counted twice.
            if series.len() < 2 {
                continue;
            }
            let last_emitted = self.emitted.get(&tf).copied().unwrap_or(i64::MIN);
            for closed in &series[..series.len() - 1] {
                let ts = closed.timestamp.timestamp();
                if ts <= last_emitted {
                    continue;
                }
                let out =
                    self.vstops
                        .update(&self.symbol, tf, closed, self.atr_length, self.atr_factor);
                store.set_indicator(&self.symbol, tf, out).await;
                self.emitted.insert(tf, ts);
            }
        }
    }

    pub fn bars(&self, timeframe: TimeFrame) -> Vec<Bar> {
        self.aggregator.get_bars(&self.symbol, timeframe)
    }
}

/// Owns the full decision/control loop: per-symbol dispatchers, the PnL
/// and order-status consumers, the reconcile timer, and the intent
/// intake.
pub struct Engine {
    config: TradingConfig,
    gateway: Arc<dyn BrokerGateway>,
    pub store: Arc<SymbolStateStore>,
    pub orchestrator: Arc<OrderOrchestrator>,
    pub breaker: Arc<PnLRiskBreaker>,
    pub breaker_state: Arc<RiskBreakerState>,
}

impl Engine {
    pub fn new(
        config: TradingConfig,
        gateway: Arc<dyn BrokerGateway>,
        trade_store: Arc<dyn TradeStore>,
    ) -> Self {
        let store = Arc::new(SymbolStateStore::new());
        let breaker_state = Arc::new(RiskBreakerState::new(config.risk_config.daily_loss_threshold));
        let sizer = PositionSizer::new(config.risk_config.clone());
        let orchestrator = Arc::new(OrderOrchestrator::new(
            gateway.clone(),
            store.clone(),
            trade_store,
            sizer,
            breaker_state.clone(),
        ));
        let breaker = Arc::new(PnLRiskBreaker::new(
            breaker_state.clone(),
            gateway.clone(),
            store.clone(),
            orchestrator.clone(),
        ));
        Self {
            config,
            gateway,
            store,
            orchestrator,
            breaker,
            breaker_state,
        }
    }

    /// Wires every stream and spawns the consumer tasks. Returns once
    /// subscriptions are in place; the spawned tasks run until their
    /// channels close.
    pub async fn start(&self, intent_rx: mpsc::Receiver<OrderIntent>) -> Result<()> {
        let timeframes = self
            .config
            .engine_config
            .timeframes
            .iter()
            .map(|l| TimeFrame::parse(l))
            .collect::<Result<Vec<_>>>()?;

        for symbol in &self.config.engine_config.symbols {
            match self.gateway.qualify_contract(symbol) {
                Ok(contract) => {
                    self.store
                        .update(
                            symbol,
                            SnapshotPatch {
                                contract_id: Some(contract.contract_id),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                Err(e) => {
                    error!("{}: contract qualification failed, skipping: {}", symbol, e);
                    continue;
                }
            }

            let mut pipeline = SymbolPipeline::new(
                symbol,
                timeframes.clone(),
                self.config.engine_config.atr_length,
                self.config.engine_config.atr_factor,
                self.config.engine_config.bar_history,
            );
            match self
                .gateway
                .historical_bars(symbol, self.config.engine_config.warmup_days)
            {
                Ok(bars) => {
                    info!("{}: warming indicators from {} bars", symbol, bars.len());
                    pipeline.seed(bars, &self.store).await;
                }
                Err(e) => warn!("{}: no warmup data, starting cold: {}", symbol, e),
            }

            let (bar_tx, bar_rx) = mpsc::channel::<BarEvent>(1024);
            self.gateway.subscribe_realtime_bars(symbol, bar_tx)?;
            let (tick_tx, tick_rx) = mpsc::channel::<TickEvent>(1024);
            self.gateway.subscribe_market_data(symbol, tick_tx)?;
            self.store
                .update(
                    symbol,
                    SnapshotPatch {
                        market_data_subscribed: Some(true),
                        bars_subscribed: Some(true),
                        ..Default::default()
                    },
                )
                .await;

            self.spawn_symbol_dispatcher(pipeline, bar_rx);
            self.spawn_tick_consumer(tick_rx);
        }

        self.spawn_order_event_consumer()?;
        self.spawn_pnl_consumer()?;
        self.spawn_reconcile_timer();
        self.spawn_intent_consumer(intent_rx);

        info!(
            "engine started: {} symbols, {} timeframes",
            self.config.engine_config.symbols.len(),
            timeframes.len()
        );
        Ok(())
    }

    fn spawn_symbol_dispatcher(
        &self,
        mut pipeline: SymbolPipeline,
        mut rx: mpsc::Receiver<BarEvent>,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pipeline.on_bar(event.bar, &store).await;
            }
            debug!("{}: bar dispatcher stopped", pipeline.symbol);
        });
    }

    fn spawn_tick_consumer(&self, mut rx: mpsc::Receiver<TickEvent>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                store
                    .update(
                        &tick.symbol,
                        SnapshotPatch {
                            last_price: tick.last,
                            bid_price: tick.bid,
                            ask_price: tick.ask,
                            mark_price: tick.mark,
                            shortable_shares: tick.shortable_shares,
                            ..Default::default()
                        },
                    )
                    .await;
            }
        });
    }

    fn spawn_order_event_consumer(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<OrderEvent>(1024);
        self.gateway.stream_order_events(tx)?;
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match event {
                    OrderEvent::Fill {
                        order_id,
                        fill_price,
                        quantity,
                    } => orchestrator.on_fill(order_id, fill_price, quantity).await,
                    OrderEvent::Status { order_id, status } => {
                        orchestrator.on_status(order_id, status).await
                    }
                };
                if let Err(e) = result {
                    error!("order event handling failed: {}", e);
                }
            }
        });
        Ok(())
    }

    fn spawn_pnl_consumer(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<PnlEvent>(64);
        self.gateway
            .stream_pnl(&self.config.tws_config.account, tx)?;
        let breaker = self.breaker.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = breaker.on_pnl_update(event.daily_pnl).await {
                    error!("PnL handling failed: {}", e);
                }
            }
        });
        Ok(())
    }

    fn spawn_reconcile_timer(&self) {
        let orchestrator = self.orchestrator.clone();
        let period = Duration::from_secs(self.config.engine_config.reconcile_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.reconcile().await {
                    warn!("reconcile pass failed: {}", e);
                }
            }
        });
    }

    fn spawn_intent_consumer(&self, mut rx: mpsc::Receiver<OrderIntent>) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            while let Some(intent) = rx.recv().await {
                match orchestrator.submit_bracket(&intent).await {
                    Ok(parent_id) => {
                        info!("{}: intent accepted as bracket #{}", intent.symbol, parent_id)
                    }
                    Err(e) => warn!("{}: intent rejected: {}", intent.symbol, e),
                }
            }
        });
    }
}
