use crate::bars::TimeFrame;
use crate::vstop::VStopOutput;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Latest per-symbol market view. Mutated only through `SnapshotPatch`
/// merges so stale ticks can never half-overwrite good data.
#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub last_close: Option<f64>,
    pub yesterday_close: Option<f64>,
    pub shortable_shares: Option<f64>,
    pub contract_id: Option<i32>,
    pub market_data_subscribed: bool,
    pub bars_subscribed: bool,
    pub updated_at: DateTime<Utc>,
}

impl SymbolSnapshot {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            last_price: None,
            bid_price: None,
            ask_price: None,
            mark_price: None,
            last_close: None,
            yesterday_close: None,
            shortable_shares: None,
            contract_id: None,
            market_data_subscribed: false,
            bars_subscribed: false,
            updated_at: Utc::now(),
        }
    }

    /// Best available reference price: mark, then last, then mid-ish
    /// bid/ask fallbacks. Liquidation pricing leans on this ordering.
    pub fn reference_price(&self) -> Option<f64> {
        self.mark_price
            .or(self.last_price)
            .or(self.bid_price)
            .or(self.ask_price)
    }
}

/// Partial snapshot update. `None` fields are left alone; NaN and
/// non-finite values are dropped rather than merged.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPatch {
    pub last_price: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub last_close: Option<f64>,
    pub yesterday_close: Option<f64>,
    pub shortable_shares: Option<f64>,
    pub contract_id: Option<i32>,
    pub market_data_subscribed: Option<bool>,
    pub bars_subscribed: Option<bool>,
}

fn merge_price(dst: &mut Option<f64>, src: Option<f64>) {
    if let Some(v) = src {
        if v.is_finite() {
            *dst = Some(v);
        }
    }
}

/// Everything the store owns for one symbol: the snapshot plus the latest
/// indicator output per timeframe.
#[derive(Debug, Clone)]
pub struct SymbolState {
    pub snapshot: SymbolSnapshot,
    pub indicators: HashMap<TimeFrame, VStopOutput>,
}

/// Concurrency-safe per-symbol state cache.
///
/// Each symbol gets its own mutex so updates for unrelated symbols never
/// contend; the outer map lock is held only long enough to find or insert
/// the entry. All mutation of one symbol's state happens with its lock
/// held, which serializes same-symbol events in arrival order.
pub struct SymbolStateStore {
    entries: RwLock<HashMap<String, Arc<Mutex<SymbolState>>>>,
}

impl SymbolStateStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, symbol: &str) -> Arc<Mutex<SymbolState>> {
        if let Some(existing) = self.entries.read().await.get(symbol) {
            return existing.clone();
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(symbol.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SymbolState {
                    snapshot: SymbolSnapshot::new(symbol),
                    indicators: HashMap::new(),
                }))
            })
            .clone()
    }

    /// Snapshot for `symbol`, or `None` before its first registration.
    /// Not-yet-known is the normal state before subscription, not an
    /// error.
    pub async fn get(&self, symbol: &str) -> Option<SymbolSnapshot> {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(symbol).cloned()
        }?;
        let state = entry.lock().await;
        Some(state.snapshot.clone())
    }

    /// Merges a patch into the symbol's snapshot, creating the entry on
    /// first touch. Copy-then-swap: the merge happens on a clone and is
    /// installed whole.
    pub async fn update(&self, symbol: &str, patch: SnapshotPatch) {
        let entry = self.entry(symbol).await;
        let mut state = entry.lock().await;

        let mut next = state.snapshot.clone();
        merge_price(&mut next.last_price, patch.last_price);
        merge_price(&mut next.bid_price, patch.bid_price);
        merge_price(&mut next.ask_price, patch.ask_price);
        merge_price(&mut next.mark_price, patch.mark_price);
        merge_price(&mut next.last_close, patch.last_close);
        merge_price(&mut next.yesterday_close, patch.yesterday_close);
        merge_price(&mut next.shortable_shares, patch.shortable_shares);
        if let Some(id) = patch.contract_id {
            next.contract_id = Some(id);
        }
        if let Some(flag) = patch.market_data_subscribed {
            next.market_data_subscribed = flag;
        }
        if let Some(flag) = patch.bars_subscribed {
            next.bars_subscribed = flag;
        }
        next.updated_at = Utc::now();

        state.snapshot = next;
    }

    /// Runs a compound read-modify-write with the symbol's lock held.
    pub async fn with_lock<R>(
        &self,
        symbol: &str,
        f: impl FnOnce(&mut SymbolState) -> R,
    ) -> R {
        let entry = self.entry(symbol).await;
        let mut state = entry.lock().await;
        f(&mut state)
    }

    pub async fn set_indicator(&self, symbol: &str, timeframe: TimeFrame, output: VStopOutput) {
        let entry = self.entry(symbol).await;
        let mut state = entry.lock().await;
        state.indicators.insert(timeframe, output);
    }

    pub async fn get_indicator(&self, symbol: &str, timeframe: TimeFrame) -> Option<VStopOutput> {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(symbol).cloned()
        }?;
        let state = entry.lock().await;
        state.indicators.get(&timeframe).copied()
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

impl Default for SymbolStateStore {
    fn default() -> Self {
        Self::new()
    }
}
