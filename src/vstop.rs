use crate::bars::{Bar, TimeFrame};
use log::debug;
use std::collections::{HashMap, VecDeque};

/// Trailing volatility-stop state for one (symbol, timeframe) series.
///
/// The stop trails the running extreme of the bar midpoint by
/// `atr * factor` and only ever tightens: non-decreasing while the trend
/// is up, non-increasing while it is down. A flip snaps the stop to the
/// other side of price and resets the extremes.
#[derive(Debug, Clone)]
pub struct VolatilityStopState {
    pub vstop: f64,
    pub uptrend: bool,
    pub atr: f64,
    pub atr_factor: f64,
    max_price: f64,
    min_price: f64,
    atr_length: usize,
    true_ranges: VecDeque<f64>,
    prev_close: f64,
}

/// Indicator output cached for consumers after each bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VStopOutput {
    pub vstop: f64,
    pub uptrend: bool,
    pub atr: f64,
}

impl VolatilityStopState {
    pub fn first(bar: &Bar, atr_length: usize, atr_factor: f64) -> Self {
        let source = midpoint(bar);
        let tr = bar.high - bar.low;
        let mut true_ranges = VecDeque::with_capacity(atr_length.max(1));
        if tr.is_finite() {
            true_ranges.push_back(tr);
        }
        let atr = rolling_atr(&true_ranges, atr_length);
        Self {
            vstop: source - atr * atr_factor,
            uptrend: true,
            atr,
            atr_factor,
            max_price: source,
            min_price: source,
            atr_length,
            true_ranges,
            prev_close: bar.close,
        }
    }

    pub fn update(&mut self, bar: &Bar) -> VStopOutput {
        let tr = true_range(bar, self.prev_close);
        if tr.is_finite() {
            self.true_ranges.push_back(tr);
            while self.true_ranges.len() > self.atr_length.max(1) {
                self.true_ranges.pop_front();
            }
        }
        self.atr = rolling_atr(&self.true_ranges, self.atr_length);
        self.prev_close = bar.close;

        let source = midpoint(bar);
        self.step(source)
    }

    /// One trailing-stop step for a new source value with the ATR already
    /// updated. Split out so the trailing rule is testable with a pinned
    /// ATR.
    fn step(&mut self, source: f64) -> VStopOutput {
        let band = self.atr * self.atr_factor;

        self.max_price = self.max_price.max(source);
        self.min_price = self.min_price.min(source);

        self.vstop = if self.uptrend {
            self.vstop.max(self.max_price - band)
        } else {
            self.vstop.min(self.min_price + band)
        };

        let uptrend = (source - self.vstop) >= 0.0;
        if uptrend != self.uptrend {
            // Trend flip: restart the pivot extremes at the flip bar and
            // snap the stop to the far side of price.
            self.uptrend = uptrend;
            self.max_price = source;
            self.min_price = source;
            self.vstop = if uptrend {
                source - band
            } else {
                source + band
            };
        }

        self.output()
    }

    pub fn output(&self) -> VStopOutput {
        VStopOutput {
            vstop: self.vstop,
            uptrend: self.uptrend,
            atr: self.atr,
        }
    }

    #[cfg(test)]
    fn with_pinned_atr(source: f64, atr: f64, atr_factor: f64) -> Self {
        Self {
            vstop: source - atr * atr_factor,
            uptrend: true,
            atr,
            atr_factor,
            max_price: source,
            min_price: source,
            atr_length: 1,
            true_ranges: VecDeque::new(),
            prev_close: source,
        }
    }

    #[cfg(test)]
    fn step_with_atr(&mut self, source: f64, atr: f64) -> VStopOutput {
        self.atr = atr;
        self.step(source)
    }
}

fn midpoint(bar: &Bar) -> f64 {
    (bar.high + bar.low) / 2.0
}

fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// Mean of the retained true ranges. An empty or NaN window degrades to
/// zero (stop collapses onto price) instead of failing.
fn rolling_atr(true_ranges: &VecDeque<f64>, atr_length: usize) -> f64 {
    if true_ranges.is_empty() || atr_length == 0 {
        return 0.0;
    }
    let sum: f64 = true_ranges.iter().sum();
    let atr = sum / true_ranges.len() as f64;
    if atr.is_finite() { atr } else { 0.0 }
}

/// Steps vstop state bar-by-bar per (symbol, timeframe).
pub struct VolatilityStopEngine {
    states: HashMap<(String, TimeFrame), VolatilityStopState>,
}

impl VolatilityStopEngine {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    pub fn update(
        &mut self,
        symbol: &str,
        timeframe: TimeFrame,
        bar: &Bar,
        atr_length: usize,
        atr_factor: f64,
    ) -> VStopOutput {
        let key = (symbol.to_string(), timeframe);
        let out = match self.states.get_mut(&key) {
            Some(state) => state.update(bar),
            None => {
                let state = VolatilityStopState::first(bar, atr_length, atr_factor);
                let out = state.output();
                self.states.insert(key, state);
                out
            }
        };
        debug!(
            "{} {}: vstop={:.4} uptrend={} atr={:.4}",
            symbol, timeframe, out.vstop, out.uptrend, out.atr
        );
        out
    }

    pub fn get(&self, symbol: &str, timeframe: TimeFrame) -> Option<VStopOutput> {
        self.states
            .get(&(symbol.to_string(), timeframe))
            .map(|s| s.output())
    }
}

impl Default for VolatilityStopEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn bar(ts: i64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_first_bar_initializes_below_source_by_band() {
        // Pinned ATR=1, factor=2, price=100 -> stop at 98, uptrend.
        let state = VolatilityStopState::with_pinned_atr(100.0, 1.0, 2.0);
        assert_eq!(state.vstop, 98.0);
        assert!(state.uptrend);
    }

    #[test]
    fn test_uptrend_stop_trails_upward() {
        let mut state = VolatilityStopState::with_pinned_atr(100.0, 1.0, 2.0);
        let out = state.step_with_atr(105.0, 1.0);
        // max(98, 105 - 2) = 103
        assert_eq!(out.vstop, 103.0);
        assert!(out.uptrend);
    }

    #[test]
    fn test_stop_never_loosens_while_trend_holds() {
        let mut state = VolatilityStopState::with_pinned_atr(100.0, 1.0, 2.0);
        let mut prev = state.output().vstop;
        // Price wanders but stays above the stop the whole way.
        for source in [101.0, 104.0, 102.5, 103.0, 106.0, 105.0] {
            let out = state.step_with_atr(source, 1.0);
            assert!(out.uptrend);
            assert!(out.vstop >= prev);
            prev = out.vstop;
        }
    }

    #[test]
    fn test_flip_snaps_stop_and_resets_extremes() {
        let mut state = VolatilityStopState::with_pinned_atr(100.0, 1.0, 2.0);
        state.step_with_atr(105.0, 1.0); // stop now 103
        let out = state.step_with_atr(102.0, 1.0); // crosses below
        assert!(!out.uptrend);
        assert_eq!(out.vstop, 104.0); // source + atr*factor

        // Downtrend stop is non-increasing from here.
        let mut prev = out.vstop;
        for source in [101.0, 99.0, 100.0, 97.0] {
            let out = state.step_with_atr(source, 1.0);
            assert!(!out.uptrend);
            assert!(out.vstop <= prev);
            prev = out.vstop;
        }
    }

    #[test]
    fn test_flip_back_to_uptrend_on_cross() {
        let mut state = VolatilityStopState::with_pinned_atr(100.0, 1.0, 2.0);
        state.step_with_atr(105.0, 1.0);
        state.step_with_atr(102.0, 1.0); // flip down, stop 104
        let out = state.step_with_atr(106.0, 1.0); // crosses above
        assert!(out.uptrend);
        assert_eq!(out.vstop, 104.0); // 106 - 2
    }

    #[test]
    fn test_zero_range_bars_give_degenerate_stop() {
        // high == low == close: ATR 0, stop equals the midpoint.
        let mut engine = VolatilityStopEngine::new();
        let tf = TimeFrame::parse("1 min").unwrap();
        let out = engine.update("AAPL", tf, &bar(0, 50.0, 50.0, 50.0), 14, 3.0);
        assert_eq!(out.atr, 0.0);
        assert_eq!(out.vstop, 50.0);
        assert!(out.uptrend);
    }

    #[test]
    fn test_engine_tracks_series_per_timeframe() {
        let mut engine = VolatilityStopEngine::new();
        let m1 = TimeFrame::parse("1 min").unwrap();
        let m5 = TimeFrame::parse("5 mins").unwrap();

        engine.update("AAPL", m1, &bar(0, 101.0, 99.0, 100.0), 14, 2.0);
        engine.update("AAPL", m5, &bar(0, 102.0, 98.0, 100.0), 14, 2.0);

        let one = engine.get("AAPL", m1).unwrap();
        let five = engine.get("AAPL", m5).unwrap();
        // Separate ATR windows: the wider bar carries the wider band.
        assert!(five.vstop < one.vstop);
        assert!(engine.get("MSFT", m1).is_none());
    }

    #[test]
    fn test_atr_is_rolling_true_range_mean() {
        let mut engine = VolatilityStopEngine::new();
        let tf = TimeFrame::parse("1 min").unwrap();
        engine.update("AAPL", tf, &bar(0, 101.0, 99.0, 100.0), 2, 1.0);
        // TR here: max(103-101, |103-100|, |101-100|) = 3.
        let out = engine.update("AAPL", tf, &bar(60, 103.0, 101.0, 102.0), 2, 1.0);
        // Window holds [2.0, 3.0].
        assert!((out.atr - 2.5).abs() < 1e-12);
    }
}
