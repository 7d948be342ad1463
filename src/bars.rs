use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// One OHLCV bar. Immutable once produced; ordered by timestamp within a
/// (symbol, timeframe) series.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A bar timeframe, stored as whole seconds. Parsed from the IB bar-size
/// vocabulary ("15 secs", "1 min", ...); anything else is a configuration
/// error, not a runtime panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeFrame {
    seconds: u32,
}

impl TimeFrame {
    pub fn parse(s: &str) -> Result<Self> {
        let seconds = match s {
            "5 secs" => 5,
            "10 secs" => 10,
            "15 secs" => 15,
            "30 secs" => 30,
            "1 min" => 60,
            "2 mins" => 120,
            "3 mins" => 180,
            "5 mins" => 300,
            "10 mins" => 600,
            "15 mins" => 900,
            "20 mins" => 1200,
            "30 mins" => 1800,
            "1 hour" => 3600,
            "2 hours" => 7200,
            "3 hours" => 10800,
            "4 hours" => 14400,
            "8 hours" => 28800,
            "1 day" => 86400,
            other => {
                return Err(EngineError::Config(format!(
                    "unsupported timeframe: {:?}",
                    other
                )));
            }
        };
        Ok(Self { seconds })
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    fn bucket_start(&self, timestamp: DateTime<Utc>) -> i64 {
        let secs = i64::from(self.seconds);
        timestamp.timestamp().div_euclid(secs) * secs
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.seconds)
    }
}

/// In-progress bucket for one timeframe.
#[derive(Debug, Clone)]
struct OpenBucket {
    start: i64,
    bar: Bar,
}

#[derive(Debug)]
struct TimeFrameSeries {
    closed: VecDeque<Bar>,
    open: Option<OpenBucket>,
}

#[derive(Debug)]
struct SymbolSeries {
    raw: VecDeque<Bar>,
    frames: HashMap<TimeFrame, TimeFrameSeries>,
}

/// Resamples a native 5-second bar stream into the configured higher
/// timeframes, one bounded ring buffer per (symbol, timeframe).
///
/// Replaying an identical feed produces an identical aggregate series:
/// bars at an already-seen timestamp replace the existing bar instead of
/// extending the bucket a second time.
pub struct BarAggregator {
    timeframes: Vec<TimeFrame>,
    history_bound: usize,
    raw_bound: usize,
    series: HashMap<String, SymbolSeries>,
}

impl BarAggregator {
    pub fn new(timeframes: Vec<TimeFrame>, history_bound: usize) -> Self {
        // The raw ring must cover the widest bucket so an open bucket can
        // be rebuilt from raw bars after a replacement.
        let widest = timeframes.iter().map(|tf| tf.seconds).max().unwrap_or(5);
        let raw_bound = ((widest / 5) as usize + 16).max(history_bound);
        Self {
            timeframes,
            history_bound,
            raw_bound,
            series: HashMap::new(),
        }
    }

    pub fn from_labels(labels: &[String], history_bound: usize) -> Result<Self> {
        let timeframes = labels
            .iter()
            .map(|l| TimeFrame::parse(l))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(timeframes, history_bound))
    }

    pub fn timeframes(&self) -> &[TimeFrame] {
        &self.timeframes
    }

    /// Appends one native 5-second bar for `symbol` and updates every
    /// timeframe's trailing bucket.
    pub fn feed(&mut self, symbol: &str, bar: Bar) {
        let timeframes = self.timeframes.clone();
        let (history_bound, raw_bound) = (self.history_bound, self.raw_bound);
        let series = self
            .series
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolSeries {
                raw: VecDeque::new(),
                frames: timeframes
                    .iter()
                    .map(|tf| {
                        (
                            *tf,
                            TimeFrameSeries {
                                closed: VecDeque::new(),
                                open: None,
                            },
                        )
                    })
                    .collect(),
            });

        match series.raw.back() {
            Some(last) if bar.timestamp < last.timestamp => {
                debug!(
                    "{}: dropping late 5s bar at {} (last {})",
                    symbol, bar.timestamp, last.timestamp
                );
                return;
            }
            Some(last) if bar.timestamp == last.timestamp => {
                if *last == bar {
                    // Identical replay, nothing to do.
                    return;
                }
                // Correction for the most recent bar: replace and rebuild
                // the open buckets from raw so nothing double-counts.
                *series.raw.back_mut().unwrap() = bar;
                for tf in &timeframes {
                    Self::rebuild_open_bucket(series, *tf);
                }
                return;
            }
            _ => {}
        }

        series.raw.push_back(bar.clone());
        if series.raw.len() > raw_bound {
            series.raw.pop_front();
        }

        for tf in &timeframes {
            let bucket_start = tf.bucket_start(bar.timestamp);
            let frame = series.frames.get_mut(tf).expect("frame exists");
            match &mut frame.open {
                Some(open) if open.start == bucket_start => {
                    open.bar.high = open.bar.high.max(bar.high);
                    open.bar.low = open.bar.low.min(bar.low);
                    open.bar.close = bar.close;
                    open.bar.volume += bar.volume;
                }
                Some(open) => {
                    // Rollover: the previous bucket is final.
                    frame.closed.push_back(open.bar.clone());
                    if frame.closed.len() > history_bound {
                        frame.closed.pop_front();
                    }
                    frame.open = Some(Self::new_bucket(bucket_start, &bar));
                }
                None => {
                    frame.open = Some(Self::new_bucket(bucket_start, &bar));
                }
            }
        }
    }

    /// Bulk-loads historical 5-second bars, typically at subscribe time to
    /// warm indicators before live data arrives.
    pub fn seed_history(&mut self, symbol: &str, bars: Vec<Bar>) {
        for bar in bars {
            self.feed(symbol, bar);
        }
    }

    /// The resampled series for (symbol, timeframe), oldest first. The
    /// trailing in-progress bucket is included as the final element.
    pub fn get_bars(&self, symbol: &str, timeframe: TimeFrame) -> Vec<Bar> {
        let Some(series) = self.series.get(symbol) else {
            return Vec::new();
        };
        let Some(frame) = series.frames.get(&timeframe) else {
            return Vec::new();
        };
        let mut out: Vec<Bar> = frame.closed.iter().cloned().collect();
        if let Some(open) = &frame.open {
            out.push(open.bar.clone());
        }
        out
    }

    fn new_bucket(bucket_start: i64, bar: &Bar) -> OpenBucket {
        let ts = DateTime::from_timestamp(bucket_start, 0).unwrap_or(bar.timestamp);
        OpenBucket {
            start: bucket_start,
            bar: Bar {
                timestamp: ts,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            },
        }
    }

    fn rebuild_open_bucket(series: &mut SymbolSeries, tf: TimeFrame) {
        let SymbolSeries { raw, frames } = series;
        let frame = frames.get_mut(&tf).expect("frame exists");
        let Some(open) = &frame.open else {
            return;
        };
        let start = open.start;
        let end = start + i64::from(tf.seconds());
        let mut rebuilt: Option<OpenBucket> = None;
        for raw_bar in raw
            .iter()
            .filter(|b| b.timestamp.timestamp() >= start && b.timestamp.timestamp() < end)
        {
            match &mut rebuilt {
                None => rebuilt = Some(Self::new_bucket(start, raw_bar)),
                Some(bucket) => {
                    bucket.bar.high = bucket.bar.high.max(raw_bar.high);
                    bucket.bar.low = bucket.bar.low.min(raw_bar.low);
                    bucket.bar.close = raw_bar.close;
                    bucket.bar.volume += raw_bar.volume;
                }
            }
        }
        if rebuilt.is_some() {
            frame.open = rebuilt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bar(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn five_sec_feed(count: usize) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin();
                bar(
                    i as i64 * 5,
                    base,
                    base + 0.5,
                    base - 0.5,
                    base + 0.1,
                    100.0 + i as f64,
                )
            })
            .collect()
    }

    #[test]
    fn test_unsupported_timeframe_is_config_error() {
        let err = TimeFrame::parse("7 secs").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_three_5s_bars_form_one_15s_bar() {
        // Scenario: opens 10/10.2/10.1, highs 10.3/10.4/10.5,
        // lows 9.9/10.0/10.0, closes 10.2/10.1/10.3, volumes 100/150/200.
        let tf = TimeFrame::parse("15 secs").unwrap();
        let mut agg = BarAggregator::new(vec![tf], 100);
        agg.feed("AAPL", bar(0, 10.0, 10.3, 9.9, 10.2, 100.0));
        agg.feed("AAPL", bar(5, 10.2, 10.4, 10.0, 10.1, 150.0));
        agg.feed("AAPL", bar(10, 10.1, 10.5, 10.0, 10.3, 200.0));

        let bars = agg.get_bars("AAPL", tf);
        assert_eq!(bars.len(), 1);
        let b = &bars[0];
        assert_eq!(b.open, 10.0);
        assert_eq!(b.high, 10.5);
        assert_eq!(b.low, 9.9);
        assert_eq!(b.close, 10.3);
        assert_eq!(b.volume, 450.0);
    }

    #[test]
    fn test_bucket_rollover_closes_previous_bar() {
        let tf = TimeFrame::parse("15 secs").unwrap();
        let mut agg = BarAggregator::new(vec![tf], 100);
        for b in five_sec_feed(7) {
            agg.feed("AAPL", b);
        }
        let bars = agg.get_bars("AAPL", tf);
        // 35s of data: buckets [0,15), [15,30) closed, [30,45) open.
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].timestamp.timestamp(), 0);
        assert_eq!(bars[1].timestamp.timestamp(), 15);
        assert_eq!(bars[2].timestamp.timestamp(), 30);
    }

    #[test]
    fn test_refeeding_identical_sequence_does_not_double_count() {
        let tf = TimeFrame::parse("1 min").unwrap();
        let feed = five_sec_feed(24);

        let mut agg = BarAggregator::new(vec![tf], 100);
        for b in &feed {
            agg.feed("AAPL", b.clone());
        }
        let once = agg.get_bars("AAPL", tf);

        for b in &feed {
            agg.feed("AAPL", b.clone());
        }
        let twice = agg.get_bars("AAPL", tf);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_correction_of_latest_bar_rebuilds_bucket() {
        let tf = TimeFrame::parse("15 secs").unwrap();
        let mut agg = BarAggregator::new(vec![tf], 100);
        agg.feed("AAPL", bar(0, 10.0, 10.3, 9.9, 10.2, 100.0));
        agg.feed("AAPL", bar(5, 10.2, 10.9, 10.0, 10.1, 150.0));
        // Corrected print for t=5 with a lower high and volume.
        agg.feed("AAPL", bar(5, 10.2, 10.4, 10.0, 10.1, 140.0));

        let bars = agg.get_bars("AAPL", tf);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].high, 10.4);
        assert_eq!(bars[0].volume, 240.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let tf = TimeFrame::parse("5 secs").unwrap();
        let mut agg = BarAggregator::new(vec![tf], 10);
        for b in five_sec_feed(50) {
            agg.feed("AAPL", b);
        }
        assert!(agg.get_bars("AAPL", tf).len() <= 11);
    }

    #[test]
    fn test_unknown_symbol_returns_empty() {
        let tf = TimeFrame::parse("1 min").unwrap();
        let agg = BarAggregator::new(vec![tf], 100);
        assert!(agg.get_bars("NOPE", tf).is_empty());
    }

    proptest! {
        /// The aggregate series must not depend on how the 5s feed is
        /// chunked into feed() calls.
        #[test]
        fn prop_chunking_does_not_change_aggregate(
            count in 1usize..60,
            split in 0usize..60,
        ) {
            let tf = TimeFrame::parse("1 min").unwrap();
            let feed = five_sec_feed(count);
            let split = split.min(count);

            let mut whole = BarAggregator::new(vec![tf], 100);
            for b in &feed {
                whole.feed("X", b.clone());
            }

            let mut chunked = BarAggregator::new(vec![tf], 100);
            chunked.seed_history("X", feed[..split].to_vec());
            chunked.seed_history("X", feed[split..].to_vec());

            prop_assert_eq!(whole.get_bars("X", tf), chunked.get_bars("X", tf));
        }
    }
}
