use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub tws_config: TwsConfig,
    pub engine_config: EngineConfig,
    pub risk_config: RiskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwsConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub account: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols subscribed at startup.
    pub symbols: Vec<String>,
    /// Timeframes the aggregator maintains for every symbol, as bar-size
    /// strings ("15 secs", "1 min", ...).
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
    #[serde(default = "default_atr_length")]
    pub atr_length: usize,
    #[serde(default = "default_atr_factor")]
    pub atr_factor: f64,
    /// Bars kept per (symbol, timeframe) ring buffer.
    #[serde(default = "default_bar_history")]
    pub bar_history: usize,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Days of historical data used to warm indicators at subscribe time.
    #[serde(default = "default_warmup_days")]
    pub warmup_days: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Daily PnL at or below this trips the breaker. Negative number.
    pub daily_loss_threshold: f64,
    #[serde(default = "default_risk_pct")]
    pub default_risk_pct: f64,
    #[serde(default = "default_reward_ratio")]
    pub default_reward_ratio: f64,
    /// Flat commission reserve subtracted from the risk budget per trade.
    #[serde(default = "default_commission_reserve")]
    pub commission_reserve: f64,
    /// Stop re-anchoring kicks in when the latest close has gapped more
    /// than this percentage away from the intent's stop basis. Tunable;
    /// 0.4 is the conventional value, not a law.
    #[serde(default = "default_gap_threshold_pct")]
    pub gap_threshold_pct: f64,
    /// SELL orders require shortable shares >= this multiple of quantity.
    #[serde(default = "default_shortable_multiple")]
    pub shortable_multiple: f64,
}

fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_backoff_secs() -> u64 {
    10
}
fn default_timeframes() -> Vec<String> {
    vec!["1 min".to_string(), "5 mins".to_string()]
}
fn default_atr_length() -> usize {
    20
}
fn default_atr_factor() -> f64 {
    3.0
}
fn default_bar_history() -> usize {
    500
}
fn default_reconcile_interval_secs() -> u64 {
    30
}
fn default_warmup_days() -> i32 {
    1
}
fn default_risk_pct() -> f64 {
    1.0
}
fn default_reward_ratio() -> f64 {
    2.0
}
fn default_commission_reserve() -> f64 {
    2.0
}
fn default_gap_threshold_pct() -> f64 {
    0.4
}
fn default_shortable_multiple() -> f64 {
    5.0
}

impl TradingConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_file("config.json")
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let config_str = fs::read_to_string(path).unwrap_or_else(|_| Self::default_config_json());
        let config: TradingConfig = serde_json::from_str(&config_str)?;
        Ok(config)
    }

    fn default_config_json() -> String {
        serde_json::to_string_pretty(&Self::default()).unwrap()
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            tws_config: TwsConfig {
                host: "127.0.0.1".to_string(),
                port: 7497,
                client_id: 1,
                account: "DU0000000".to_string(),
                max_reconnect_attempts: default_max_reconnect_attempts(),
                reconnect_backoff_secs: default_reconnect_backoff_secs(),
            },
            engine_config: EngineConfig {
                symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
                timeframes: default_timeframes(),
                atr_length: default_atr_length(),
                atr_factor: default_atr_factor(),
                bar_history: default_bar_history(),
                reconcile_interval_secs: default_reconcile_interval_secs(),
                warmup_days: default_warmup_days(),
            },
            risk_config: RiskConfig {
                daily_loss_threshold: -300.0,
                default_risk_pct: default_risk_pct(),
                default_reward_ratio: default_reward_ratio(),
                commission_reserve: default_commission_reserve(),
                gap_threshold_pct: default_gap_threshold_pct(),
                shortable_multiple: default_shortable_multiple(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips() {
        let json = serde_json::to_string(&TradingConfig::default()).unwrap();
        let config: TradingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.tws_config.port, 7497);
        assert_eq!(config.risk_config.daily_loss_threshold, -300.0);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let json = r#"{
            "tws_config": {"host": "127.0.0.1", "port": 7497, "client_id": 2, "account": "DU1"},
            "engine_config": {"symbols": ["TSLA"]},
            "risk_config": {"daily_loss_threshold": -500.0}
        }"#;
        let config: TradingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.engine_config.atr_length, 20);
        assert_eq!(config.risk_config.gap_threshold_pct, 0.4);
        assert_eq!(config.risk_config.shortable_multiple, 5.0);
    }
}
