use crate::config::RiskConfig;
use crate::error::{EngineError, Result};
use crate::gateway::{OrderAction, OrderIntent};
use log::{debug, warn};

/// Everything the orchestrator needs to build a bracket from an intent.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub action: OrderAction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_profit: f64,
    pub quantity: f64,
    pub per_share_risk: f64,
    pub tolerated_risk: f64,
    pub commission: f64,
}

/// Converts (entry, stop, balance, risk%, reward ratio) into an order
/// quantity with adjusted stop and take-profit. Pure; all broker state
/// comes in as arguments.
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Sizes an intent against the latest known close and short-sale
    /// availability.
    ///
    /// `last_close` re-anchors a stale intent when price has gapped more
    /// than `gap_threshold_pct` since the intent was formed.
    /// `shortable_shares` gates SELL orders: availability below
    /// `shortable_multiple`x the requested quantity is a hard reject.
    pub fn size(
        &self,
        intent: &OrderIntent,
        last_close: Option<f64>,
        shortable_shares: Option<f64>,
    ) -> Result<SizedOrder> {
        let mut entry = match intent.entry_price.or(last_close) {
            Some(p) => p,
            None => {
                return Err(EngineError::InvalidState(format!(
                    "{}: no entry price and no market data yet",
                    intent.symbol
                )));
            }
        };
        let mut stop = intent.stop_loss;

        if !entry.is_finite() || !stop.is_finite() || entry <= 0.0 {
            return Err(EngineError::InvalidState(format!(
                "{}: unusable prices entry={} stop={}",
                intent.symbol, entry, stop
            )));
        }
        if !(intent.risk_pct > 0.0) || !(intent.account_balance > 0.0) {
            return Err(EngineError::InvalidState(format!(
                "{}: risk_pct={} balance={}",
                intent.symbol, intent.risk_pct, intent.account_balance
            )));
        }

        // A stale intent: price has gapped away from where the stop was
        // anchored. Shift entry and stop together onto the latest close.
        if let Some(close) = last_close {
            if close.is_finite() && close > 0.0 {
                let gap_pct = (close - entry) / entry * 100.0;
                if gap_pct.abs() > self.config.gap_threshold_pct {
                    debug!(
                        "{}: gap {:.2}% exceeds {:.2}%, re-anchoring stop on close {:.2}",
                        intent.symbol, gap_pct, self.config.gap_threshold_pct, close
                    );
                    stop += close - entry;
                    entry = close;
                }
            }
        }

        // The stop must sit on the losing side of the entry; otherwise
        // shrink it toward the risk-pct band around entry.
        let adjusted = match intent.action {
            OrderAction::Buy if stop >= entry => Some(entry * (1.0 - intent.risk_pct / 100.0)),
            OrderAction::Sell if stop <= entry => Some(entry * (1.0 + intent.risk_pct / 100.0)),
            _ => None,
        };
        if let Some(new_stop) = adjusted {
            warn!(
                "{}: stop {:.2} on wrong side of entry {:.2}, adjusted to {:.2}",
                intent.symbol, stop, entry, new_stop
            );
            stop = new_stop;
        }

        let mut per_share_risk = (entry - stop).abs();
        let floor = entry * 0.01;
        if per_share_risk < floor {
            per_share_risk = floor;
        }

        let commission = self.config.commission_reserve;
        let tolerated_risk = intent.risk_pct / 100.0 * intent.account_balance - commission;
        if tolerated_risk <= 0.0 {
            return Err(EngineError::InvalidState(format!(
                "{}: risk budget {:.2} does not cover commission",
                intent.symbol, tolerated_risk
            )));
        }

        let quantity = (tolerated_risk / per_share_risk)
            .min(intent.account_balance / entry)
            .floor();
        if quantity <= 0.0 {
            return Err(EngineError::InvalidState(format!(
                "{}: sized to {} shares, refusing to submit",
                intent.symbol, quantity
            )));
        }

        if intent.action == OrderAction::Sell {
            let available = shortable_shares.unwrap_or(0.0);
            let required = self.config.shortable_multiple * quantity;
            if available < required {
                return Err(EngineError::InvalidState(format!(
                    "{}: {} shortable shares < required {}",
                    intent.symbol, available, required
                )));
            }
        }

        let take_profit = match intent.action {
            OrderAction::Buy => entry + per_share_risk * intent.reward_ratio,
            OrderAction::Sell => entry - per_share_risk * intent.reward_ratio,
        };

        Ok(SizedOrder {
            action: intent.action,
            entry_price: entry,
            stop_price: stop,
            take_profit,
            quantity,
            per_share_risk,
            tolerated_risk,
            commission,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> RiskConfig {
        RiskConfig {
            daily_loss_threshold: -300.0,
            default_risk_pct: 1.0,
            default_reward_ratio: 2.0,
            commission_reserve: 0.0,
            gap_threshold_pct: 0.4,
            shortable_multiple: 5.0,
        }
    }

    fn intent(action: OrderAction, entry: f64, stop: f64) -> OrderIntent {
        OrderIntent {
            symbol: "AAPL".to_string(),
            action,
            entry_price: Some(entry),
            stop_loss: stop,
            risk_pct: 1.0,
            reward_ratio: 2.0,
            account_balance: 10000.0,
            timeframe: "1 min".to_string(),
        }
    }

    #[test]
    fn test_basic_buy_sizing() {
        // 10k balance at 1% risk -> 100 budget; $1 per-share risk -> 100 shares.
        let sizer = PositionSizer::new(config());
        let sized = sizer.size(&intent(OrderAction::Buy, 50.0, 49.0), None, None).unwrap();
        assert_eq!(sized.quantity, 100.0);
        assert_eq!(sized.per_share_risk, 1.0);
        assert_eq!(sized.take_profit, 52.0);
    }

    #[test]
    fn test_commission_reserve_reduces_budget() {
        let mut cfg = config();
        cfg.commission_reserve = 2.0;
        let sizer = PositionSizer::new(cfg);
        let sized = sizer.size(&intent(OrderAction::Buy, 50.0, 49.0), None, None).unwrap();
        assert_eq!(sized.tolerated_risk, 98.0);
        assert_eq!(sized.quantity, 98.0);
    }

    #[test]
    fn test_quantity_capped_by_balance() {
        let sizer = PositionSizer::new(config());
        let mut i = intent(OrderAction::Buy, 500.0, 499.0);
        i.risk_pct = 10.0; // budget 1000, psr floored to 5 -> 200 shares by risk
        let sized = sizer.size(&i, None, None).unwrap();
        // but only 10000/500 = 20 shares are affordable
        assert_eq!(sized.quantity, 20.0);
    }

    #[test]
    fn test_degenerate_stop_floors_per_share_risk() {
        let sizer = PositionSizer::new(config());
        let sized = sizer
            .size(&intent(OrderAction::Buy, 100.0, 99.999), None, None)
            .unwrap();
        // 0.001 risk would explode the size; floored to 1% of entry.
        assert_eq!(sized.per_share_risk, 1.0);
    }

    #[test]
    fn test_buy_stop_above_entry_is_adjusted_down() {
        let sizer = PositionSizer::new(config());
        let sized = sizer.size(&intent(OrderAction::Buy, 100.0, 105.0), None, None).unwrap();
        assert_eq!(sized.stop_price, 99.0); // entry * (1 - 1%)
        assert!(sized.stop_price < sized.entry_price);
    }

    #[test]
    fn test_sell_stop_below_entry_is_adjusted_up() {
        let sizer = PositionSizer::new(config());
        let sized = sizer
            .size(&intent(OrderAction::Sell, 100.0, 95.0), None, Some(1_000_000.0))
            .unwrap();
        assert_eq!(sized.stop_price, 101.0);
        assert!(sized.take_profit < 100.0);
    }

    #[test]
    fn test_sell_rejected_without_shortable_depth() {
        let sizer = PositionSizer::new(config());
        // 100 shares requested, needs 5x = 500 shortable.
        let err = sizer
            .size(&intent(OrderAction::Sell, 50.0, 51.0), None, Some(400.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let ok = sizer.size(&intent(OrderAction::Sell, 50.0, 51.0), None, Some(500.0));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_gap_beyond_threshold_reanchors_stop() {
        let sizer = PositionSizer::new(config());
        // Intent formed at 100, market now 102: 2% gap > 0.4%.
        let sized = sizer
            .size(&intent(OrderAction::Buy, 100.0, 99.0), Some(102.0), None)
            .unwrap();
        assert_eq!(sized.entry_price, 102.0);
        assert_eq!(sized.stop_price, 101.0); // distance preserved
    }

    #[test]
    fn test_small_gap_leaves_intent_untouched() {
        let sizer = PositionSizer::new(config());
        let sized = sizer
            .size(&intent(OrderAction::Buy, 100.0, 99.0), Some(100.2), None)
            .unwrap();
        assert_eq!(sized.entry_price, 100.0);
        assert_eq!(sized.stop_price, 99.0);
    }

    #[test]
    fn test_missing_entry_uses_last_close() {
        let sizer = PositionSizer::new(config());
        let mut i = intent(OrderAction::Buy, 0.0, 49.0);
        i.entry_price = None;
        let sized = sizer.size(&i, Some(50.0), None).unwrap();
        assert_eq!(sized.entry_price, 50.0);
    }

    #[test]
    fn test_nan_prices_rejected() {
        let sizer = PositionSizer::new(config());
        let err = sizer
            .size(&intent(OrderAction::Buy, f64::NAN, 49.0), None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn test_tiny_balance_sizes_to_zero_and_rejects() {
        let sizer = PositionSizer::new(config());
        let mut i = intent(OrderAction::Buy, 5000.0, 4950.0);
        i.account_balance = 1000.0; // cannot afford one share
        let err = sizer.size(&i, None, None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    proptest! {
        /// Risk taken never exceeds the tolerated budget.
        #[test]
        fn prop_risk_within_budget(
            entry in 1.0f64..1000.0,
            stop_frac in 0.80f64..1.20,
            balance in 1000.0f64..1_000_000.0,
            risk_pct in 0.1f64..5.0,
        ) {
            let sizer = PositionSizer::new(config());
            let mut i = intent(OrderAction::Buy, entry, entry * stop_frac);
            i.account_balance = balance;
            i.risk_pct = risk_pct;

            if let Ok(sized) = sizer.size(&i, None, None) {
                prop_assert!(
                    sized.quantity * sized.per_share_risk
                        <= sized.tolerated_risk + 1e-6
                );
                prop_assert!(sized.quantity * sized.entry_price <= balance + 1e-6);
                prop_assert!(sized.stop_price < sized.entry_price);
            }
        }
    }
}
