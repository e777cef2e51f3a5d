// Runtime configuration: defaults, config/default.toml, --config file, SHORTBOT__* env
pub mod credentials;

pub use credentials::Credentials;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::BotError;
use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub strategy: StrategySettings,
    pub risk: RiskSettings,
    pub scanner: ScannerSettings,
    pub control: ControlSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub testnet: bool,
    pub testnet_url: String,
    pub quote_asset: String,
    pub recv_window_ms: u64,
    /// Minimum spacing between REST calls
    pub min_request_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            testnet: false,
            testnet_url: "https://testnet.binancefuture.com".to_string(),
            quote_asset: "USDT".to_string(),
            recv_window_ms: 5000,
            min_request_interval_ms: 100,
            request_timeout_secs: 10,
        }
    }
}

impl ExchangeSettings {
    pub fn rest_url(&self) -> &str {
        if self.testnet {
            &self.testnet_url
        } else {
            &self.base_url
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOrderType {
    Market,
    /// Immediate-or-cancel limit slightly below the mark
    LimitIoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingSettings {
    pub enabled: bool,
    /// Trailing stop arms once price falls this far below the average entry
    pub activation_percent: f64,
    pub callback_percent: f64,
}

impl Default for TrailingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            activation_percent: 1.0,
            callback_percent: 1.0,
        }
    }
}

/// Martingale ladder and entry/exit thresholds. Percentages are in percent (5.0 = 5%).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    /// Margin committed per step, in quote currency
    pub ladder: Vec<f64>,
    pub leverage: u32,
    pub step_trigger_percent: f64,
    /// Per-step overrides of `step_trigger_percent`, indexed by the step being added
    pub step_distances: Vec<f64>,
    pub step_cooldown_secs: u64,
    pub take_profit_percent: f64,
    /// Widen the take-profit for deep ladders (x1.2 from 4 steps, x1.5 from 8)
    pub dynamic_take_profit: bool,
    pub max_adverse_excursion_percent: f64,
    pub half_close_min_steps: usize,
    pub min_pump_percent: f64,
    pub min_rsi: f64,
    pub rsi_period: usize,
    pub rsi_interval: String,
    /// No step at or beyond `rsi_circuit_breaker_min_steps` while RSI is above this
    pub rsi_circuit_breaker: Option<f64>,
    pub rsi_circuit_breaker_min_steps: usize,
    pub sentiment_min_pump: f64,
    pub entry_batch_size: usize,
    pub exclusions: Vec<String>,
    pub step_order: StepOrderType,
    pub limit_offset_percent: f64,
    pub trailing: TrailingSettings,
    pub place_take_profit_order: bool,
    /// Relative slack when matching an observed margin against ladder prefix sums
    pub recovery_margin_tolerance: f64,
    /// Relative drift in quantity or average that triggers a basis re-anchor
    pub resync_drift_tolerance: f64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            ladder: vec![10.0, 15.0, 22.5, 33.75, 50.63, 75.94],
            leverage: 10,
            step_trigger_percent: 5.0,
            step_distances: Vec::new(),
            step_cooldown_secs: 0,
            take_profit_percent: 1.5,
            dynamic_take_profit: true,
            max_adverse_excursion_percent: 40.0,
            half_close_min_steps: 2,
            min_pump_percent: 30.0,
            min_rsi: 70.0,
            rsi_period: 14,
            rsi_interval: "15m".to_string(),
            rsi_circuit_breaker: Some(90.0),
            rsi_circuit_breaker_min_steps: 4,
            sentiment_min_pump: 40.0,
            entry_batch_size: 5,
            exclusions: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            step_order: StepOrderType::Market,
            limit_offset_percent: 0.1,
            trailing: TrailingSettings::default(),
            place_take_profit_order: false,
            recovery_margin_tolerance: 0.05,
            resync_drift_tolerance: 1e-6,
        }
    }
}

impl StrategySettings {
    /// Margin for the step at `index`, if the ladder has one
    pub fn rung(&self, index: usize) -> Option<f64> {
        self.ladder.get(index).copied()
    }

    /// Sum of the first `steps` rungs
    pub fn cumulative_margin(&self, steps: usize) -> f64 {
        self.ladder.iter().take(steps).sum()
    }

    pub fn ladder_total(&self) -> f64 {
        self.ladder.iter().sum()
    }

    /// Fractional rise over the last step's entry that adds step `index`
    pub fn step_distance(&self, index: usize) -> f64 {
        self.step_distances
            .get(index)
            .copied()
            .unwrap_or(self.step_trigger_percent)
            / 100.0
    }

    /// Fractional take-profit below the average for a position with `steps` steps
    pub fn take_profit_fraction(&self, steps: usize) -> f64 {
        let base = self.take_profit_percent / 100.0;
        if !self.dynamic_take_profit {
            return base;
        }
        if steps >= 8 {
            base * 1.5
        } else if steps >= 4 {
            base * 1.2
        } else {
            base
        }
    }

    pub fn max_adverse_excursion(&self) -> f64 {
        self.max_adverse_excursion_percent / 100.0
    }

    pub fn is_excluded(&self, symbol: &str) -> bool {
        self.exclusions.iter().any(|s| s.eq_ignore_ascii_case(symbol))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistSettings {
    pub enabled: bool,
    /// Emergency closes within the window that bar a symbol
    pub emergency_closes: usize,
    pub window_hours: i64,
    pub duration_hours: i64,
}

impl Default for BlacklistSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            emergency_closes: 2,
            window_hours: 24,
            duration_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub max_positions: usize,
    pub max_daily_loss_usd: Option<f64>,
    pub blacklist: BlacklistSettings,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_positions: 3,
            max_daily_loss_usd: None,
            blacklist: BlacklistSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub min_quote_volume: f64,
    pub trend_interval: String,
    pub trend_lookback: usize,
    pub trend_ema_period: usize,
    /// Consecutive higher closes that count as an uptrend still in progress
    pub trend_rising_bars: usize,
    /// A last candle gaining at least this much means the pump is still running
    pub max_last_candle_gain_percent: f64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            min_quote_volume: 5_000_000.0,
            trend_interval: "1h".to_string(),
            trend_lookback: 12,
            trend_ema_period: 6,
            trend_rising_bars: 3,
            max_last_candle_gain_percent: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub cycle_interval_secs: u64,
    pub standby_interval_secs: u64,
    pub command_poll_ms: u64,
    pub pump_scan_interval_secs: u64,
    pub resync_every_cycles: u64,
    pub state_push_min_interval_ms: u64,
    pub auto_start: bool,
    pub command_ledger_capacity: usize,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 10,
            standby_interval_secs: 5,
            command_poll_ms: 500,
            pump_scan_interval_secs: 90,
            resync_every_cycles: 30,
            state_push_min_interval_ms: 1000,
            auto_start: false,
            command_ledger_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub filter: String,
    pub ship_remote: bool,
    pub remote_queue_capacity: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "shortbot=info".to_string(),
            ship_remote: true,
            remote_queue_capacity: 256,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then `config/default.toml` if present, then `path`,
    /// then `SHORTBOT__*` environment overrides (`SHORTBOT__RISK__MAX_POSITIONS=5`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::with_name("config/default").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("SHORTBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let strategy = &self.strategy;

        if strategy.ladder.is_empty() {
            return Err(invalid("strategy.ladder must have at least one rung"));
        }
        if strategy.ladder.iter().any(|rung| !(*rung > 0.0)) {
            return Err(invalid("strategy.ladder rungs must be positive"));
        }
        if strategy.leverage == 0 || strategy.leverage > 125 {
            return Err(invalid("strategy.leverage must be between 1 and 125"));
        }

        let percents = [
            ("strategy.step_trigger_percent", strategy.step_trigger_percent),
            ("strategy.take_profit_percent", strategy.take_profit_percent),
            (
                "strategy.max_adverse_excursion_percent",
                strategy.max_adverse_excursion_percent,
            ),
        ];
        for (name, value) in percents {
            if !(value > 0.0 && value < 100.0) {
                return Err(invalid(&format!("{} must be in (0, 100), got {}", name, value)));
            }
        }
        if strategy.step_distances.iter().any(|d| !(*d > 0.0)) {
            return Err(invalid("strategy.step_distances must be positive"));
        }
        if !(0.0..=100.0).contains(&strategy.min_rsi) {
            return Err(invalid("strategy.min_rsi must be in [0, 100]"));
        }
        if strategy.rsi_period == 0 {
            return Err(invalid("strategy.rsi_period must be positive"));
        }
        if !(0.0..0.5).contains(&strategy.recovery_margin_tolerance) {
            return Err(invalid("strategy.recovery_margin_tolerance must be in [0, 0.5)"));
        }
        if self.risk.max_positions == 0 {
            return Err(invalid("risk.max_positions must be at least 1"));
        }
        if self.control.command_poll_ms == 0 {
            return Err(invalid("control.command_poll_ms must be positive"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> BotError {
    BotError::InvalidSettings(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_ladder() {
        let mut settings = Settings::default();
        settings.strategy.ladder.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_rung() {
        let mut settings = Settings::default();
        settings.strategy.ladder = vec![10.0, 0.0, 22.5];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_max_positions() {
        let mut settings = Settings::default();
        settings.risk.max_positions = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_cumulative_margin() {
        let mut strategy = StrategySettings::default();
        strategy.ladder = vec![10.0, 15.0, 22.5];
        assert_eq!(strategy.cumulative_margin(0), 0.0);
        assert_eq!(strategy.cumulative_margin(2), 25.0);
        assert_eq!(strategy.cumulative_margin(10), 47.5);
    }

    #[test]
    fn test_dynamic_take_profit_scaling() {
        let strategy = StrategySettings {
            take_profit_percent: 2.0,
            ..Default::default()
        };
        assert!((strategy.take_profit_fraction(1) - 0.02).abs() < 1e-12);
        assert!((strategy.take_profit_fraction(4) - 0.024).abs() < 1e-12);
        assert!((strategy.take_profit_fraction(8) - 0.03).abs() < 1e-12);

        let flat = StrategySettings {
            dynamic_take_profit: false,
            ..strategy
        };
        assert!((flat.take_profit_fraction(8) - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_step_distance_override() {
        let strategy = StrategySettings {
            step_trigger_percent: 5.0,
            step_distances: vec![0.0, 3.0],
            ..Default::default()
        };
        assert!((strategy.step_distance(1) - 0.03).abs() < 1e-12);
        assert!((strategy.step_distance(4) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_env_override_uses_double_underscore_after_prefix() {
        std::env::set_var("SHORTBOT__RISK__MAX_POSITIONS", "7");
        let loaded = Settings::load(None);
        std::env::remove_var("SHORTBOT__RISK__MAX_POSITIONS");

        assert_eq!(loaded.unwrap().risk.max_positions, 7);
    }
}
