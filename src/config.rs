use crate::error::BacktestError;
use crate::models::format_period;
use crate::signals::SignalType;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const DEFAULT_INITIAL_CAPITAL: f64 = 100_000.0;
pub const DEFAULT_COMMISSION_RATE: f64 = 0.0003;
pub const DEFAULT_SLIPPAGE_RATE: f64 = 0.001;
pub const DEFAULT_POSITION_SIZE_FRACTION: f64 = 0.95;

/// Setting keys read by `EngineRuntimeSettings`.
pub const ENGINE_SETTING_KEYS: [&str; 8] = [
    "BACKTEST_INITIAL_CAPITAL",
    "TRADE_COMMISSION_RATE",
    "TRADE_SLIPPAGE_RATE",
    "POSITION_SIZE_FRACTION",
    "MAX_CONCURRENT_POSITIONS",
    "STOP_LOSS_FRACTION",
    "TAKE_PROFIT_FRACTION",
    "ENFORCE_MAX_CONCURRENT_POSITIONS",
];

/// Immutable input of one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestConfiguration {
    pub stock_code: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub signal_types: Vec<SignalType>,
    pub commission_rate: f64,
    pub slippage_rate: f64,
    pub position_size_fraction: f64,
    pub max_concurrent_positions: usize,
    pub stop_loss_fraction: f64,
    pub take_profit_fraction: f64,
}

impl BacktestConfiguration {
    pub fn new(
        stock_code: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        signal_types: Vec<SignalType>,
    ) -> Self {
        Self {
            stock_code: stock_code.into(),
            start_date,
            end_date,
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            signal_types,
            commission_rate: DEFAULT_COMMISSION_RATE,
            slippage_rate: DEFAULT_SLIPPAGE_RATE,
            position_size_fraction: DEFAULT_POSITION_SIZE_FRACTION,
            max_concurrent_positions: 1,
            stop_loss_fraction: 0.0,
            take_profit_fraction: 0.0,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), BacktestError> {
        if self.stock_code.trim().is_empty() {
            return Err(BacktestError::invalid("stock code must not be empty"));
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(BacktestError::invalid(format!(
                "initial capital must be positive (value: {})",
                self.initial_capital
            )));
        }
        if self.end_date < self.start_date {
            return Err(BacktestError::invalid(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            )));
        }

        let mut seen = HashSet::new();
        for signal_type in &self.signal_types {
            if !seen.insert(*signal_type) {
                return Err(BacktestError::invalid(format!(
                    "signal type {} is listed more than once",
                    signal_type
                )));
            }
        }

        check_fraction("commission rate", self.commission_rate)?;
        check_fraction("slippage rate", self.slippage_rate)?;
        check_fraction("stop loss fraction", self.stop_loss_fraction)?;
        if !self.position_size_fraction.is_finite()
            || self.position_size_fraction <= 0.0
            || self.position_size_fraction > 1.0
        {
            return Err(BacktestError::invalid(format!(
                "position size fraction must be in (0, 1] (value: {})",
                self.position_size_fraction
            )));
        }
        if !self.take_profit_fraction.is_finite() || self.take_profit_fraction < 0.0 {
            return Err(BacktestError::invalid(format!(
                "take profit fraction must be >= 0 (value: {})",
                self.take_profit_fraction
            )));
        }
        if self.max_concurrent_positions < 1 {
            return Err(BacktestError::invalid(
                "max concurrent positions must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn period_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days()
    }

    pub fn period_label(&self) -> String {
        format_period(self.start_date, self.end_date)
    }
}

fn check_fraction(label: &str, value: f64) -> std::result::Result<(), BacktestError> {
    if !value.is_finite() || !(0.0..1.0).contains(&value) {
        return Err(BacktestError::invalid(format!(
            "{} must be in [0, 1) (value: {})",
            label, value
        )));
    }
    Ok(())
}

/// How many positions a run may hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionCapacity {
    /// One open position per run, whatever the configuration says.
    #[default]
    Single,
    /// Up to `max_concurrent_positions`, at most one per signal type.
    Configured,
}

impl PositionCapacity {
    pub fn slots(self, config: &BacktestConfiguration) -> usize {
        match self {
            PositionCapacity::Single => 1,
            PositionCapacity::Configured => config.max_concurrent_positions.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineRuntimeSettings {
    pub initial_capital: f64,
    pub commission_rate: f64,
    pub slippage_rate: f64,
    pub position_size_fraction: f64,
    pub max_concurrent_positions: usize,
    pub stop_loss_fraction: f64,
    pub take_profit_fraction: f64,
    pub enforce_max_concurrent_positions: bool,
}

impl Default for EngineRuntimeSettings {
    fn default() -> Self {
        Self {
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            commission_rate: DEFAULT_COMMISSION_RATE,
            slippage_rate: DEFAULT_SLIPPAGE_RATE,
            position_size_fraction: DEFAULT_POSITION_SIZE_FRACTION,
            max_concurrent_positions: 1,
            stop_loss_fraction: 0.0,
            take_profit_fraction: 0.0,
            enforce_max_concurrent_positions: false,
        }
    }
}

impl EngineRuntimeSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let initial_capital = setting_f64(
            settings,
            "BACKTEST_INITIAL_CAPITAL",
            defaults.initial_capital,
            Some(f64::MIN_POSITIVE),
            None,
        )?;
        let commission_rate =
            setting_fraction(settings, "TRADE_COMMISSION_RATE", defaults.commission_rate)?;
        let slippage_rate =
            setting_fraction(settings, "TRADE_SLIPPAGE_RATE", defaults.slippage_rate)?;
        let position_size_fraction = setting_f64(
            settings,
            "POSITION_SIZE_FRACTION",
            defaults.position_size_fraction,
            Some(0.0),
            Some(1.0),
        )?;
        let max_concurrent_positions = setting_usize(
            settings,
            "MAX_CONCURRENT_POSITIONS",
            defaults.max_concurrent_positions,
            1,
        )?;
        let stop_loss_fraction =
            setting_fraction(settings, "STOP_LOSS_FRACTION", defaults.stop_loss_fraction)?;
        let take_profit_fraction = setting_f64(
            settings,
            "TAKE_PROFIT_FRACTION",
            defaults.take_profit_fraction,
            Some(0.0),
            None,
        )?;
        let enforce_max_concurrent_positions = setting_bool(
            settings,
            "ENFORCE_MAX_CONCURRENT_POSITIONS",
            defaults.enforce_max_concurrent_positions,
        )?;

        if position_size_fraction <= 0.0 {
            return Err(anyhow!(
                "POSITION_SIZE_FRACTION must be > 0 (value: {})",
                position_size_fraction
            ));
        }

        Ok(Self {
            initial_capital,
            commission_rate,
            slippage_rate,
            position_size_fraction,
            max_concurrent_positions,
            stop_loss_fraction,
            take_profit_fraction,
            enforce_max_concurrent_positions,
        })
    }

    pub fn position_capacity(&self) -> PositionCapacity {
        if self.enforce_max_concurrent_positions {
            PositionCapacity::Configured
        } else {
            PositionCapacity::Single
        }
    }

    pub fn configuration_for(
        &self,
        stock_code: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        signal_types: Vec<SignalType>,
    ) -> BacktestConfiguration {
        BacktestConfiguration {
            stock_code: stock_code.to_string(),
            start_date,
            end_date,
            initial_capital: self.initial_capital,
            signal_types,
            commission_rate: self.commission_rate,
            slippage_rate: self.slippage_rate,
            position_size_fraction: self.position_size_fraction,
            max_concurrent_positions: self.max_concurrent_positions,
            stop_loss_fraction: self.stop_loss_fraction,
            take_profit_fraction: self.take_profit_fraction,
        }
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Same `[0, 1)` range that `BacktestConfiguration::validate` enforces.
fn setting_fraction(settings: &HashMap<String, String>, key: &str, default: f64) -> Result<f64> {
    let value = setting_f64(settings, key, default, Some(0.0), None)?;
    if value >= 1.0 {
        return Err(anyhow!("Setting {} must be < 1 (value: {})", key, value));
    }
    Ok(value)
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn setting_bool(settings: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Setting {} must be a boolean (value: {})", key, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_settings_map_yields_defaults() {
        let runtime = EngineRuntimeSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(runtime, EngineRuntimeSettings::default());
        assert_eq!(runtime.position_capacity(), PositionCapacity::Single);
    }

    #[test]
    fn parses_overrides_and_capacity_flag() {
        let runtime = EngineRuntimeSettings::from_settings_map(&settings(&[
            ("BACKTEST_INITIAL_CAPITAL", "50000"),
            ("MAX_CONCURRENT_POSITIONS", "3"),
            ("ENFORCE_MAX_CONCURRENT_POSITIONS", "true"),
            ("STOP_LOSS_FRACTION", " 0.05 "),
        ]))
        .unwrap();
        assert_eq!(runtime.initial_capital, 50_000.0);
        assert_eq!(runtime.max_concurrent_positions, 3);
        assert_eq!(runtime.stop_loss_fraction, 0.05);
        assert_eq!(runtime.position_capacity(), PositionCapacity::Configured);
    }

    #[test]
    fn rejects_malformed_settings() {
        for (key, value) in [
            ("TRADE_COMMISSION_RATE", "abc"),
            ("TRADE_SLIPPAGE_RATE", "1.5"),
            ("MAX_CONCURRENT_POSITIONS", "0"),
            ("MAX_CONCURRENT_POSITIONS", "1.5"),
            ("POSITION_SIZE_FRACTION", "0"),
            ("ENFORCE_MAX_CONCURRENT_POSITIONS", "maybe"),
        ] {
            assert!(
                EngineRuntimeSettings::from_settings_map(&settings(&[(key, value)])).is_err(),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn fraction_settings_match_configuration_bounds() {
        for key in [
            "TRADE_COMMISSION_RATE",
            "TRADE_SLIPPAGE_RATE",
            "STOP_LOSS_FRACTION",
        ] {
            assert!(
                EngineRuntimeSettings::from_settings_map(&settings(&[(key, "1")])).is_err(),
                "{}=1 should be rejected",
                key
            );
        }

        let runtime = EngineRuntimeSettings::from_settings_map(&settings(&[
            ("TRADE_COMMISSION_RATE", "0.999"),
            ("TRADE_SLIPPAGE_RATE", "0.999"),
            ("STOP_LOSS_FRACTION", "0.999"),
        ]))
        .unwrap();
        let config = runtime.configuration_for(
            "600000",
            date(2024, 1, 1),
            date(2024, 6, 30),
            vec![SignalType::Rsi],
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_configurations() {
        let valid = BacktestConfiguration::new(
            "600000",
            date(2024, 1, 1),
            date(2024, 3, 1),
            vec![SignalType::Rsi],
        );
        assert!(valid.validate().is_ok());

        let mut no_capital = valid.clone();
        no_capital.initial_capital = 0.0;
        let mut reversed = valid.clone();
        reversed.end_date = date(2023, 12, 31);
        let mut duplicate = valid.clone();
        duplicate.signal_types.push(SignalType::Rsi);
        let mut oversized = valid.clone();
        oversized.position_size_fraction = 1.2;
        let mut no_slots = valid.clone();
        no_slots.max_concurrent_positions = 0;

        for config in [no_capital, reversed, duplicate, oversized, no_slots] {
            assert!(matches!(
                config.validate(),
                Err(BacktestError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn configured_capacity_uses_configuration_slots() {
        let mut config = EngineRuntimeSettings::default().configuration_for(
            "600000",
            date(2024, 1, 1),
            date(2024, 1, 31),
            vec![],
        );
        config.max_concurrent_positions = 4;
        assert_eq!(PositionCapacity::Single.slots(&config), 1);
        assert_eq!(PositionCapacity::Configured.slots(&config), 4);
        assert_eq!(config.period_days(), 30);
    }
}
