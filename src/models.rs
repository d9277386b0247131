use crate::signals::SignalType;
use anyhow::anyhow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBar {
    pub stock_code: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// One normalized indicator reading for one stock on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalObservation {
    pub stock_code: String,
    pub date: NaiveDate,
    pub signal_type: SignalType,
    pub signal_value: f64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    Long,
    Short,
}

impl PositionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionType::Long => "long",
            PositionType::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    PeriodEnd,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "signal",
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
            ExitReason::PeriodEnd => "period end",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A simulated holding. `close_time`/`close_price` mirror the open values
/// until the position is closed, then are overwritten exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestPosition {
    pub open_time: NaiveDate,
    pub close_time: NaiveDate,
    pub open_price: f64,
    pub close_price: f64,
    pub quantity: f64,
    pub position_type: PositionType,
    pub realized_pnl: f64,
    pub realized_pnl_pct: f64,
    pub holding_days: i64,
    pub exit_reason: Option<ExitReason>,
    pub originating_signal_type: SignalType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestTrade {
    pub trade_id: String,
    pub stock_code: String,
    pub open_time: NaiveDate,
    pub close_time: NaiveDate,
    pub open_price: f64,
    pub close_price: f64,
    pub quantity: f64,
    pub position_type: PositionType,
    pub pnl: f64,
    pub pnl_percentage: f64,
    pub commission_paid: f64,
    pub slippage_paid: f64,
    pub originating_signal_type: SignalType,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPortfolioSnapshot {
    pub date: NaiveDate,
    pub portfolio_value: f64,
    pub daily_return: f64,
    pub cumulative_return: f64,
    pub benchmark_daily_return: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalResult {
    pub signal_type: SignalType,
    pub total_return: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub total_trades: i32,
    pub winning_trades: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestPerformance {
    pub total_return: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: i32,
    pub winning_trades: i32,
    pub losing_trades: i32,
    pub avg_winning: f64,
    pub avg_losing: f64,
    pub benchmark_return: f64,
    pub alpha: f64,
    pub beta: f64,
}

/// Terminal aggregate of one run. Owned by the caller; the engine keeps no
/// reference to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub stock_code: String,
    pub period: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub performance: BacktestPerformance,
    pub signal_results: BTreeMap<SignalType, SignalResult>,
    pub daily_snapshots: Vec<DailyPortfolioSnapshot>,
    pub positions: Vec<BacktestPosition>,
    pub trades: Vec<BacktestTrade>,
}

pub fn generate_trade_id(stock_code: &str, signal_type: SignalType, date: NaiveDate) -> String {
    format!(
        "{}_{}_{}",
        stock_code,
        signal_type.as_str(),
        date.format("%Y%m%d")
    )
}

pub fn format_period(start: NaiveDate, end: NaiveDate) -> String {
    format!("{} - {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
}
