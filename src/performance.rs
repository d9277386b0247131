use crate::models::*;
use crate::signals::SignalType;
use statrs::statistics::Statistics;

pub const RISK_FREE_RATE_ANNUAL: f64 = 0.03;
pub const DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeStatistics {
    pub total_trades: i32,
    pub winning_trades: i32,
    pub losing_trades: i32,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub avg_winning: f64,
    pub avg_losing: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate_performance(
        initial_capital: f64,
        final_capital: f64,
        days_in_window: i64,
        daily_snapshots: &[DailyPortfolioSnapshot],
        trades: &[BacktestTrade],
        benchmark_return: f64,
    ) -> BacktestPerformance {
        let pnls: Vec<f64> = trades.iter().map(|trade| trade.pnl).collect();
        let stats = Self::trade_statistics(&pnls);

        let total_return = Self::total_return(initial_capital, final_capital);
        let annualized_return = Self::annualized_return(total_return, days_in_window);

        let values: Vec<f64> = daily_snapshots.iter().map(|s| s.portfolio_value).collect();
        let max_drawdown = Self::max_drawdown(&values);

        let returns: Vec<f64> = daily_snapshots
            .iter()
            .skip(1)
            .map(|s| s.daily_return)
            .collect();
        let sharpe_ratio = Self::sharpe_ratio(&returns);

        BacktestPerformance {
            total_return,
            annualized_return,
            max_drawdown,
            sharpe_ratio,
            win_rate: stats.win_rate,
            profit_factor: stats.profit_factor,
            total_trades: stats.total_trades,
            winning_trades: stats.winning_trades,
            losing_trades: stats.losing_trades,
            avg_winning: stats.avg_winning,
            avg_losing: stats.avg_losing,
            benchmark_return,
            alpha: annualized_return - benchmark_return,
            beta: Self::beta(daily_snapshots, benchmark_return),
        }
    }

    pub fn total_return(initial_capital: f64, final_capital: f64) -> f64 {
        if initial_capital <= 0.0 || !final_capital.is_finite() {
            return 0.0;
        }
        (final_capital - initial_capital) / initial_capital
    }

    pub fn annualized_return(total_return: f64, days_in_window: i64) -> f64 {
        if days_in_window <= 0 || !total_return.is_finite() {
            return 0.0;
        }
        let growth = 1.0 + total_return;
        if growth <= 0.0 {
            return -1.0;
        }
        growth.powf(DAYS_PER_YEAR / days_in_window as f64) - 1.0
    }

    /// Largest peak-to-trough decline as a fraction of the peak.
    pub fn max_drawdown(values: &[f64]) -> f64 {
        let mut peak = f64::NEG_INFINITY;
        let mut max_drawdown = 0.0_f64;

        for value in values.iter().copied().filter(|v| v.is_finite()) {
            if value > peak {
                peak = value;
                continue;
            }
            if peak <= 0.0 {
                continue;
            }
            let drawdown = (peak - value) / peak;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }

        max_drawdown.clamp(0.0, 1.0)
    }

    /// Annualized Sharpe ratio of a daily return series using the population
    /// standard deviation.
    pub fn sharpe_ratio(daily_returns: &[f64]) -> f64 {
        if daily_returns.is_empty() {
            return 0.0;
        }

        let mean_return = daily_returns.iter().mean();
        let std_dev = daily_returns.iter().population_std_dev();
        if !std_dev.is_finite() || std_dev <= f64::EPSILON {
            return 0.0;
        }

        let daily_risk_free = RISK_FREE_RATE_ANNUAL / DAYS_PER_YEAR;
        (mean_return - daily_risk_free) / std_dev * DAYS_PER_YEAR.sqrt()
    }

    pub fn trade_statistics(pnls: &[f64]) -> TradeStatistics {
        let total_trades = pnls.len() as i32;
        let winners: Vec<f64> = pnls.iter().copied().filter(|pnl| *pnl > 0.0).collect();
        let losers: Vec<f64> = pnls
            .iter()
            .copied()
            .filter(|pnl| *pnl < 0.0)
            .map(f64::abs)
            .collect();

        let gross_profit: f64 = winners.iter().sum();
        let gross_loss: f64 = losers.iter().sum();

        let win_rate = if total_trades > 0 {
            winners.len() as f64 / total_trades as f64
        } else {
            0.0
        };
        // No losing trades: report the trade count instead of infinity.
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            total_trades as f64
        };

        TradeStatistics {
            total_trades,
            winning_trades: winners.len() as i32,
            losing_trades: losers.len() as i32,
            win_rate,
            profit_factor,
            gross_profit,
            gross_loss,
            avg_winning: average(&winners),
            avg_losing: average(&losers),
        }
    }

    /// Buy-and-hold return of the price series.
    pub fn benchmark_return(bars: &[PriceBar]) -> f64 {
        match (bars.first(), bars.last()) {
            (Some(first), Some(last)) if bars.len() >= 2 && first.close > 0.0 => {
                (last.close - first.close) / first.close
            }
            _ => 0.0,
        }
    }

    /// Scale proxy: mean cumulative return over the benchmark return.
    pub fn beta(daily_snapshots: &[DailyPortfolioSnapshot], benchmark_return: f64) -> f64 {
        if daily_snapshots.len() < 2 || benchmark_return == 0.0 || !benchmark_return.is_finite() {
            return 1.0;
        }
        let mean_cumulative = daily_snapshots
            .iter()
            .map(|s| s.cumulative_return)
            .mean();
        mean_cumulative / benchmark_return
    }

    pub fn signal_result(
        signal_type: SignalType,
        initial_capital: f64,
        equity_curve: &[f64],
        pnls: &[f64],
    ) -> SignalResult {
        let stats = Self::trade_statistics(pnls);
        let realized: f64 = pnls.iter().sum();
        let total_return = if initial_capital > 0.0 {
            realized / initial_capital
        } else {
            0.0
        };

        SignalResult {
            signal_type,
            total_return,
            win_rate: stats.win_rate,
            profit_factor: stats.profit_factor,
            max_drawdown: Self::max_drawdown(equity_curve),
            sharpe_ratio: Self::sharpe_ratio(&daily_returns(equity_curve)),
            total_trades: stats.total_trades,
            winning_trades: stats.winning_trades,
        }
    }
}

pub fn daily_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|window| {
            if window[0] > 0.0 {
                (window[1] - window[0]) / window[0]
            } else {
                0.0
            }
        })
        .collect()
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn snapshot(day: u32, value: f64, cumulative: f64) -> DailyPortfolioSnapshot {
        DailyPortfolioSnapshot {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            portfolio_value: value,
            daily_return: 0.0,
            cumulative_return: cumulative,
            benchmark_daily_return: 0.0,
        }
    }

    #[test]
    fn annualizes_over_calendar_days() {
        let total = PerformanceCalculator::total_return(100_000.0, 121_000.0);
        assert!((total - 0.21).abs() < 1e-12);
        let annualized = PerformanceCalculator::annualized_return(total, 730);
        assert!((annualized - 0.1).abs() < 1e-9);
        assert_eq!(PerformanceCalculator::annualized_return(total, 0), 0.0);
        assert_eq!(PerformanceCalculator::annualized_return(-1.0, 30), -1.0);
    }

    #[test]
    fn drawdown_is_zero_for_non_decreasing_series() {
        assert_eq!(
            PerformanceCalculator::max_drawdown(&[100.0, 100.0, 101.0, 105.0]),
            0.0
        );
        assert_eq!(PerformanceCalculator::max_drawdown(&[]), 0.0);
    }

    #[test]
    fn drawdown_tracks_running_peak() {
        let drawdown = PerformanceCalculator::max_drawdown(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((drawdown - 0.25).abs() < 1e-12);
        let wiped = PerformanceCalculator::max_drawdown(&[100.0, -5.0]);
        assert!((0.0..=1.0).contains(&wiped));
    }

    #[test]
    fn sharpe_uses_population_deviation_and_daily_risk_free_rate() {
        let returns = [0.01, -0.01, 0.02, 0.0];
        let mean: f64 = 0.005;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / 4.0;
        let expected = (mean - 0.03 / 365.0) / variance.sqrt() * 365.0_f64.sqrt();
        let sharpe = PerformanceCalculator::sharpe_ratio(&returns);
        assert!((sharpe - expected).abs() < 1e-9);

        assert_eq!(PerformanceCalculator::sharpe_ratio(&[]), 0.0);
        assert_eq!(PerformanceCalculator::sharpe_ratio(&[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn profit_factor_falls_back_to_trade_count() {
        let stats = PerformanceCalculator::trade_statistics(&[10.0, 5.0]);
        assert_eq!(stats.profit_factor, 2.0);
        assert_eq!(stats.win_rate, 1.0);

        let mixed = PerformanceCalculator::trade_statistics(&[30.0, -10.0, -5.0, 0.0]);
        assert_eq!(mixed.total_trades, 4);
        assert_eq!(mixed.winning_trades, 1);
        assert_eq!(mixed.losing_trades, 2);
        assert!((mixed.profit_factor - 2.0).abs() < 1e-12);
        assert!((mixed.avg_losing - 7.5).abs() < 1e-12);
        assert!((mixed.win_rate - 0.25).abs() < 1e-12);

        assert_eq!(PerformanceCalculator::trade_statistics(&[]).profit_factor, 0.0);
    }

    #[test]
    fn beta_is_mean_cumulative_over_benchmark() {
        let snapshots = vec![snapshot(1, 100.0, 0.0), snapshot(2, 110.0, 0.1)];
        assert!((PerformanceCalculator::beta(&snapshots, 0.2) - 0.25).abs() < 1e-12);
        assert_eq!(PerformanceCalculator::beta(&snapshots, 0.0), 1.0);
        assert_eq!(PerformanceCalculator::beta(&snapshots[..1], 0.2), 1.0);
    }

    #[test]
    fn signal_result_reports_realized_return() {
        let result = PerformanceCalculator::signal_result(
            SignalType::Rsi,
            1_000.0,
            &[1_000.0, 1_050.0, 1_020.0, 1_100.0],
            &[100.0],
        );
        assert!((result.total_return - 0.1).abs() < 1e-12);
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.winning_trades, 1);
        assert!((result.max_drawdown - 30.0 / 1_050.0).abs() < 1e-12);
    }
}
