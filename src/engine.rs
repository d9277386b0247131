use crate::config::{BacktestConfiguration, EngineRuntimeSettings, PositionCapacity};
use crate::error::{BacktestError, Result};
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::signals::{determine_signal_action, SignalType};
use crate::store::MarketDataStore;
use futures::future::try_join_all;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt;

/// Minimum number of price bars inside the window for a run to start.
pub const MIN_PRICE_BARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Closing,
    Completed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Closing => "closing",
            RunState::Completed => "completed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum EntrySignalOutcome {
    Executed,
    Skipped {
        reason: &'static str,
        details: Option<String>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum SellSignalOutcome {
    Executed,
    Skipped { reason: &'static str },
}

/// Everything a run reads from the store, fetched once before the day loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacktestInput {
    pub prices: Vec<PriceBar>,
    pub signals: BTreeMap<SignalType, Vec<SignalObservation>>,
}

#[derive(Debug, Default)]
struct SignalTrack {
    pnls: Vec<f64>,
    realized: f64,
    equity: Vec<f64>,
}

/// Mutable state of a single run. Built fresh per call and consumed into the
/// result, so nothing survives between runs.
struct RunLedger<'a> {
    config: &'a BacktestConfiguration,
    capacity: PositionCapacity,
    state: RunState,
    capital: f64,
    slots: Vec<Option<usize>>,
    positions: Vec<BacktestPosition>,
    trades: Vec<BacktestTrade>,
    snapshots: Vec<DailyPortfolioSnapshot>,
    tracks: BTreeMap<SignalType, SignalTrack>,
}

impl<'a> RunLedger<'a> {
    fn new(config: &'a BacktestConfiguration, capacity: PositionCapacity) -> Self {
        Self {
            config,
            capacity,
            state: RunState::Idle,
            capital: config.initial_capital,
            slots: vec![None; capacity.slots(config)],
            positions: Vec::new(),
            trades: Vec::new(),
            snapshots: Vec::new(),
            tracks: config
                .signal_types
                .iter()
                .map(|signal_type| (*signal_type, SignalTrack::default()))
                .collect(),
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(
            "Backtest {} state {} -> {}",
            self.config.stock_code, self.state, next
        );
        self.state = next;
    }

    fn open_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().flatten().copied()
    }

    fn mark_to_market(&self, close: f64) -> f64 {
        self.capital
            + self
                .open_indices()
                .map(|index| self.positions[index].quantity * close)
                .sum::<f64>()
    }

    fn apply_protective_exits(&mut self, bar: &PriceBar) {
        let stop_loss = self.config.stop_loss_fraction;
        let take_profit = self.config.take_profit_fraction;
        if stop_loss <= 0.0 && take_profit <= 0.0 {
            return;
        }

        let mut exits = Vec::new();
        for (slot, entry) in self.slots.iter().enumerate() {
            let Some(index) = entry else {
                continue;
            };
            let open_price = self.positions[*index].open_price;
            if stop_loss > 0.0 && bar.close <= open_price * (1.0 - stop_loss) {
                exits.push((slot, ExitReason::StopLoss));
            } else if take_profit > 0.0 && bar.close >= open_price * (1.0 + take_profit) {
                exits.push((slot, ExitReason::TakeProfit));
            }
        }

        for (slot, reason) in exits {
            self.close_slot(slot, bar, reason);
        }
    }

    fn execute_buy_signal(&mut self, signal_type: SignalType, bar: &PriceBar) -> EntrySignalOutcome {
        if !bar.close.is_finite() || bar.close <= 0.0 {
            return EntrySignalOutcome::Skipped {
                reason: "invalid_price",
                details: Some(format!("close {}", bar.close)),
            };
        }

        match self.capacity {
            PositionCapacity::Single => {
                if self.open_indices().next().is_some() {
                    return EntrySignalOutcome::Skipped {
                        reason: "position_already_open",
                        details: None,
                    };
                }
            }
            PositionCapacity::Configured => {
                if self
                    .open_indices()
                    .any(|index| self.positions[index].originating_signal_type == signal_type)
                {
                    return EntrySignalOutcome::Skipped {
                        reason: "signal_position_open",
                        details: None,
                    };
                }
            }
        }

        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            return EntrySignalOutcome::Skipped {
                reason: "position_limit",
                details: Some(format!("{} slots in use", self.slots.len())),
            };
        };

        let close = bar.close;
        let commission_rate = self.config.commission_rate;
        let slippage_rate = self.config.slippage_rate;

        let mut quantity = self.capital * self.config.position_size_fraction / close;
        let cost_per_share = close * (1.0 + commission_rate + slippage_rate);
        if quantity * cost_per_share > self.capital {
            quantity = self.capital / cost_per_share;
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return EntrySignalOutcome::Skipped {
                reason: "insufficient_capital",
                details: Some(format!("capital {:.2}", self.capital)),
            };
        }

        let open_price = close + close * slippage_rate;
        let position_value = quantity * close;
        let commission = position_value * commission_rate;
        let slippage_paid = quantity * close * slippage_rate;
        self.capital -= position_value + commission + slippage_paid;

        let stop_loss_price = (self.config.stop_loss_fraction > 0.0)
            .then(|| open_price * (1.0 - self.config.stop_loss_fraction));
        let take_profit_price = (self.config.take_profit_fraction > 0.0)
            .then(|| open_price * (1.0 + self.config.take_profit_fraction));

        let index = self.positions.len();
        self.positions.push(BacktestPosition {
            open_time: bar.date,
            close_time: bar.date,
            open_price,
            close_price: open_price,
            quantity,
            position_type: PositionType::Long,
            realized_pnl: 0.0,
            realized_pnl_pct: 0.0,
            holding_days: 0,
            exit_reason: None,
            originating_signal_type: signal_type,
        });
        self.trades.push(BacktestTrade {
            trade_id: generate_trade_id(&self.config.stock_code, signal_type, bar.date),
            stock_code: self.config.stock_code.clone(),
            open_time: bar.date,
            close_time: bar.date,
            open_price,
            close_price: open_price,
            quantity,
            position_type: PositionType::Long,
            pnl: 0.0,
            pnl_percentage: 0.0,
            commission_paid: commission,
            slippage_paid,
            originating_signal_type: signal_type,
            entry_price: close,
            exit_price: close,
            stop_loss_price,
            take_profit_price,
            notes: "open".to_string(),
        });
        self.slots[slot] = Some(index);

        debug!(
            "{} opened {} position on {}: {:.4} @ {:.4}",
            self.config.stock_code, signal_type, bar.date, quantity, open_price
        );
        EntrySignalOutcome::Executed
    }

    fn execute_sell_signal(&mut self, signal_type: SignalType, bar: &PriceBar) -> SellSignalOutcome {
        let matching = self.slots.iter().position(|entry| {
            entry.is_some_and(|index| self.positions[index].originating_signal_type == signal_type)
        });
        match matching {
            Some(slot) => {
                self.close_slot(slot, bar, ExitReason::Signal);
                SellSignalOutcome::Executed
            }
            None => SellSignalOutcome::Skipped {
                reason: "sell_no_matching_position",
            },
        }
    }

    fn close_slot(&mut self, slot: usize, bar: &PriceBar, reason: ExitReason) {
        let Some(index) = self.slots[slot].take() else {
            return;
        };

        let close_price = bar.close;
        let position = &mut self.positions[index];
        let exposure = position.quantity * position.open_price;
        let realized_pnl = position.quantity * (close_price - position.open_price);
        let realized_pnl_pct = if exposure > 0.0 {
            realized_pnl / exposure
        } else {
            0.0
        };

        position.close_time = bar.date;
        position.close_price = close_price;
        position.realized_pnl = realized_pnl;
        position.realized_pnl_pct = realized_pnl_pct;
        position.holding_days = (bar.date - position.open_time).num_days();
        position.exit_reason = Some(reason);
        let quantity = position.quantity;
        let signal_type = position.originating_signal_type;

        let trade = &mut self.trades[index];
        trade.close_time = bar.date;
        trade.close_price = close_price;
        trade.exit_price = close_price;
        trade.pnl = realized_pnl;
        trade.pnl_percentage = realized_pnl_pct;
        trade.notes = reason.as_str().to_string();

        self.capital += quantity * close_price;

        if let Some(track) = self.tracks.get_mut(&signal_type) {
            track.pnls.push(realized_pnl);
            track.realized += realized_pnl;
        }

        debug!(
            "{} closed {} position on {} ({}): pnl {:.2}",
            self.config.stock_code, signal_type, bar.date, reason, realized_pnl
        );
    }

    fn force_liquidation(&mut self, bar: &PriceBar) {
        for slot in 0..self.slots.len() {
            self.close_slot(slot, bar, ExitReason::PeriodEnd);
        }
    }

    fn record_snapshot(&mut self, bar: &PriceBar, previous_close: Option<f64>, value: f64) {
        let initial = self.config.initial_capital;
        let daily_return = match self.snapshots.last() {
            Some(previous) if previous.portfolio_value > 0.0 => {
                (value - previous.portfolio_value) / previous.portfolio_value
            }
            _ => 0.0,
        };
        let benchmark_daily_return = match previous_close {
            Some(previous) if previous > 0.0 => (bar.close - previous) / previous,
            _ => 0.0,
        };

        self.snapshots.push(DailyPortfolioSnapshot {
            date: bar.date,
            portfolio_value: value,
            daily_return,
            cumulative_return: (value - initial) / initial,
            benchmark_daily_return,
        });
    }

    fn update_signal_equity(&mut self, close: f64) {
        let initial = self.config.initial_capital;
        let mut unrealized: BTreeMap<SignalType, f64> = BTreeMap::new();
        for index in self.open_indices() {
            let position = &self.positions[index];
            *unrealized
                .entry(position.originating_signal_type)
                .or_default() += position.quantity * (close - position.open_price);
        }

        for (signal_type, track) in self.tracks.iter_mut() {
            let open_pnl = unrealized.get(signal_type).copied().unwrap_or(0.0);
            track.equity.push(initial + track.realized + open_pnl);
        }
    }

    fn into_result(self, bars: &[PriceBar]) -> BacktestResult {
        let config = self.config;
        let benchmark_return = PerformanceCalculator::benchmark_return(bars);
        let performance = PerformanceCalculator::calculate_performance(
            config.initial_capital,
            self.capital,
            config.period_days(),
            &self.snapshots,
            &self.trades,
            benchmark_return,
        );

        let signal_results = self
            .tracks
            .iter()
            .map(|(signal_type, track)| {
                (
                    *signal_type,
                    PerformanceCalculator::signal_result(
                        *signal_type,
                        config.initial_capital,
                        &track.equity,
                        &track.pnls,
                    ),
                )
            })
            .collect();

        BacktestResult {
            stock_code: config.stock_code.clone(),
            period: config.period_label(),
            start_date: config.start_date,
            end_date: config.end_date,
            initial_capital: config.initial_capital,
            final_capital: self.capital,
            performance,
            signal_results,
            daily_snapshots: self.snapshots,
            positions: self.positions,
            trades: self.trades,
        }
    }
}

/// Day-stepped simulation of one stock against a set of signal types.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktestEngine {
    capacity: PositionCapacity,
}

impl BacktestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: PositionCapacity) -> Self {
        Self { capacity }
    }

    pub fn from_runtime_settings(settings: &EngineRuntimeSettings) -> Self {
        Self::with_capacity(settings.position_capacity())
    }

    pub fn capacity(&self) -> PositionCapacity {
        self.capacity
    }

    /// Loads the run's input from `store` and simulates it. Either returns a
    /// complete result or an error.
    pub async fn run<S>(&self, store: &S, config: &BacktestConfiguration) -> Result<BacktestResult>
    where
        S: MarketDataStore + ?Sized,
    {
        config.validate()?;
        info!(
            "Starting backtest for {} over {} with {} signal types",
            config.stock_code,
            config.period_label(),
            config.signal_types.len()
        );

        let input = Self::load_input(store, config).await?;
        let result = self.simulate(config, &input)?;

        info!(
            "Backtest for {} completed: {} trades, total return {:.2}%, max drawdown {:.2}%",
            config.stock_code,
            result.performance.total_trades,
            result.performance.total_return * 100.0,
            result.performance.max_drawdown * 100.0
        );
        Ok(result)
    }

    pub async fn load_input<S>(store: &S, config: &BacktestConfiguration) -> Result<BacktestInput>
    where
        S: MarketDataStore + ?Sized,
    {
        let stock_code = config.stock_code.as_str();
        let prices = store
            .load_price_bars(stock_code, config.start_date, config.end_date)
            .await
            .map_err(|err| {
                BacktestError::data_access(format!("loading price bars for {}", stock_code), err)
            })?;

        let available = prices
            .iter()
            .filter(|bar| bar.date >= config.start_date && bar.date <= config.end_date)
            .count();
        if available < MIN_PRICE_BARS {
            return Err(insufficient_data(stock_code, available));
        }

        let series = try_join_all(config.signal_types.iter().map(|signal_type| async move {
            store
                .load_signal_series(stock_code, *signal_type, config.start_date, config.end_date)
                .await
                .map(|observations| (*signal_type, observations))
                .map_err(|err| {
                    BacktestError::data_access(
                        format!("loading {} signals for {}", signal_type, stock_code),
                        err,
                    )
                })
        }))
        .await?;

        Ok(BacktestInput {
            prices,
            signals: series.into_iter().collect(),
        })
    }

    pub fn simulate(
        &self,
        config: &BacktestConfiguration,
        input: &BacktestInput,
    ) -> Result<BacktestResult> {
        config.validate()?;
        ensure_ascending(&config.stock_code, &input.prices)?;

        let start = input
            .prices
            .partition_point(|bar| bar.date < config.start_date);
        let end = input
            .prices
            .partition_point(|bar| bar.date <= config.end_date);
        let bars = &input.prices[start..end.max(start)];
        if bars.len() < MIN_PRICE_BARS {
            return Err(insufficient_data(&config.stock_code, bars.len()));
        }

        let series: BTreeMap<SignalType, Vec<&SignalObservation>> = config
            .signal_types
            .iter()
            .map(|signal_type| {
                let mut observations: Vec<&SignalObservation> = input
                    .signals
                    .get(signal_type)
                    .map(|all| {
                        all.iter()
                            .filter(|obs| obs.stock_code == config.stock_code)
                            .collect()
                    })
                    .unwrap_or_default();
                observations.sort_by_key(|obs| obs.date);
                (*signal_type, observations)
            })
            .collect();
        let mut cursors: BTreeMap<SignalType, usize> = config
            .signal_types
            .iter()
            .map(|signal_type| (*signal_type, 0))
            .collect();

        let mut ledger = RunLedger::new(config, self.capacity);
        ledger.transition(RunState::Running);

        let mut previous_close = None;
        let mut skipped_entries = 0usize;

        for bar in bars {
            let value = ledger.mark_to_market(bar.close);
            ledger.apply_protective_exits(bar);

            for signal_type in &config.signal_types {
                let (Some(observations), Some(cursor)) =
                    (series.get(signal_type), cursors.get_mut(signal_type))
                else {
                    continue;
                };
                while *cursor < observations.len() && observations[*cursor].date < bar.date {
                    *cursor += 1;
                }
                let Some(observation) = observations
                    .get(*cursor)
                    .filter(|obs| obs.date == bar.date)
                else {
                    continue;
                };

                match determine_signal_action(*signal_type, observation.signal_value) {
                    SignalAction::Buy => {
                        if let EntrySignalOutcome::Skipped { reason, details } =
                            ledger.execute_buy_signal(*signal_type, bar)
                        {
                            skipped_entries += 1;
                            debug!(
                                "{} buy from {} skipped on {}: {} {}",
                                config.stock_code,
                                signal_type,
                                bar.date,
                                reason,
                                details.unwrap_or_default()
                            );
                        }
                    }
                    SignalAction::Sell => {
                        if let SellSignalOutcome::Skipped { reason } =
                            ledger.execute_sell_signal(*signal_type, bar)
                        {
                            debug!(
                                "{} sell from {} skipped on {}: {}",
                                config.stock_code, signal_type, bar.date, reason
                            );
                        }
                    }
                    SignalAction::Hold => {}
                }
            }

            ledger.record_snapshot(bar, previous_close, value);
            ledger.update_signal_equity(bar.close);
            previous_close = Some(bar.close);
        }

        ledger.transition(RunState::Closing);
        if let Some(last) = bars.last() {
            ledger.force_liquidation(last);
        }
        ledger.transition(RunState::Completed);

        if skipped_entries > 0 {
            debug!(
                "{} skipped {} buy signals over {}",
                config.stock_code,
                skipped_entries,
                config.period_label()
            );
        }

        Ok(ledger.into_result(bars))
    }
}

fn insufficient_data(stock_code: &str, available: usize) -> BacktestError {
    BacktestError::InsufficientData {
        stock_code: stock_code.to_string(),
        available,
        required: MIN_PRICE_BARS,
    }
}

fn ensure_ascending(stock_code: &str, bars: &[PriceBar]) -> Result<()> {
    for window in bars.windows(2) {
        if window[1].date <= window[0].date {
            return Err(BacktestError::data_access(
                format!("reading price bars for {}", stock_code),
                format!(
                    "price bars out of order: {} followed by {}",
                    window[0].date, window[1].date
                ),
            ));
        }
    }
    Ok(())
}
