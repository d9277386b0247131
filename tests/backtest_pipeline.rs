use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use signal_backtest::backtester::BacktestRunner;
use signal_backtest::catalog::{SignalCatalog, OSCILLATION_COMBINATION};
use signal_backtest::config::BacktestConfiguration;
use signal_backtest::context::EngineContext;
use signal_backtest::data_context::MarketData;
use signal_backtest::engine::BacktestEngine;
use signal_backtest::error::BacktestError;
use signal_backtest::models::{ExitReason, PriceBar, SignalObservation};
use signal_backtest::scorer::ComboScorer;
use signal_backtest::signals::SignalType;
use signal_backtest::store::MarketDataStore;
use std::collections::HashMap;
use std::sync::{Arc, Once};

const MAIN_CODE: &str = "600000";
const SECOND_CODE: &str = "600036";
const SHORT_CODE: &str = "000001";

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn day(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + Duration::days(offset)
}

fn bars(code: &str, prices: &[f64]) -> Vec<PriceBar> {
    prices
        .iter()
        .enumerate()
        .map(|(i, close)| PriceBar {
            stock_code: code.to_string(),
            date: day(i as i64),
            open: *close,
            high: close * 1.01,
            low: close * 0.99,
            close: *close,
            volume: 10_000,
        })
        .collect()
}

fn observation(code: &str, offset: i64, signal_type: SignalType, value: f64) -> SignalObservation {
    SignalObservation {
        stock_code: code.to_string(),
        date: day(offset),
        signal_type,
        signal_value: value,
        description: Some(format!("{} reading", signal_type)),
    }
}

fn rising(len: usize) -> Vec<f64> {
    (0..len).map(|i| 10.0 + 0.2 * i as f64).collect()
}

fn seeded_market_data() -> MarketData {
    let mut price_bars = bars(MAIN_CODE, &rising(20));
    price_bars.extend(bars(
        SECOND_CODE,
        &[
            20.0, 20.5, 21.0, 20.0, 19.0, 18.5, 19.0, 19.5, 20.5, 21.5, 22.0, 21.0,
        ],
    ));
    price_bars.extend(bars(SHORT_CODE, &[5.0, 5.1, 5.2, 5.3, 5.4]));

    let observations = vec![
        observation(MAIN_CODE, 1, SignalType::Rsi, 0.8),
        observation(MAIN_CODE, 1, SignalType::Wr, -0.9),
        observation(MAIN_CODE, 1, SignalType::Cci, 0.2),
        observation(MAIN_CODE, 12, SignalType::Rsi, -0.7),
        observation(SECOND_CODE, 0, SignalType::Rsi, 0.9),
        observation(SECOND_CODE, 4, SignalType::Rsi, -0.9),
        observation(SECOND_CODE, 6, SignalType::Wr, 0.6),
    ];

    MarketData::from_parts(price_bars, observations)
}

fn config_for(code: &str, days: i64, signal_types: Vec<SignalType>) -> BacktestConfiguration {
    BacktestConfiguration::new(code, day(0), day(days - 1), signal_types)
}

struct UnreachableStore;

#[async_trait]
impl MarketDataStore for UnreachableStore {
    async fn load_price_bars(
        &self,
        _stock_code: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        Err(anyhow!("connection refused"))
    }

    async fn load_signal_series(
        &self,
        _stock_code: &str,
        _signal_type: SignalType,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<SignalObservation>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn runner_backtests_from_in_memory_market_data() {
    ensure_test_env();
    let runner = BacktestRunner::new(Arc::new(seeded_market_data()), BacktestEngine::new());
    let config = config_for(MAIN_CODE, 20, vec![SignalType::Rsi]);

    let result = runner.run(&config).await.unwrap();

    assert_eq!(result.stock_code, MAIN_CODE);
    assert_eq!(result.daily_snapshots.len(), 20);
    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.open_time, day(1));
    assert_eq!(trade.close_time, day(12));
    assert_eq!(trade.notes, ExitReason::Signal.as_str());
    assert!(trade.pnl > 0.0);
    assert!(result.performance.total_return > 0.0);
    assert_eq!(result.performance.winning_trades, 1);
    assert!(result.signal_results.contains_key(&SignalType::Rsi));
}

#[tokio::test]
async fn unreachable_store_surfaces_data_access_failure() {
    ensure_test_env();
    let runner = BacktestRunner::new(Arc::new(UnreachableStore), BacktestEngine::new());
    let err = runner
        .run(&config_for(MAIN_CODE, 20, vec![SignalType::Rsi]))
        .await
        .unwrap_err();
    assert!(matches!(err, BacktestError::DataAccess { .. }));
}

#[tokio::test]
async fn batch_keeps_input_order_and_isolates_failures() {
    ensure_test_env();
    let runner = BacktestRunner::new(Arc::new(seeded_market_data()), BacktestEngine::new());
    let configs = vec![
        config_for(SECOND_CODE, 12, vec![SignalType::Rsi, SignalType::Wr]),
        config_for(SHORT_CODE, 5, vec![SignalType::Rsi]),
        config_for(MAIN_CODE, 20, vec![SignalType::Rsi]),
    ];

    let outcomes = runner.run_batch(configs, Some(2)).await;

    let codes: Vec<&str> = outcomes
        .iter()
        .map(|outcome| outcome.config.stock_code.as_str())
        .collect();
    assert_eq!(codes, vec![SECOND_CODE, SHORT_CODE, MAIN_CODE]);
    assert!(outcomes[0].result.is_ok());
    assert!(matches!(
        outcomes[1].result,
        Err(BacktestError::InsufficientData { available: 5, .. })
    ));

    let single = runner.run(&outcomes[2].config).await.unwrap();
    assert_eq!(outcomes[2].result.as_ref().unwrap(), &single);

    let second = outcomes[0].result.as_ref().unwrap();
    assert!(second.trades.len() >= 2);
    assert!(second
        .trades
        .windows(2)
        .all(|pair| pair[0].close_time <= pair[1].open_time));
}

#[tokio::test]
async fn snapshot_file_reproduces_the_same_backtest() {
    ensure_test_env();
    let settings: HashMap<String, String> = [
        ("TRADE_COMMISSION_RATE", "0.001"),
        ("ALPHA_VANTAGE_KEY", "not-exported"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let data = seeded_market_data().with_settings(settings);
    let path = std::env::temp_dir().join(format!(
        "signal_backtest_snapshot_{}.bin",
        uuid::Uuid::new_v4()
    ));

    data.save_to_file(&path).unwrap();
    let loaded = MarketData::load_from_file(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.stock_codes(), data.stock_codes());
    assert_eq!(loaded.price_bar_count(), data.price_bar_count());
    assert_eq!(loaded.observation_count(), data.observation_count());
    assert!(!loaded.settings().contains_key("ALPHA_VANTAGE_KEY"));

    let context = EngineContext::from_components(None, loaded).unwrap();
    assert!((context.settings().commission_rate - 0.001).abs() < 1e-12);

    let config = config_for(MAIN_CODE, 20, vec![SignalType::Rsi]);
    let from_snapshot = context.runner().run(&config).await.unwrap();
    let from_memory = BacktestRunner::new(Arc::new(data), BacktestEngine::new())
        .run(&config)
        .await
        .unwrap();
    assert_eq!(from_snapshot, from_memory);
}

#[tokio::test]
async fn combination_members_drive_scoring_and_backtest() {
    ensure_test_env();
    let catalog = SignalCatalog::with_defaults();
    let oscillation = catalog.combination_by_name(OSCILLATION_COMBINATION).unwrap();
    let data = seeded_market_data();

    let day_one: Vec<SignalObservation> = data
        .observations_for_stock(MAIN_CODE)
        .into_iter()
        .filter(|obs| obs.date == day(1))
        .collect();
    // RSI buys 0.8 * 1.5, WR sells 0.9 * 1.2, CCI holds.
    let expected = (0.8 * 1.5 - 0.9 * 1.2) / 3.0;
    assert!((ComboScorer::score(&oscillation, &day_one) - expected).abs() < 1e-9);

    let series = ComboScorer::score_series(
        &oscillation,
        MAIN_CODE,
        &data.observations_for_stock(MAIN_CODE),
    );
    assert_eq!(series.len(), 2);
    assert_eq!(series[0].date, day(1));
    assert_eq!(series[0].combo_id, oscillation.id);
    assert!(series[1].score < 0.0);

    let runner = BacktestRunner::new(Arc::new(data), BacktestEngine::new());
    let config = config_for(MAIN_CODE, 20, oscillation.member_types());
    let result = runner.run(&config).await.unwrap();
    assert_eq!(result.signal_results.len(), oscillation.member_types().len());
    assert!(result.positions.len() <= 1 || result.positions.windows(2).all(|pair| {
        pair[0].close_time <= pair[1].open_time
    }));
}
