use crate::backtester::BatchOutcome;
use crate::catalog::{SignalCatalog, COMPREHENSIVE_COMBINATION};
use crate::context::{AppContext, EngineContext};
use crate::models::BacktestResult;
use crate::signals::SignalType;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{info, warn};
use std::path::PathBuf;

pub struct BacktestRequest {
    pub stock_codes: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub combination: Option<String>,
    pub signals: Vec<SignalType>,
    pub data_file: Option<PathBuf>,
    pub persist: bool,
    pub concurrency: Option<usize>,
}

pub async fn run(app: &AppContext, request: BacktestRequest) -> Result<()> {
    let context = match request.data_file.as_deref() {
        Some(path) => {
            app.engine_context_from_file(path, &request.stock_codes)
                .await?
        }
        None => app.engine_context(&request.stock_codes).await?,
    };

    let (combination_name, signal_types) = resolve_signal_types(&context, &request).await?;
    let stock_codes = if request.stock_codes.is_empty() {
        context.market_data().stock_codes()
    } else {
        request.stock_codes.clone()
    };

    info!(
        "Backtesting {} stock(s) from {} to {} with signals [{}]",
        stock_codes.len(),
        request.start_date,
        request.end_date,
        signal_types
            .iter()
            .map(SignalType::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let configs = stock_codes
        .iter()
        .map(|code| {
            context.settings().configuration_for(
                code,
                request.start_date,
                request.end_date,
                signal_types.clone(),
            )
        })
        .collect::<Vec<_>>();

    let outcomes = context
        .runner()
        .run_batch(configs, request.concurrency)
        .await;

    let mut completed = 0usize;
    let mut persist_failures = 0usize;
    for BatchOutcome { config, result } in &outcomes {
        match result {
            Ok(result) => {
                completed += 1;
                print_summary(result);
                if request.persist {
                    match persist_result(&context, result, combination_name.as_deref()).await {
                        Ok(id) => info!("Stored backtest {} for {}", id, result.stock_code),
                        Err(err) => {
                            persist_failures += 1;
                            warn!(
                                "Failed to store backtest for {}: {}",
                                result.stock_code, err
                            );
                        }
                    }
                }
            }
            Err(err) => warn!("Backtest for {} failed: {}", config.stock_code, err),
        }
    }

    if completed == 0 {
        return Err(anyhow!("No backtest completed successfully"));
    }
    info!("Completed {} of {} backtests", completed, outcomes.len());
    if persist_failures > 0 {
        return Err(anyhow!(
            "{} of {} backtest result(s) could not be stored",
            persist_failures,
            completed
        ));
    }
    Ok(())
}

/// Explicit `--signals` win; otherwise the enabled members of the named (or
/// comprehensive) combination are used.
async fn resolve_signal_types(
    context: &EngineContext,
    request: &BacktestRequest,
) -> Result<(Option<String>, Vec<SignalType>)> {
    if !request.signals.is_empty() {
        return Ok((request.combination.clone(), request.signals.clone()));
    }

    let catalog = match context.database() {
        Some(db) => db.load_catalog().await?,
        None => SignalCatalog::with_defaults(),
    };
    let name = request
        .combination
        .as_deref()
        .unwrap_or(COMPREHENSIVE_COMBINATION);
    let (name, signal_types) = combination_signal_types(&catalog, name)?;
    Ok((Some(name), signal_types))
}

/// Enabled members of an enabled combination.
fn combination_signal_types(
    catalog: &SignalCatalog,
    name: &str,
) -> Result<(String, Vec<SignalType>)> {
    let combination = catalog
        .combination_by_name(name)
        .ok_or_else(|| anyhow!("Unknown signal combination '{}'", name))?;
    if !combination.enabled {
        return Err(anyhow!(
            "Signal combination '{}' is disabled",
            combination.name
        ));
    }
    let signal_types = combination.member_types();
    if signal_types.is_empty() {
        return Err(anyhow!(
            "Signal combination '{}' has no enabled members",
            combination.name
        ));
    }
    Ok((combination.name, signal_types))
}

async fn persist_result(
    context: &EngineContext,
    result: &BacktestResult,
    combination: Option<&str>,
) -> Result<String> {
    let db = context
        .database()
        .ok_or_else(|| anyhow!("no database connection to store results"))?;
    db.insert_backtest_result(result, combination).await
}

fn print_summary(result: &BacktestResult) {
    let performance = &result.performance;
    println!("{} ({})", result.stock_code, result.period);
    println!(
        "  Capital: {:.2} -> {:.2}",
        result.initial_capital, result.final_capital
    );
    println!("  Total Return: {:.2}%", performance.total_return * 100.0);
    println!(
        "  Annualized Return: {:.2}%",
        performance.annualized_return * 100.0
    );
    println!("  Max Drawdown: {:.2}%", performance.max_drawdown * 100.0);
    println!("  Sharpe Ratio: {:.4}", performance.sharpe_ratio);
    println!(
        "  Trades: {} ({} winning, {} losing), Win Rate: {:.2}%",
        performance.total_trades,
        performance.winning_trades,
        performance.losing_trades,
        performance.win_rate * 100.0
    );
    println!(
        "  Benchmark: {:.2}%, Alpha: {:.2}%, Beta: {:.4}",
        performance.benchmark_return * 100.0,
        performance.alpha * 100.0,
        performance.beta
    );
    for (signal_type, signal) in &result.signal_results {
        println!(
            "  {}: return {:.2}%, {} trades, win rate {:.2}%",
            signal_type,
            signal.total_return * 100.0,
            signal.total_trades,
            signal.win_rate * 100.0
        );
    }
}
