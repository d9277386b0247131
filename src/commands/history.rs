use crate::context::AppContext;
use anyhow::Result;
use log::info;

/// Prints stored backtests and the latest combo scores for one stock.
pub async fn run(
    app: &AppContext,
    stock_code: &str,
    combo_id: Option<i64>,
    limit: i64,
) -> Result<()> {
    let db = app.database().await?;

    let history = db.get_backtest_history(stock_code, limit).await?;
    if history.is_empty() {
        info!("No stored backtests for {}", stock_code);
    }
    for entry in &history {
        let performance = &entry.result.performance;
        println!(
            "{} {} [{}] {}: return {:.2}%, drawdown {:.2}%, {} trades",
            entry.created_at.format("%Y-%m-%d %H:%M"),
            entry.id,
            entry.combination.as_deref().unwrap_or("custom"),
            entry.result.period,
            performance.total_return * 100.0,
            performance.max_drawdown * 100.0,
            performance.total_trades
        );
    }

    let scores = db.get_combo_results(stock_code, combo_id, limit).await?;
    if scores.is_empty() {
        info!("No stored combo scores for {}", stock_code);
    }
    for score in &scores {
        println!(
            "{} {}: {:.4} ({})",
            score.date, score.combo_name, score.score, score.description
        );
    }

    Ok(())
}
