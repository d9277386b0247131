use crate::catalog::{SignalCatalog, SignalCombination};
use crate::context::AppContext;
use crate::models::SignalObservation;
use crate::scorer::{ComboResult, ComboScorer};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{info, warn};
use std::path::PathBuf;

pub struct ScoreRequest {
    pub stock_codes: Vec<String>,
    pub combination: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub data_file: Option<PathBuf>,
    pub persist: bool,
}

pub async fn run(app: &AppContext, request: ScoreRequest) -> Result<()> {
    let mut context = match request.data_file.as_deref() {
        Some(path) => {
            app.engine_context_from_file(path, &request.stock_codes)
                .await?
        }
        None => app.engine_context(&request.stock_codes).await?,
    };

    let catalog = match context.database() {
        Some(db) => db.load_catalog().await?,
        None => SignalCatalog::with_defaults(),
    };
    let combinations = select_combinations(&catalog, request.combination.as_deref())?;

    let mut results: Vec<ComboResult> = Vec::new();
    for stock_code in context.market_data().stock_codes() {
        let observations: Vec<SignalObservation> = context
            .market_data()
            .observations_for_stock(&stock_code)
            .into_iter()
            .filter(|obs| request.start_date.map_or(true, |start| obs.date >= start))
            .filter(|obs| request.end_date.map_or(true, |end| obs.date <= end))
            .collect();
        if observations.is_empty() {
            warn!("No signal observations for {}; skipping", stock_code);
            continue;
        }

        for combination in &combinations {
            let series = ComboScorer::score_series(combination, &stock_code, &observations);
            if let Some(latest) = series.last() {
                println!(
                    "{} {} {}: score {:.4} ({} buy / {} sell of {} signals)",
                    stock_code,
                    latest.date,
                    combination.name,
                    latest.score,
                    latest.buy_signals,
                    latest.sell_signals,
                    latest.signal_count
                );
            }
            results.extend(series);
        }
    }

    info!(
        "Scored {} stock-day(s) across {} combination(s)",
        results.len(),
        combinations.len()
    );

    if request.persist {
        let Some(db) = context.database_mut() else {
            return Err(anyhow!(
                "Persisting combo scores requires a database connection"
            ));
        };
        let stored = db.insert_combo_results(&results).await?;
        info!("Stored {} combo result row(s)", stored);
    }

    Ok(())
}

fn select_combinations(
    catalog: &SignalCatalog,
    name: Option<&str>,
) -> Result<Vec<SignalCombination>> {
    if let Some(name) = name {
        let combination = catalog
            .combination_by_name(name)
            .ok_or_else(|| anyhow!("Unknown signal combination '{}'", name))?;
        return Ok(vec![combination]);
    }

    let enabled: Vec<SignalCombination> = catalog
        .list_combinations()
        .into_iter()
        .filter(|combo| combo.enabled)
        .collect();
    if enabled.is_empty() {
        return Err(anyhow!("No enabled signal combinations to score"));
    }
    Ok(enabled)
}
