use crate::context::AppContext;
use crate::data_context::MarketData;
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, output_path: &Path, stock_codes: &[String]) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let db = app.database().await?;
    let market_data = MarketData::load(&db, stock_codes).await?;

    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot with {} stock(s) written to {}",
        market_data.stock_codes().len(),
        output_path.display()
    );

    Ok(())
}
