use crate::models::{PriceBar, SignalObservation};
use crate::signals::SignalType;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

/// Read-only source of historical prices and precomputed indicator readings.
///
/// Both methods return rows inside `[start, end]` in ascending date order.
/// Implementations own their retry policy; the engine never retries.
#[async_trait]
pub trait MarketDataStore: Send + Sync {
    async fn load_price_bars(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>>;

    async fn load_signal_series(
        &self,
        stock_code: &str,
        signal_type: SignalType,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SignalObservation>>;
}
