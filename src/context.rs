use crate::backtester::BacktestRunner;
use crate::config::{EngineRuntimeSettings, ENGINE_SETTING_KEYS};
use crate::data_context::MarketData;
use crate::database::Database;
use crate::engine::BacktestEngine;
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub fn has_database(&self) -> bool {
        self.database_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed commands."
            ));
        };
        Database::new(database_url).await
    }

    pub async fn engine_context(&self, stock_codes: &[String]) -> Result<EngineContext> {
        let database_url = self.database_url.as_deref().ok_or_else(|| {
            anyhow!("DATABASE_URL must be set to load market data from the database.")
        })?;
        EngineContext::initialize(database_url, stock_codes).await
    }

    pub async fn engine_context_from_file<P: AsRef<Path>>(
        &self,
        data_file: P,
        stock_codes: &[String],
    ) -> Result<EngineContext> {
        EngineContext::initialize_with_market_data_file(
            self.database_url.as_deref(),
            data_file,
            stock_codes,
        )
        .await
    }
}

/// Engine settings from the process environment, overridden by `stored`
/// (the database `settings` table or a snapshot's settings).
pub fn merged_runtime_settings(stored: &HashMap<String, String>) -> Result<EngineRuntimeSettings> {
    let mut merged: HashMap<String, String> = ENGINE_SETTING_KEYS
        .iter()
        .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();
    for key in ENGINE_SETTING_KEYS {
        if let Some(value) = stored.get(key) {
            merged.insert(key.to_string(), value.clone());
        }
    }
    EngineRuntimeSettings::from_settings_map(&merged).context("invalid engine settings")
}

/// Market data, settings and an optional database connection for one command.
pub struct EngineContext {
    db: Option<Database>,
    market_data: Arc<MarketData>,
    settings: EngineRuntimeSettings,
}

impl EngineContext {
    pub async fn initialize<S: AsRef<str>>(database_url: S, stock_codes: &[String]) -> Result<Self> {
        let db = Database::new(database_url).await?;
        let market_data = MarketData::load(&db, stock_codes).await?;
        Self::from_components(Some(db), market_data)
    }

    pub async fn initialize_with_market_data_file<P: AsRef<Path>>(
        database_url: Option<&str>,
        data_file: P,
        stock_codes: &[String],
    ) -> Result<Self> {
        let db = match database_url {
            Some(url) if !url.trim().is_empty() => match Database::new(url).await {
                Ok(db) => Some(db),
                Err(error) => {
                    warn!(
                        "Database connection unavailable ({}). Continuing with local market data snapshot only.",
                        error
                    );
                    None
                }
            },
            _ => {
                info!("Database URL not provided. Using local market data snapshot only.");
                None
            }
        };

        let mut market_data = MarketData::load_from_file(data_file)?;
        market_data.retain_stocks(stock_codes);
        if !market_data.has_data() {
            return Err(anyhow!(
                "Market data snapshot has no price bars for the requested stocks"
            ));
        }
        Self::from_components(db, market_data)
    }

    pub fn from_components(db: Option<Database>, market_data: MarketData) -> Result<Self> {
        let settings = merged_runtime_settings(market_data.settings())?;
        Ok(Self {
            db,
            market_data: Arc::new(market_data),
            settings,
        })
    }

    pub fn market_data(&self) -> &MarketData {
        &self.market_data
    }

    pub fn settings(&self) -> &EngineRuntimeSettings {
        &self.settings
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    pub fn database_mut(&mut self) -> Option<&mut Database> {
        self.db.as_mut()
    }

    pub fn runner(&self) -> BacktestRunner<MarketData> {
        BacktestRunner::new(
            Arc::clone(&self.market_data),
            BacktestEngine::from_runtime_settings(&self.settings),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PositionCapacity;

    #[test]
    fn stored_settings_configure_the_engine() {
        let stored: HashMap<String, String> = [
            ("TRADE_COMMISSION_RATE", "0.001"),
            ("ENFORCE_MAX_CONCURRENT_POSITIONS", "true"),
            ("MAX_CONCURRENT_POSITIONS", "3"),
            ("UNRELATED", "x"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings = merged_runtime_settings(&stored).unwrap();
        assert!((settings.commission_rate - 0.001).abs() < 1e-12);
        assert_eq!(settings.max_concurrent_positions, 3);
        assert_eq!(settings.position_capacity(), PositionCapacity::Configured);
    }

    #[test]
    fn invalid_stored_setting_is_rejected() {
        let stored: HashMap<String, String> =
            [("TRADE_SLIPPAGE_RATE".to_string(), "lots".to_string())]
                .into_iter()
                .collect();
        assert!(merged_runtime_settings(&stored).is_err());
    }

    #[test]
    fn runner_uses_shared_market_data() {
        let context = EngineContext::from_components(None, MarketData::new()).unwrap();
        assert!(context.database().is_none());
        assert_eq!(context.runner().engine().capacity(), PositionCapacity::Single);
        assert!(!context.market_data().has_data());
    }
}
