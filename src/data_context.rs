use crate::config::ENGINE_SETTING_KEYS;
use crate::database::Database;
use crate::models::{PriceBar, SignalObservation};
use crate::signals::SignalType;
use crate::store::MarketDataStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    price_bars: Vec<PriceBar>,
    observations: Vec<SignalObservation>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

fn scrub_snapshot_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    settings
        .iter()
        .filter(|(key, _)| ENGINE_SETTING_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// In-memory price and signal store, loaded once from the database or a
/// snapshot file and shared read-only between runs.
#[derive(Debug, Default, Clone)]
pub struct MarketData {
    price_bars: HashMap<String, Vec<PriceBar>>,
    observations: HashMap<(String, SignalType), Vec<SignalObservation>>,
    settings: HashMap<String, String>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(price_bars: Vec<PriceBar>, observations: Vec<SignalObservation>) -> Self {
        let mut data = Self::new();
        data.insert_price_bars(price_bars);
        data.insert_observations(observations);
        data
    }

    /// Loads every stock in `stock_codes`, or every stock in the database when
    /// the list is empty.
    pub async fn load(db: &Database, stock_codes: &[String]) -> Result<Self> {
        info!("Loading price bars from database...");
        let price_bars = db.get_all_price_bars(stock_codes).await?;
        if price_bars.is_empty() {
            return Err(anyhow!("No price data available for the requested stocks"));
        }

        info!("Loading signal observations from database...");
        let observations = db.get_all_signal_observations(stock_codes).await?;
        let settings = db.get_all_settings().await?;

        let mut data = Self::from_parts(price_bars, observations);
        data.settings = settings;

        info!(
            "Loaded {} price bars and {} signal observations for {} stocks",
            data.price_bar_count(),
            data.observation_count(),
            data.price_bars.len()
        );
        Ok(data)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }
        if snapshot.price_bars.is_empty() {
            return Err(anyhow!("Market data snapshot has no price bars"));
        }

        let mut data = Self::from_parts(snapshot.price_bars, snapshot.observations);
        data.settings = snapshot.settings;
        Ok(data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);

        let mut price_bars: Vec<PriceBar> = Vec::with_capacity(self.price_bar_count());
        for code in self.stock_codes() {
            if let Some(bars) = self.price_bars.get(&code) {
                price_bars.extend(bars.iter().cloned());
            }
        }
        let mut keys: Vec<&(String, SignalType)> = self.observations.keys().collect();
        keys.sort();
        let observations = keys
            .into_iter()
            .filter_map(|key| self.observations.get(key))
            .flat_map(|series| series.iter().cloned())
            .collect();

        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            price_bars,
            observations,
            settings: scrub_snapshot_settings(&self.settings),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    /// Adds bars, keeping each stock's series sorted with one bar per date.
    pub fn insert_price_bars(&mut self, bars: Vec<PriceBar>) {
        let mut touched = BTreeSet::new();
        for bar in bars {
            touched.insert(bar.stock_code.clone());
            self.price_bars
                .entry(bar.stock_code.clone())
                .or_default()
                .push(bar);
        }
        for code in touched {
            if let Some(series) = self.price_bars.get_mut(&code) {
                series.sort_by_key(|bar| bar.date);
                series.dedup_by_key(|bar| bar.date);
            }
        }
    }

    pub fn insert_observations(&mut self, observations: Vec<SignalObservation>) {
        let mut touched = BTreeSet::new();
        for observation in observations {
            let key = (observation.stock_code.clone(), observation.signal_type);
            touched.insert(key.clone());
            self.observations.entry(key).or_default().push(observation);
        }
        for key in touched {
            if let Some(series) = self.observations.get_mut(&key) {
                series.sort_by_key(|obs| obs.date);
                series.dedup_by_key(|obs| obs.date);
            }
        }
    }

    /// Drops every stock not listed in `stock_codes`. An empty list keeps all.
    pub fn retain_stocks(&mut self, stock_codes: &[String]) {
        if stock_codes.is_empty() {
            return;
        }
        let keep: BTreeSet<&str> = stock_codes.iter().map(String::as_str).collect();
        self.price_bars.retain(|code, _| keep.contains(code.as_str()));
        self.observations
            .retain(|(code, _), _| keep.contains(code.as_str()));
    }

    pub fn with_settings(mut self, settings: HashMap<String, String>) -> Self {
        self.settings = settings;
        self
    }

    pub fn has_data(&self) -> bool {
        !self.price_bars.is_empty()
    }

    pub fn stock_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.price_bars.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn price_bars(&self, stock_code: &str) -> &[PriceBar] {
        self.price_bars
            .get(stock_code)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn observations(&self, stock_code: &str, signal_type: SignalType) -> &[SignalObservation] {
        self.observations
            .get(&(stock_code.to_string(), signal_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every observation for a stock across all signal types, by date.
    pub fn observations_for_stock(&self, stock_code: &str) -> Vec<SignalObservation> {
        let mut all: Vec<SignalObservation> = SignalType::ALL
            .iter()
            .flat_map(|signal_type| self.observations(stock_code, *signal_type).iter().cloned())
            .collect();
        all.sort_by_key(|obs| obs.date);
        all
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    pub fn price_bar_count(&self) -> usize {
        self.price_bars.values().map(Vec::len).sum()
    }

    pub fn observation_count(&self) -> usize {
        self.observations.values().map(Vec::len).sum()
    }
}

fn within_window<T>(
    series: &[T],
    date_of: impl Fn(&T) -> NaiveDate,
    start: NaiveDate,
    end: NaiveDate,
) -> &[T] {
    let lower = series.partition_point(|item| date_of(item) < start);
    let upper = series.partition_point(|item| date_of(item) <= end);
    &series[lower..upper.max(lower)]
}

#[async_trait]
impl MarketDataStore for MarketData {
    async fn load_price_bars(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        Ok(within_window(self.price_bars(stock_code), |bar| bar.date, start, end).to_vec())
    }

    async fn load_signal_series(
        &self,
        stock_code: &str,
        signal_type: SignalType,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SignalObservation>> {
        Ok(within_window(
            self.observations(stock_code, signal_type),
            |obs| obs.date,
            start,
            end,
        )
        .to_vec())
    }
}
