use crate::config::BacktestConfiguration;
use crate::engine::{BacktestEngine, BacktestInput};
use crate::error::Result;
use crate::models::BacktestResult;
use crate::store::MarketDataStore;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// One entry of a batch: the configuration and its independent outcome.
#[derive(Debug)]
pub struct BatchOutcome {
    pub config: BacktestConfiguration,
    pub result: Result<BacktestResult>,
}

/// Concurrent loader count used when a batch does not specify one.
pub fn default_concurrency() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Runs backtests against a shared store. Runs share nothing but the store.
pub struct BacktestRunner<S: MarketDataStore + ?Sized> {
    store: Arc<S>,
    engine: BacktestEngine,
}

impl<S: MarketDataStore + ?Sized> BacktestRunner<S> {
    pub fn new(store: Arc<S>, engine: BacktestEngine) -> Self {
        Self { store, engine }
    }

    pub fn engine(&self) -> BacktestEngine {
        self.engine
    }

    pub fn store(&self) -> &S {
        self.store.as_ref()
    }

    pub async fn run(&self, config: &BacktestConfiguration) -> Result<BacktestResult> {
        self.engine.run(self.store.as_ref(), config).await
    }

    /// Loads inputs with at most `concurrency` store reads in flight, then
    /// simulates every loaded run on the rayon pool. Outcomes keep the order of
    /// `configs`.
    pub async fn run_batch(
        &self,
        configs: Vec<BacktestConfiguration>,
        concurrency: Option<usize>,
    ) -> Vec<BatchOutcome> {
        if configs.is_empty() {
            return Vec::new();
        }

        let limit = concurrency.unwrap_or_else(default_concurrency).max(1);
        let started = Instant::now();
        info!(
            "Loading inputs for {} backtests with {} concurrent readers",
            configs.len(),
            limit
        );

        let store = self.store.as_ref();
        let loaded: Vec<Result<BacktestInput>> = stream::iter(configs.iter().map(
            |config| async move {
                config.validate()?;
                BacktestEngine::load_input(store, config).await
            },
        ))
        .buffered(limit)
        .collect()
        .await;

        let engine = self.engine;
        let results: Vec<Result<BacktestResult>> = configs
            .par_iter()
            .zip(loaded.into_par_iter())
            .map(|(config, input)| input.and_then(|input| engine.simulate(config, &input)))
            .collect();

        let failures = results.iter().filter(|result| result.is_err()).count();
        if failures > 0 {
            warn!("{} of {} backtests failed", failures, results.len());
        }
        info!(
            "Completed {} backtests in {:.2}s",
            results.len(),
            started.elapsed().as_secs_f64()
        );

        configs
            .into_iter()
            .zip(results)
            .map(|(config, result)| BatchOutcome { config, result })
            .collect()
    }
}
