use crate::catalog::{SignalCatalog, SignalCombination, SignalDefinition};
use crate::error::BacktestError;
use crate::models::*;
use crate::retry::retry_store_read;
use crate::scorer::ComboResult;
use crate::signals::SignalType;
use crate::store::MarketDataStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tokio_postgres::{Client, NoTls, Row};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    setting_key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_daily (
    stock_code TEXT NOT NULL,
    trade_date DATE NOT NULL,
    open_price DOUBLE PRECISION NOT NULL,
    high_price DOUBLE PRECISION NOT NULL,
    low_price DOUBLE PRECISION NOT NULL,
    close_price DOUBLE PRECISION NOT NULL,
    volume BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (stock_code, trade_date)
);

CREATE TABLE IF NOT EXISTS technical_signals (
    stock_code TEXT NOT NULL,
    signal_date DATE NOT NULL,
    signal_type TEXT NOT NULL,
    signal_value DOUBLE PRECISION NOT NULL,
    description TEXT,
    PRIMARY KEY (stock_code, signal_type, signal_date)
);

CREATE TABLE IF NOT EXISTS signal_config (
    signal_type TEXT PRIMARY KEY,
    weight DOUBLE PRECISION NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    description TEXT NOT NULL DEFAULT '',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS signal_combo (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS combo_signal (
    combo_id BIGINT NOT NULL REFERENCES signal_combo (id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    signal_type TEXT NOT NULL REFERENCES signal_config (signal_type),
    weight DOUBLE PRECISION NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    description TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (combo_id, signal_type)
);

CREATE TABLE IF NOT EXISTS combo_result (
    combo_id BIGINT NOT NULL REFERENCES signal_combo (id) ON DELETE CASCADE,
    combo_name TEXT NOT NULL,
    stock_code TEXT NOT NULL,
    trade_date DATE NOT NULL,
    score DOUBLE PRECISION NOT NULL,
    signal_count INTEGER NOT NULL,
    buy_signals INTEGER NOT NULL,
    sell_signals INTEGER NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (combo_id, stock_code, trade_date)
);

CREATE TABLE IF NOT EXISTS backtest_results (
    id TEXT PRIMARY KEY,
    stock_code TEXT NOT NULL,
    combination TEXT,
    start_date DATE NOT NULL,
    end_date DATE NOT NULL,
    initial_capital DOUBLE PRECISION NOT NULL,
    final_capital DOUBLE PRECISION NOT NULL,
    total_return DOUBLE PRECISION NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_backtest_results_stock
    ON backtest_results (stock_code, created_at DESC);
";

/// Summary row of a stored backtest.
pub struct BacktestHistoryEntry {
    pub id: String,
    pub combination: Option<String>,
    pub created_at: DateTime<Utc>,
    pub result: BacktestResult,
}

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn apply_schema(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA)
            .await
            .context("failed to apply database schema")
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    pub async fn get_price_bars(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let rows = self
            .client
            .query(
                "SELECT stock_code, trade_date, open_price, high_price, low_price, close_price, volume
                 FROM stock_daily
                 WHERE stock_code = $1 AND trade_date BETWEEN $2 AND $3
                 ORDER BY trade_date",
                &[&stock_code, &start, &end],
            )
            .await?;
        Ok(rows.iter().map(price_bar_from_row).collect())
    }

    /// Every bar for `stock_codes`, or for all stocks when the list is empty.
    pub async fn get_all_price_bars(&self, stock_codes: &[String]) -> Result<Vec<PriceBar>> {
        let rows = if stock_codes.is_empty() {
            self.client
                .query(
                    "SELECT stock_code, trade_date, open_price, high_price, low_price, close_price, volume
                     FROM stock_daily
                     ORDER BY stock_code, trade_date",
                    &[],
                )
                .await?
        } else {
            let codes: Vec<&str> = stock_codes.iter().map(|s| s.as_str()).collect();
            self.client
                .query(
                    "SELECT stock_code, trade_date, open_price, high_price, low_price, close_price, volume
                     FROM stock_daily
                     WHERE stock_code = ANY($1)
                     ORDER BY stock_code, trade_date",
                    &[&codes],
                )
                .await?
        };
        Ok(rows.iter().map(price_bar_from_row).collect())
    }

    pub async fn get_signal_observations(
        &self,
        stock_code: &str,
        signal_type: SignalType,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SignalObservation>> {
        let rows = self
            .client
            .query(
                "SELECT stock_code, signal_date, signal_type, signal_value, description
                 FROM technical_signals
                 WHERE stock_code = $1 AND signal_type = $2 AND signal_date BETWEEN $3 AND $4
                 ORDER BY signal_date",
                &[&stock_code, &signal_type.as_str(), &start, &end],
            )
            .await?;
        rows.iter().map(observation_from_row).collect()
    }

    /// Every observation for `stock_codes`, or for all stocks when the list is
    /// empty. Rows with unknown signal types are skipped.
    pub async fn get_all_signal_observations(
        &self,
        stock_codes: &[String],
    ) -> Result<Vec<SignalObservation>> {
        let codes: Vec<&str> = stock_codes.iter().map(|s| s.as_str()).collect();
        let known: Vec<&str> = SignalType::ALL.iter().map(|t| t.as_str()).collect();
        let rows = self
            .client
            .query(
                "SELECT stock_code, signal_date, signal_type, signal_value, description
                 FROM technical_signals
                 WHERE (cardinality($1::TEXT[]) = 0 OR stock_code = ANY($1))
                   AND signal_type = ANY($2)
                 ORDER BY stock_code, signal_type, signal_date",
                &[&codes, &known],
            )
            .await?;
        rows.iter().map(observation_from_row).collect()
    }

    pub async fn get_signal_definitions(&self) -> Result<Vec<SignalDefinition>> {
        let rows = self
            .client
            .query(
                "SELECT signal_type, weight, enabled, description
                 FROM signal_config
                 ORDER BY signal_type",
                &[],
            )
            .await?;
        rows.iter().map(definition_from_row).collect()
    }

    pub async fn update_signal_definition(&self, definition: &SignalDefinition) -> Result<()> {
        let updated = self
            .client
            .execute(
                "UPDATE signal_config
                 SET weight = $2, enabled = $3, description = $4, updated_at = CURRENT_TIMESTAMP
                 WHERE signal_type = $1",
                &[
                    &definition.signal_type.as_str(),
                    &definition.weight,
                    &definition.enabled,
                    &definition.description,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(
                BacktestError::not_found("signal", definition.signal_type.as_str()).into(),
            );
        }
        Ok(())
    }

    pub async fn get_signal_combinations(&self) -> Result<Vec<SignalCombination>> {
        let combo_rows = self
            .client
            .query(
                "SELECT id, name, description, enabled FROM signal_combo ORDER BY id",
                &[],
            )
            .await?;
        let member_rows = self
            .client
            .query(
                "SELECT combo_id, signal_type, weight, enabled, description
                 FROM combo_signal
                 ORDER BY combo_id, position",
                &[],
            )
            .await?;

        let mut members: BTreeMap<i64, Vec<SignalDefinition>> = BTreeMap::new();
        for row in &member_rows {
            let combo_id: i64 = row.get(0);
            let raw_type: String = row.get(1);
            let signal_type = SignalType::from_str(&raw_type)
                .with_context(|| format!("invalid member of combination {}", combo_id))?;
            members.entry(combo_id).or_default().push(SignalDefinition {
                signal_type,
                weight: row.get(2),
                enabled: row.get(3),
                description: row.get(4),
            });
        }

        Ok(combo_rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.get(0);
                SignalCombination {
                    id: Some(id),
                    name: row.get(1),
                    description: row.get(2),
                    enabled: row.get(3),
                    members: members.remove(&id).unwrap_or_default(),
                }
            })
            .collect())
    }

    pub async fn load_catalog(&self) -> Result<SignalCatalog> {
        let signals = self.get_signal_definitions().await?;
        let combinations = self.get_signal_combinations().await?;
        SignalCatalog::from_parts(signals, combinations)
            .context("stored signal catalog is inconsistent")
    }

    /// Writes the default catalog when `signal_config` is empty.
    pub async fn seed_default_catalog(&mut self) -> Result<bool> {
        let existing: i64 = self
            .client
            .query_one("SELECT COUNT(*) FROM signal_config", &[])
            .await?
            .get(0);
        if existing > 0 {
            return Ok(false);
        }

        let defaults = SignalCatalog::with_defaults();
        let tx = self.client.transaction().await?;
        for definition in defaults.list_signals() {
            tx.execute(
                "INSERT INTO signal_config (signal_type, weight, enabled, description)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (signal_type) DO NOTHING",
                &[
                    &definition.signal_type.as_str(),
                    &definition.weight,
                    &definition.enabled,
                    &definition.description,
                ],
            )
            .await?;
        }
        for combination in defaults.list_combinations() {
            let row = tx
                .query_one(
                    "INSERT INTO signal_combo (name, description, enabled)
                     VALUES ($1, $2, $3)
                     RETURNING id",
                    &[
                        &combination.name,
                        &combination.description,
                        &combination.enabled,
                    ],
                )
                .await?;
            let combo_id: i64 = row.get(0);
            insert_members(&tx, combo_id, &combination.members).await?;
        }
        tx.commit().await?;

        info!("Seeded default signal catalog");
        Ok(true)
    }

    /// Inserts or wholly replaces a combination. Member rows are deleted and
    /// reinserted in the same transaction.
    pub async fn upsert_signal_combination(
        &mut self,
        combination: &SignalCombination,
    ) -> Result<i64> {
        let tx = self.client.transaction().await?;
        let combo_id = match combination.id {
            Some(id) => {
                let updated = tx
                    .execute(
                        "UPDATE signal_combo
                         SET name = $2, description = $3, enabled = $4, updated_at = CURRENT_TIMESTAMP
                         WHERE id = $1",
                        &[
                            &id,
                            &combination.name,
                            &combination.description,
                            &combination.enabled,
                        ],
                    )
                    .await?;
                if updated == 0 {
                    return Err(BacktestError::not_found("combination", id.to_string()).into());
                }
                tx.execute("DELETE FROM combo_signal WHERE combo_id = $1", &[&id])
                    .await?;
                id
            }
            None => tx
                .query_one(
                    "INSERT INTO signal_combo (name, description, enabled)
                     VALUES ($1, $2, $3)
                     RETURNING id",
                    &[
                        &combination.name,
                        &combination.description,
                        &combination.enabled,
                    ],
                )
                .await?
                .get(0),
        };

        insert_members(&tx, combo_id, &combination.members).await?;
        tx.commit().await?;
        Ok(combo_id)
    }

    pub async fn insert_combo_results(&mut self, results: &[ComboResult]) -> Result<usize> {
        if results.is_empty() {
            return Ok(0);
        }

        let tx = self.client.transaction().await?;
        let stmt = tx
            .prepare(
                "INSERT INTO combo_result
                 (combo_id, combo_name, stock_code, trade_date, score, signal_count, buy_signals, sell_signals, description)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (combo_id, stock_code, trade_date) DO UPDATE SET
                    combo_name = EXCLUDED.combo_name,
                    score = EXCLUDED.score,
                    signal_count = EXCLUDED.signal_count,
                    buy_signals = EXCLUDED.buy_signals,
                    sell_signals = EXCLUDED.sell_signals,
                    description = EXCLUDED.description,
                    created_at = CURRENT_TIMESTAMP",
            )
            .await?;

        for result in results {
            let combo_id = result.combo_id.ok_or_else(|| {
                anyhow!(
                    "combination '{}' must be stored before its scores",
                    result.combo_name
                )
            })?;
            tx.execute(
                &stmt,
                &[
                    &combo_id,
                    &result.combo_name,
                    &result.stock_code,
                    &result.date,
                    &result.score,
                    &result.signal_count,
                    &result.buy_signals,
                    &result.sell_signals,
                    &result.description,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(results.len())
    }

    /// Stored scores for a stock, newest first.
    pub async fn get_combo_results(
        &self,
        stock_code: &str,
        combo_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<ComboResult>> {
        let rows = self
            .client
            .query(
                "SELECT combo_id, combo_name, stock_code, trade_date, score, signal_count, buy_signals, sell_signals, description
                 FROM combo_result
                 WHERE stock_code = $1 AND ($2::BIGINT IS NULL OR combo_id = $2)
                 ORDER BY trade_date DESC, combo_id
                 LIMIT $3",
                &[&stock_code, &combo_id, &limit],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ComboResult {
                combo_id: Some(row.get(0)),
                combo_name: row.get(1),
                stock_code: row.get(2),
                date: row.get(3),
                score: row.get(4),
                signal_count: row.get(5),
                buy_signals: row.get(6),
                sell_signals: row.get(7),
                description: row.get(8),
            })
            .collect())
    }

    pub async fn insert_backtest_result(
        &self,
        result: &BacktestResult,
        combination: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let payload =
            serde_json::to_value(result).context("failed to serialize backtest result")?;
        self.client
            .execute(
                "INSERT INTO backtest_results
                 (id, stock_code, combination, start_date, end_date, initial_capital, final_capital, total_return, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &id,
                    &result.stock_code,
                    &combination,
                    &result.start_date,
                    &result.end_date,
                    &result.initial_capital,
                    &result.final_capital,
                    &result.performance.total_return,
                    &payload,
                ],
            )
            .await?;
        Ok(id)
    }

    pub async fn get_backtest_history(
        &self,
        stock_code: &str,
        limit: i64,
    ) -> Result<Vec<BacktestHistoryEntry>> {
        let rows = self
            .client
            .query(
                "SELECT id, combination, created_at, payload
                 FROM backtest_results
                 WHERE stock_code = $1
                 ORDER BY created_at DESC
                 LIMIT $2",
                &[&stock_code, &limit],
            )
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get(0);
            let payload: serde_json::Value = row.get(3);
            let result: BacktestResult = serde_json::from_value(payload)
                .with_context(|| format!("failed to decode backtest result {}", id))?;
            entries.push(BacktestHistoryEntry {
                id,
                combination: row.get(1),
                created_at: row.get(2),
                result,
            });
        }
        Ok(entries)
    }
}

async fn insert_members(
    tx: &tokio_postgres::Transaction<'_>,
    combo_id: i64,
    members: &[SignalDefinition],
) -> Result<()> {
    for (position, member) in members.iter().enumerate() {
        tx.execute(
            "INSERT INTO combo_signal (combo_id, position, signal_type, weight, enabled, description)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &combo_id,
                &(position as i32),
                &member.signal_type.as_str(),
                &member.weight,
                &member.enabled,
                &member.description,
            ],
        )
        .await?;
    }
    Ok(())
}

fn price_bar_from_row(row: &Row) -> PriceBar {
    PriceBar {
        stock_code: row.get(0),
        date: row.get(1),
        open: row.get(2),
        high: row.get(3),
        low: row.get(4),
        close: row.get(5),
        volume: row.get(6),
    }
}

fn observation_from_row(row: &Row) -> Result<SignalObservation> {
    let raw_type: String = row.get(2);
    let signal_type = SignalType::from_str(&raw_type)
        .with_context(|| format!("invalid signal type in technical_signals: {}", raw_type))?;
    Ok(SignalObservation {
        stock_code: row.get(0),
        date: row.get(1),
        signal_type,
        signal_value: row.get(3),
        description: row.get(4),
    })
}

fn definition_from_row(row: &Row) -> Result<SignalDefinition> {
    let raw_type: String = row.get(0);
    let signal_type = SignalType::from_str(&raw_type)
        .with_context(|| format!("invalid signal type in signal_config: {}", raw_type))?;
    Ok(SignalDefinition {
        signal_type,
        weight: row.get(1),
        enabled: row.get(2),
        description: row.get(3),
    })
}

#[async_trait]
impl MarketDataStore for Database {
    async fn load_price_bars(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        retry_store_read!(
            format!("loading price bars for {}", stock_code),
            self.get_price_bars(stock_code, start, end)
        )
    }

    async fn load_signal_series(
        &self,
        stock_code: &str,
        signal_type: SignalType,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SignalObservation>> {
        retry_store_read!(
            format!("loading {} signals for {}", signal_type, stock_code),
            self.get_signal_observations(stock_code, signal_type, start, end)
        )
    }
}
