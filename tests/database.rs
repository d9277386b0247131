use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate};
use signal_backtest::catalog::{SignalCombination, COMPREHENSIVE_COMBINATION};
use signal_backtest::config::BacktestConfiguration;
use signal_backtest::data_context::MarketData;
use signal_backtest::database::Database;
use signal_backtest::engine::BacktestEngine;
use signal_backtest::error::BacktestError;
use signal_backtest::models::{PriceBar, SignalObservation};
use signal_backtest::scorer::ComboResult;
use signal_backtest::signals::SignalType;
use std::sync::Once;
use tokio_postgres::Client;
use uuid::Uuid;

const CODE: &str = "600000";

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn day(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, 1).unwrap() + Duration::days(offset)
}

/// Server root of `DATABASE_URL` without the database name, or `None` when
/// the variable is not set and the database tests should be skipped.
fn test_db_root_url() -> Option<String> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").ok()?;
    let url = url
        .split('?')
        .next()
        .unwrap_or(url.as_str())
        .trim_end_matches('/');
    let root = url.rsplit_once('/').map(|(root, _)| root).unwrap_or(url);
    Some(root.to_string())
}

struct TestDatabase {
    admin_url: String,
    database_url: String,
    db_name: String,
    cleaned: bool,
}

impl TestDatabase {
    /// Creates an empty throwaway database, or returns `None` without
    /// `DATABASE_URL`.
    async fn create() -> Result<Option<Self>> {
        let Some(root) = test_db_root_url() else {
            eprintln!("DATABASE_URL not set; skipping database test");
            return Ok(None);
        };
        let db_name = format!("signal_backtest_test_{}", Uuid::new_v4().simple());
        let admin_url = format!("{}/postgres", root);
        let database_url = format!("{}/{}", root, db_name);

        let admin_client = connect(&admin_url).await?;
        drop_database_with_client(&admin_client, &db_name).await?;
        admin_client
            .batch_execute(&format!("CREATE DATABASE {} TEMPLATE template0", db_name))
            .await?;

        Ok(Some(Self {
            admin_url,
            database_url,
            db_name,
            cleaned: false,
        }))
    }

    /// Connects and applies the schema.
    async fn open(&self) -> Result<Database> {
        let db = Database::new(&self.database_url).await?;
        db.apply_schema().await?;
        Ok(db)
    }

    async fn raw_client(&self) -> Result<Client> {
        connect(&self.database_url).await
    }

    async fn cleanup(mut self) -> Result<()> {
        let client = connect(&self.admin_url).await?;
        drop_database_with_client(&client, &self.db_name).await?;
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let admin_url = self.admin_url.clone();
            let db_name = self.db_name.clone();
            handle.spawn(async move {
                if let Ok(client) = connect(&admin_url).await {
                    let _ = drop_database_with_client(&client, &db_name).await;
                }
            });
        }
    }
}

async fn connect(url: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres error: {}", err);
        }
    });
    Ok(client)
}

async fn drop_database_with_client(client: &Client, db_name: &str) -> Result<()> {
    client
        .execute(
            "SELECT pg_terminate_backend(pid)
             FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
            &[&db_name],
        )
        .await
        .ok();
    client
        .batch_execute(&format!("DROP DATABASE IF EXISTS {}", db_name))
        .await?;
    Ok(())
}

async fn member_row_count(client: &Client, combo_id: i64) -> Result<i64> {
    Ok(client
        .query_one(
            "SELECT COUNT(*) FROM combo_signal WHERE combo_id = $1",
            &[&combo_id],
        )
        .await?
        .get(0))
}

fn combo_result(combo: &SignalCombination, offset: i64, score: f64) -> ComboResult {
    ComboResult {
        combo_id: combo.id,
        combo_name: combo.name.clone(),
        stock_code: CODE.to_string(),
        date: day(offset),
        score,
        signal_count: 2,
        buy_signals: 1,
        sell_signals: 0,
        description: format!("day {}", offset),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn schema_bootstrap_seeds_catalog_once() -> Result<()> {
    ensure_test_env();
    let Some(test_db) = TestDatabase::create().await? else {
        return Ok(());
    };
    let mut db = test_db.open().await?;
    db.apply_schema().await?;

    assert!(db.seed_default_catalog().await?);
    assert!(!db.seed_default_catalog().await?);

    let catalog = db.load_catalog().await?;
    assert_eq!(catalog.list_signals().len(), SignalType::ALL.len());
    assert_eq!(catalog.list_combinations().len(), 3);
    let comprehensive = catalog
        .combination_by_name(COMPREHENSIVE_COMBINATION)
        .ok_or_else(|| anyhow!("comprehensive combination missing"))?;
    assert_eq!(comprehensive.member_types().len(), 7);

    let mut trix = catalog
        .signal(SignalType::Trix)
        .ok_or_else(|| anyhow!("TRIX definition missing"))?;
    assert!(!trix.enabled);
    trix.enabled = true;
    trix.weight = 0.4;
    db.update_signal_definition(&trix).await?;
    assert_eq!(db.load_catalog().await?.signal(SignalType::Trix), Some(trix));

    test_db.cleanup().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn combination_replace_leaves_no_stale_members() -> Result<()> {
    ensure_test_env();
    let Some(test_db) = TestDatabase::create().await? else {
        return Ok(());
    };
    let mut db = test_db.open().await?;
    db.seed_default_catalog().await?;
    let client = test_db.raw_client().await?;

    let momentum = SignalCombination::new("momentum", "MTM and ROC")
        .with_member(SignalType::Mtm, 1.0)
        .with_member(SignalType::Roc, 0.5);
    let id = db.upsert_signal_combination(&momentum).await?;
    assert_eq!(member_row_count(&client, id).await?, 2);

    let mut replacement =
        SignalCombination::new("momentum", "MTM only").with_member(SignalType::Mtm, 2.0);
    replacement.id = Some(id);
    assert_eq!(db.upsert_signal_combination(&replacement).await?, id);
    assert_eq!(member_row_count(&client, id).await?, 1);

    let stored = db
        .load_catalog()
        .await?
        .combination(id)
        .ok_or_else(|| anyhow!("combination {} missing", id))?;
    assert_eq!(stored.description, "MTM only");
    assert_eq!(stored.member_types(), vec![SignalType::Mtm]);
    assert_eq!(stored.members[0].weight, 2.0);

    let mut ghost = replacement.clone();
    ghost.id = Some(id + 1_000);
    let err = db.upsert_signal_combination(&ghost).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BacktestError>(),
        Some(BacktestError::NotFound { .. })
    ));
    assert_eq!(member_row_count(&client, id).await?, 1);

    test_db.cleanup().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn combo_results_upsert_and_read_newest_first() -> Result<()> {
    ensure_test_env();
    let Some(test_db) = TestDatabase::create().await? else {
        return Ok(());
    };
    let mut db = test_db.open().await?;
    db.seed_default_catalog().await?;
    let combo = db
        .load_catalog()
        .await?
        .combination_by_name(COMPREHENSIVE_COMBINATION)
        .ok_or_else(|| anyhow!("comprehensive combination missing"))?;

    let results: Vec<ComboResult> = (0..3)
        .map(|offset| combo_result(&combo, offset, 0.1 * offset as f64))
        .collect();
    assert_eq!(db.insert_combo_results(&results).await?, 3);
    assert_eq!(
        db.insert_combo_results(&[combo_result(&combo, 1, 0.75)]).await?,
        1
    );

    let stored = db.get_combo_results(CODE, combo.id, 10).await?;
    let dates: Vec<NaiveDate> = stored.iter().map(|r| r.date).collect();
    assert_eq!(dates, vec![day(2), day(1), day(0)]);
    assert_eq!(stored[1].score, 0.75);
    assert_eq!(stored[1].combo_id, combo.id);

    assert_eq!(db.get_combo_results(CODE, combo.id, 2).await?.len(), 2);
    assert!(db.get_combo_results(CODE, Some(-1), 10).await?.is_empty());

    let unsaved = SignalCombination::new("unsaved", "");
    assert!(db
        .insert_combo_results(&[combo_result(&unsaved, 0, 0.0)])
        .await
        .is_err());

    test_db.cleanup().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backtest_history_round_trips_results() -> Result<()> {
    ensure_test_env();
    let Some(test_db) = TestDatabase::create().await? else {
        return Ok(());
    };
    let db = test_db.open().await?;

    let bars: Vec<PriceBar> = (0..12)
        .map(|i| {
            let close = 10.0 + 0.25 * i as f64;
            PriceBar {
                stock_code: CODE.to_string(),
                date: day(i),
                open: close,
                high: close,
                low: close,
                close,
                volume: 5_000,
            }
        })
        .collect();
    let observations = vec![SignalObservation {
        stock_code: CODE.to_string(),
        date: day(1),
        signal_type: SignalType::Rsi,
        signal_value: 0.9,
        description: None,
    }];
    let data = MarketData::from_parts(bars, observations);
    let config = BacktestConfiguration::new(CODE, day(0), day(11), vec![SignalType::Rsi]);
    let result = BacktestEngine::new().run(&data, &config).await?;

    let first = db
        .insert_backtest_result(&result, Some(COMPREHENSIVE_COMBINATION))
        .await?;
    let second = db.insert_backtest_result(&result, None).await?;
    assert_ne!(first, second);

    let history = db.get_backtest_history(CODE, 10).await?;
    assert_eq!(history.len(), 2);
    assert!(history[0].created_at >= history[1].created_at);
    let entry = history
        .iter()
        .find(|entry| entry.id == first)
        .ok_or_else(|| anyhow!("stored backtest {} missing", first))?;
    assert_eq!(entry.combination.as_deref(), Some(COMPREHENSIVE_COMBINATION));

    let restored = &entry.result;
    assert_eq!(restored.stock_code, result.stock_code);
    assert_eq!(restored.period, result.period);
    let trade_ids = |r: &signal_backtest::models::BacktestResult| {
        r.trades.iter().map(|t| t.trade_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(trade_ids(restored), trade_ids(&result));
    assert_eq!(restored.daily_snapshots.len(), result.daily_snapshots.len());
    assert_eq!(
        restored.signal_results.keys().collect::<Vec<_>>(),
        result.signal_results.keys().collect::<Vec<_>>()
    );
    assert!((restored.final_capital - result.final_capital).abs() < 1e-6);
    assert!(
        (restored.performance.total_return - result.performance.total_return).abs() < 1e-9
    );

    assert!(db.get_backtest_history("999999", 10).await?.is_empty());

    test_db.cleanup().await
}
