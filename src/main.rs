use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::{info, warn};
use signal_backtest::{
    commands::{backtest, catalog, export_market_data, history, score},
    context::AppContext,
    signals::SignalType,
};
use std::env;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "signal_backtest")]
#[command(about = "Technical signal scoring and single-stock backtesting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one or more stocks against a signal combination
    Backtest {
        /// Stock codes to backtest (all stocks with data when omitted)
        #[arg(value_delimiter = ',', num_args = 0..)]
        stock_codes: Vec<String>,
        /// First day of the window (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last day of the window (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,
        /// Combination whose enabled members drive the run (defaults to comprehensive)
        #[arg(long)]
        combination: Option<String>,
        /// Explicit signal types, overriding the combination
        #[arg(long, value_delimiter = ',')]
        signals: Vec<SignalType>,
        /// Path to a market data snapshot file instead of the database
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Store each result in the backtest history
        #[arg(long)]
        persist: bool,
        /// Maximum concurrent input loads
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Compute daily combination scores
    Score {
        /// Stock codes to score (all stocks with data when omitted)
        #[arg(value_delimiter = ',', num_args = 0..)]
        stock_codes: Vec<String>,
        /// Score only this combination (all enabled combinations when omitted)
        #[arg(long)]
        combination: Option<String>,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Path to a market data snapshot file instead of the database
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Store the scores in combo_result
        #[arg(long)]
        persist: bool,
    },
    /// List signal definitions
    Signals,
    /// List signal combinations and their members
    Combinations,
    /// Change the weight, state or description of a signal definition
    UpdateSignal {
        signal_type: SignalType,
        #[arg(long)]
        weight: Option<f64>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Create a combination, or replace one when --id is given
    UpsertCombination {
        name: String,
        /// Members as TYPE=weight, e.g. RSI=1.5,WR=1.2
        #[arg(long = "member", value_delimiter = ',', required = true)]
        members: Vec<catalog::MemberWeight>,
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        disabled: bool,
    },
    /// Show stored backtests and combo scores for a stock
    History {
        stock_code: String,
        /// Only scores of this combination id
        #[arg(long)]
        combo_id: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Export a market data snapshot for offline runs
    ExportMarketData {
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        /// Stock codes to include (all when omitted)
        #[arg(value_delimiter = ',', num_args = 0..)]
        stock_codes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline runs, use a market data snapshot."
        ));
    }
    let app_context = AppContext::initialize(database_url).await?;

    if app_context.has_database() {
        if let Err(err) = prepare_database(&app_context).await {
            warn!("Database preparation skipped: {err}");
        }
    }

    match command {
        Commands::Backtest {
            stock_codes,
            start,
            end,
            combination,
            signals,
            data_file,
            persist,
            concurrency,
        } => {
            let request = backtest::BacktestRequest {
                stock_codes,
                start_date: start,
                end_date: end,
                combination,
                signals,
                data_file,
                persist,
                concurrency,
            };
            backtest::run(&app_context, request).await?;
        }
        Commands::Score {
            stock_codes,
            combination,
            start,
            end,
            data_file,
            persist,
        } => {
            let request = score::ScoreRequest {
                stock_codes,
                combination,
                start_date: start,
                end_date: end,
                data_file,
                persist,
            };
            score::run(&app_context, request).await?;
        }
        Commands::Signals => {
            catalog::list_signals(&app_context).await?;
        }
        Commands::Combinations => {
            catalog::list_combinations(&app_context).await?;
        }
        Commands::UpdateSignal {
            signal_type,
            weight,
            enabled,
            description,
        } => {
            catalog::update_signal(&app_context, signal_type, weight, enabled, description)
                .await?;
        }
        Commands::UpsertCombination {
            name,
            members,
            id,
            description,
            disabled,
        } => {
            let request = catalog::UpsertCombinationRequest {
                id,
                name,
                description,
                members,
                disabled,
            };
            catalog::upsert_combination(&app_context, request).await?;
        }
        Commands::History {
            stock_code,
            combo_id,
            limit,
        } => {
            history::run(&app_context, &stock_code, combo_id, limit).await?;
        }
        Commands::ExportMarketData {
            output,
            stock_codes,
        } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            export_market_data::run(&app_context, &output_path, &stock_codes).await?;
        }
    }

    Ok(())
}

/// Creates missing tables and seeds the default catalog on first use.
async fn prepare_database(app_context: &AppContext) -> Result<()> {
    let mut db = app_context.database().await?;
    db.apply_schema().await?;
    if db.seed_default_catalog().await? {
        info!("Seeded default signal catalog");
    }
    Ok(())
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::Backtest {
            data_file,
            persist,
            ..
        } => data_file.is_none() || *persist,
        Commands::Score {
            data_file,
            persist,
            ..
        } => data_file.is_none() || *persist,
        Commands::Signals
        | Commands::Combinations
        | Commands::UpdateSignal { .. }
        | Commands::UpsertCombination { .. }
        | Commands::History { .. }
        | Commands::ExportMarketData { .. } => true,
    }
}
