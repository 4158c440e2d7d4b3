use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use tracing::info;

use ou_consensus::analysis;
use ou_consensus::backtest;
use ou_consensus::calibration::ConfidenceBins;
use ou_consensus::config::EngineConfig;
use ou_consensus::ensemble::CancelToken;
use ou_consensus::export;
use ou_consensus::feature_table::FeatureTable;
use ou_consensus::gbdt::GbdtTrainer;
use ou_consensus::training;

#[derive(Parser, Debug)]
#[command(name = "ou_consensus", version, about = "Over/under ensemble consensus engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file; every field is optional.
    #[arg(long, global = true, env = "OU_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for reports and workbooks.
    #[arg(long, global = true, env = "OU_OUT_DIR", default_value = "out")]
    out: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk every decision date, collect consensus picks and simulate the bankroll.
    Train(InputArgs),
    /// Repeat the walk-forward run over several seed sets and average the tables.
    Backtest(InputArgs),
    /// Break down the picks written by `train`.
    Analyze {
        /// Picks file; defaults to `<out>/train/picks.json`.
        #[arg(long)]
        picks: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Feature table as a JSON array of row objects.
    #[arg(long, env = "OU_FEATURES_JSON", conflicts_with = "db")]
    json: Option<PathBuf>,

    /// SQLite database holding the feature table.
    #[arg(long, env = "OU_DB")]
    db: Option<PathBuf>,

    #[arg(long, env = "OU_TABLE", default_value = "features")]
    table: String,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    let cancel = CancelToken::new();

    match cli.command {
        Command::Train(input) => {
            let table = load_table(&input, &config)?;
            let trainer = GbdtTrainer::new(config.hyperparameters.clone());
            let report = training::run_training(&table, &config, &trainer, &cancel)?;
            let dir = cli.out.join("train");
            let summary = export::export_training(&dir, &report)?;
            info!(
                picks = report.picks.len(),
                files = summary.files.len(),
                dir = %dir.display(),
                "training complete"
            );
        }
        Command::Backtest(input) => {
            let table = load_table(&input, &config)?;
            let trainer = GbdtTrainer::new(config.hyperparameters.clone());
            let report = backtest::run_backtest(&table, &config, &trainer, &cancel)?;
            let dir = cli.out.join("backtest");
            let summary = export::export_backtest(&dir, &report)?;
            info!(
                runs = report.seed_runs,
                model_accuracy = report.model_accuracy.unwrap_or_default(),
                files = summary.files.len(),
                dir = %dir.display(),
                "backtest complete"
            );
        }
        Command::Analyze { picks } => {
            let path = picks.unwrap_or_else(|| cli.out.join("train").join(export::PICKS_FILE));
            let picks = export::read_picks(&path)?;
            info!(picks = picks.len(), "loaded scored picks");
            let bins = ConfidenceBins::for_classes(config.hyperparameters.num_class);
            let report = analysis::analyze(&picks, &bins);
            let dir = cli.out.join("analysis");
            export::export_analysis(&dir, &report)?;
            info!(dir = %dir.display(), "analysis complete");
        }
    }
    Ok(())
}

fn load_table(input: &InputArgs, config: &EngineConfig) -> Result<FeatureTable> {
    if let Some(path) = &input.json {
        return FeatureTable::load_json(&config.schema, path);
    }
    if let Some(path) = &input.db {
        let conn = Connection::open(path).with_context(|| format!("open sqlite {}", path.display()))?;
        return FeatureTable::load_sqlite(&conn, &input.table, &config.schema);
    }
    bail!("no feature table given: pass --json <file> or --db <sqlite>")
}
