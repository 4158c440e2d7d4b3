use serde::Serialize;
use tracing::{info, warn};

use crate::calibration::{self, SCORE_BIN_COUNT};
use crate::config::EngineConfig;
use crate::consensus::ConsensusSelector;
use crate::ensemble::{self, CancelToken, EnsembleGenerator};
use crate::error::EngineError;
use crate::feature_table::FeatureTable;
use crate::gbdt::Trainer;
use crate::reports::{self, AccuracyRow, Observation};

/// Tables averaged over every seed run. `model_*` tables cover every
/// individual model prediction on the decision dates; `pick_*` tables cover
/// consensus picks only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub seed_runs: usize,
    pub decision_dates: usize,
    pub model_accuracy: Option<f64>,
    pub pick_accuracy: Option<f64>,
    pub picks_per_run: Vec<usize>,
    pub model_by_season: Vec<AccuracyRow>,
    pub model_by_confidence: Vec<AccuracyRow>,
    pub model_by_confidence_season: Vec<AccuracyRow>,
    pub pick_by_season: Vec<AccuracyRow>,
    pub pick_by_confidence: Vec<AccuracyRow>,
    pub pick_by_confidence_season: Vec<AccuracyRow>,
    pub pick_by_score: Vec<AccuracyRow>,
}

struct RunTables {
    model_accuracy: Option<f64>,
    pick_accuracy: Option<f64>,
    picks: usize,
    model_by_season: Vec<AccuracyRow>,
    model_by_confidence: Vec<AccuracyRow>,
    model_by_confidence_season: Vec<AccuracyRow>,
    pick_by_season: Vec<AccuracyRow>,
    pick_by_confidence: Vec<AccuracyRow>,
    pick_by_confidence_season: Vec<AccuracyRow>,
    pick_by_score: Vec<AccuracyRow>,
}

/// Walk-forward evaluation: every decision date only sees earlier games, and
/// the whole walk is repeated once per seed run.
pub fn run_backtest(
    table: &FeatureTable,
    config: &EngineConfig,
    trainer: &dyn Trainer,
    cancel: &CancelToken,
) -> Result<BacktestReport, EngineError> {
    config.validate()?;
    let dates = table.decision_dates(config.min_training_seasons)?;
    let generator = EnsembleGenerator::new(
        trainer,
        config.backtest.split,
        config.hyperparameters.num_class,
        config.worker_threads(),
    );
    let bins = generator.bins();
    let selector = ConsensusSelector::new(&config.ensemble, bins);

    let mut runs: Vec<RunTables> = Vec::with_capacity(config.backtest.seed_runs);
    for run in 0..config.backtest.seed_runs {
        info!(run = run + 1, total = config.backtest.seed_runs, "backtest seed run");
        let seeds = ensemble::backtest_seeds(config.ensemble.base_seed, config.ensemble.model_count, run);

        let mut model_obs: Vec<Observation> = Vec::new();
        let mut picks = Vec::new();
        for &date in &dates {
            let Some(day) = table.game_day(date) else {
                continue;
            };
            let outcome = generator.generate(table, date, &seeds, cancel)?;
            for model in &outcome.runs {
                for (pred, game) in model.predictions.iter().zip(day.games) {
                    model_obs.push(Observation {
                        correct: pred.predicted == game.outcome,
                        score: pred.confidence,
                        season: day.season,
                        bin: pred.bin,
                    });
                }
            }
            picks.extend(selector.select(&outcome.runs, day).picks);
        }

        if model_obs.is_empty() {
            warn!(run = run + 1, "no predictions in seed run; skipping");
            continue;
        }

        let pick_obs: Vec<Observation> = picks.iter().map(Observation::by_confidence).collect();
        let tables = RunTables {
            model_accuracy: accuracy(&model_obs),
            pick_accuracy: accuracy(&pick_obs),
            picks: picks.len(),
            model_by_season: reports::by_season(&model_obs),
            model_by_confidence: reports::by_bin(&model_obs, bins.count(), |b| bins.label(b)),
            model_by_confidence_season: reports::by_bin_and_season(&model_obs, bins.count(), |b| bins.label(b)),
            pick_by_season: reports::by_season(&pick_obs),
            pick_by_confidence: reports::by_bin(&pick_obs, bins.count(), |b| bins.label(b)),
            pick_by_confidence_season: reports::by_bin_and_season(&pick_obs, bins.count(), |b| bins.label(b)),
            pick_by_score: reports::by_bin(
                &picks.iter().map(Observation::by_score).collect::<Vec<_>>(),
                SCORE_BIN_COUNT,
                calibration::score_bin_label,
            ),
        };
        info!(
            run = run + 1,
            model_accuracy = tables.model_accuracy.unwrap_or_default(),
            picks = tables.picks,
            "seed run complete"
        );
        runs.push(tables);
    }

    if runs.is_empty() {
        warn!("no backtest run produced predictions");
    }

    Ok(BacktestReport {
        seed_runs: runs.len(),
        decision_dates: dates.len(),
        model_accuracy: mean(runs.iter().filter_map(|r| r.model_accuracy)),
        pick_accuracy: mean(runs.iter().filter_map(|r| r.pick_accuracy)),
        picks_per_run: runs.iter().map(|r| r.picks).collect(),
        model_by_season: average(&runs, |r| &r.model_by_season),
        model_by_confidence: average(&runs, |r| &r.model_by_confidence),
        model_by_confidence_season: average(&runs, |r| &r.model_by_confidence_season),
        pick_by_season: average(&runs, |r| &r.pick_by_season),
        pick_by_confidence: average(&runs, |r| &r.pick_by_confidence),
        pick_by_confidence_season: average(&runs, |r| &r.pick_by_confidence_season),
        pick_by_score: average(&runs, |r| &r.pick_by_score),
    })
}

fn accuracy(obs: &[Observation]) -> Option<f64> {
    if obs.is_empty() {
        return None;
    }
    Some(obs.iter().filter(|o| o.correct).count() as f64 / obs.len() as f64)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn average(runs: &[RunTables], table: impl Fn(&RunTables) -> &Vec<AccuracyRow>) -> Vec<AccuracyRow> {
    let tables: Vec<Vec<AccuracyRow>> = runs.iter().map(|r| table(r).clone()).collect();
    reports::average_tables(&tables)
}
