use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calibration::{self, ConfidenceBins};
use crate::config::SplitConfig;
use crate::error::{EngineError, TrainError};
use crate::feature_table::{FeatureTable, Game};
use crate::gbdt::{Classifier, Trainer, TrainingSet};

const SEED_STRIDE: u64 = 1000;

/// One model's prediction for one game of the GameDay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamePrediction {
    pub probs: Vec<f64>,
    pub predicted: usize,
    pub confidence: f64,
    pub bin: usize,
}

impl GamePrediction {
    pub fn from_probs(probs: Vec<f64>, bins: &ConfidenceBins) -> Self {
        let predicted = calibration::argmax(&probs);
        let confidence = calibration::max_prob(&probs);
        Self {
            bin: bins.bin(confidence),
            probs,
            predicted,
            confidence,
        }
    }
}

/// A held-out prediction made by a model on a game it did not train on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub date: NaiveDate,
    pub season: i32,
    pub predicted: usize,
    pub actual: usize,
    pub confidence: f64,
}

impl HistoryRecord {
    pub fn is_correct(&self) -> bool {
        self.predicted == self.actual
    }
}

/// One trained classifier for one GameDay. `predictions` follows the order of
/// the GameDay's games.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRun {
    pub seed: u64,
    pub predictions: Vec<GamePrediction>,
    pub history: Vec<HistoryRecord>,
}

#[derive(Debug, Default)]
pub struct EnsembleOutcome {
    pub runs: Vec<ModelRun>,
    pub skipped: Vec<(u64, TrainError)>,
}

/// Seeds for the training-mode ensemble on the `date_index`-th decision date.
pub fn training_seeds(base_seed: u64, model_count: usize, date_index: usize) -> Vec<u64> {
    (0..model_count as u64)
        .map(|i| {
            base_seed
                .wrapping_add(i)
                .wrapping_add(SEED_STRIDE.wrapping_mul(date_index as u64))
        })
        .collect()
}

/// Seeds for backtest run `run`; the same seeds are reused on every date of
/// the run.
pub fn backtest_seeds(base_seed: u64, model_count: usize, run: usize) -> Vec<u64> {
    training_seeds(base_seed, model_count, run)
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded rayon pool; falls back to the global pool if it cannot be built.
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .ok();
        Self { pool }
    }

    pub fn install<T>(&self, action: impl FnOnce() -> T + Send) -> T
    where
        T: Send,
    {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(action)
        } else {
            action()
        }
    }
}

pub struct EnsembleGenerator<'t> {
    trainer: &'t dyn Trainer,
    split: SplitConfig,
    bins: ConfidenceBins,
    pool: WorkerPool,
}

impl<'t> EnsembleGenerator<'t> {
    pub fn new(trainer: &'t dyn Trainer, split: SplitConfig, num_class: usize, threads: usize) -> Self {
        Self {
            trainer,
            split,
            bins: ConfidenceBins::for_classes(num_class),
            pool: WorkerPool::new(threads),
        }
    }

    pub fn bins(&self) -> ConfidenceBins {
        self.bins
    }

    /// Trains one model per seed on games dated before `decision_date` and
    /// scores the games on `decision_date`. Failed fits are skipped; output
    /// order follows `seeds`.
    pub fn generate(
        &self,
        table: &FeatureTable,
        decision_date: NaiveDate,
        seeds: &[u64],
        cancel: &CancelToken,
    ) -> Result<EnsembleOutcome, EngineError> {
        let Some(day) = table.game_day(decision_date) else {
            return Ok(EnsembleOutcome::default());
        };
        let prior = table.games_before(decision_date);

        let results: Vec<Option<Result<ModelRun, TrainError>>> = self.pool.install(|| {
            seeds
                .par_iter()
                .map(|&seed| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(self.fit_one(prior, day.games, seed))
                })
                .collect()
        });

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(decision_date));
        }

        let mut outcome = EnsembleOutcome::default();
        for (seed, result) in seeds.iter().zip(results) {
            match result {
                Some(Ok(run)) => outcome.runs.push(run),
                Some(Err(err)) => {
                    warn!(%decision_date, seed, error = %err, "model fit skipped");
                    outcome.skipped.push((*seed, err));
                }
                None => {}
            }
        }
        debug!(
            %decision_date,
            trained = outcome.runs.len(),
            skipped = outcome.skipped.len(),
            "ensemble generated"
        );
        Ok(outcome)
    }

    fn fit_one(&self, prior: &[Game], targets: &[Game], seed: u64) -> Result<ModelRun, TrainError> {
        if prior.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let (train_idx, val_idx) = split_rows(&mut rng, prior, self.split);

        let data = TrainingSet {
            features: train_idx.iter().map(|&i| prior[i].features.as_slice()).collect(),
            labels: train_idx.iter().map(|&i| prior[i].outcome).collect(),
        };
        let model = self.trainer.fit(&data, seed)?;

        let history = val_idx
            .iter()
            .map(|&i| {
                let g = &prior[i];
                let pred = self.predict(model.as_ref(), g);
                HistoryRecord {
                    date: g.date,
                    season: g.season,
                    predicted: pred.predicted,
                    actual: g.outcome,
                    confidence: pred.confidence,
                }
            })
            .collect();

        let predictions = targets
            .iter()
            .map(|g| self.predict(model.as_ref(), g))
            .collect();

        Ok(ModelRun {
            seed,
            predictions,
            history,
        })
    }

    fn predict(&self, model: &dyn Classifier, game: &Game) -> GamePrediction {
        GamePrediction::from_probs(model.predict_proba(&game.features), &self.bins)
    }
}

/// Stratified holdout: each class contributes `validation_fraction` of its
/// rows to validation; `subsample_fraction` of the rest is kept for fitting.
fn split_rows(rng: &mut StdRng, games: &[Game], split: SplitConfig) -> (Vec<usize>, Vec<usize>) {
    let max_label = games.iter().map(|g| g.outcome).max().unwrap_or(0);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); max_label + 1];
    for (idx, g) in games.iter().enumerate() {
        by_class[g.outcome].push(idx);
    }

    let mut train = Vec::with_capacity(games.len());
    let mut validation = Vec::new();
    for mut rows in by_class {
        if rows.is_empty() {
            continue;
        }
        rows.shuffle(rng);
        let n_val = ((rows.len() as f64) * split.validation_fraction).round() as usize;
        let n_val = n_val.min(rows.len());
        validation.extend_from_slice(&rows[..n_val]);
        let rest = &rows[n_val..];
        let n_keep = ((rest.len() as f64) * split.subsample_fraction).ceil() as usize;
        train.extend_from_slice(&rest[..n_keep.min(rest.len())]);
    }
    train.sort_unstable();
    validation.sort_unstable();
    (train, validation)
}
