use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::feature_table::TableSchema;
use crate::gbdt::Hyperparameters;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub schema: TableSchema,
    pub ensemble: EnsembleConfig,
    pub hyperparameters: Hyperparameters,
    pub train_split: SplitConfig,
    pub backtest: BacktestConfig,
    pub simulation: SimulationConfig,
    /// Seasons that must precede the first decision date.
    pub min_training_seasons: usize,
    /// Worker threads for model fitting. `None` means available parallelism.
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub model_count: usize,
    pub top_k: usize,
    /// Overall validation accuracy a model must exceed to be ranked at all.
    pub min_accuracy: f64,
    /// Weight per rank (rank 1 first). Length must equal `top_k`.
    pub rank_weights: Vec<f64>,
    /// Accuracy assumed for a bucket with no observations.
    pub accuracy_prior: f64,
    pub base_seed: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Share of the pre-decision rows each model holds out to build its
    /// accuracy history.
    pub validation_fraction: f64,
    /// Share of the remaining rows actually used for fitting.
    pub subsample_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub seed_runs: usize,
    pub split: SplitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub starting_capital: f64,
    /// Fraction of full Kelly actually staked.
    pub kelly_multiplier: f64,
    /// Net profit per unit staked on a win (-110 pricing by default).
    pub payout_ratio: f64,
    /// Units lost per losing pick in the flat-unit ledger.
    pub vig_units: f64,
    /// Algorithm-score bins must beat this in-sample accuracy to be simulated.
    pub min_bin_accuracy: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: TableSchema::default(),
            ensemble: EnsembleConfig::default(),
            hyperparameters: Hyperparameters::default(),
            train_split: SplitConfig::default(),
            backtest: BacktestConfig::default(),
            simulation: SimulationConfig::default(),
            min_training_seasons: 2,
            threads: None,
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            model_count: 50,
            top_k: 3,
            min_accuracy: 0.50,
            rank_weights: vec![0.40, 0.35, 0.25],
            accuracy_prior: 0.50,
            base_seed: 42,
        }
    }
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            subsample_fraction: 1.0,
        }
    }
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            seed_runs: 50,
            split: SplitConfig {
                validation_fraction: 0.2,
                subsample_fraction: 0.2,
            },
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            starting_capital: 100.0,
            kelly_multiplier: 0.01,
            payout_ratio: 1.0 / 1.1,
            vig_units: 1.1,
            min_bin_accuracy: 0.525,
        }
    }
}

impl EngineConfig {
    /// Reads `path` (JSON) when given, applies environment overrides and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                serde_json::from_str::<EngineConfig>(&raw)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => EngineConfig::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(n) = env_usize("OU_MODEL_COUNT") {
            self.ensemble.model_count = n;
        }
        if let Some(n) = env_usize("OU_SEED_RUNS") {
            self.backtest.seed_runs = n;
        }
        if let Some(n) = env_usize("OU_THREADS") {
            self.threads = Some(n);
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            })
            .clamp(1, 32)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let e = &self.ensemble;

        if e.model_count == 0 {
            errors.push(ConfigError::NonPositiveModelCount);
        }
        if e.top_k == 0 {
            errors.push(ConfigError::NonPositiveTopK);
        }
        if e.top_k > e.model_count {
            errors.push(ConfigError::TopKExceedsModelCount {
                top_k: e.top_k,
                model_count: e.model_count,
            });
        }
        if e.rank_weights.len() != e.top_k {
            errors.push(ConfigError::WeightCountMismatch {
                expected: e.top_k,
                got: e.rank_weights.len(),
            });
        }
        for (index, w) in e.rank_weights.iter().enumerate() {
            if *w < 0.0 {
                errors.push(ConfigError::NegativeWeight { index, value: *w });
            }
        }
        let sum: f64 = e.rank_weights.iter().sum();
        if !e.rank_weights.is_empty() && (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            errors.push(ConfigError::WeightsDoNotSumToOne { sum });
        }
        check_unit(&mut errors, "min_accuracy", e.min_accuracy);
        check_unit(&mut errors, "accuracy_prior", e.accuracy_prior);

        check_split(&mut errors, &self.train_split);
        check_split(&mut errors, &self.backtest.split);
        if self.backtest.seed_runs == 0 {
            errors.push(ConfigError::OutOfRange {
                name: "backtest.seed_runs",
                range: "[1, inf)",
                value: 0.0,
            });
        }

        let s = &self.simulation;
        if !(s.starting_capital > 0.0) {
            errors.push(ConfigError::OutOfRange {
                name: "simulation.starting_capital",
                range: "(0, inf)",
                value: s.starting_capital,
            });
        }
        check_unit(&mut errors, "simulation.kelly_multiplier", s.kelly_multiplier);
        if !(s.payout_ratio > 0.0) {
            errors.push(ConfigError::OutOfRange {
                name: "simulation.payout_ratio",
                range: "(0, inf)",
                value: s.payout_ratio,
            });
        }
        check_unit(&mut errors, "simulation.min_bin_accuracy", s.min_bin_accuracy);

        errors.extend(self.hyperparameters.validate());

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }
}

fn check_split(errors: &mut Vec<ConfigError>, split: &SplitConfig) {
    if !(0.0..1.0).contains(&split.validation_fraction) {
        errors.push(ConfigError::OutOfRange {
            name: "validation_fraction",
            range: "[0, 1)",
            value: split.validation_fraction,
        });
    }
    if !(split.subsample_fraction > 0.0 && split.subsample_fraction <= 1.0) {
        errors.push(ConfigError::OutOfRange {
            name: "subsample_fraction",
            range: "(0, 1]",
            value: split.subsample_fraction,
        });
    }
}

fn check_unit(errors: &mut Vec<ConfigError>, name: &'static str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(ConfigError::OutOfRange {
            name,
            range: "[0, 1]",
            value,
        });
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut config = EngineConfig::default();
        config.ensemble.rank_weights = vec![0.5, 0.3, 0.3];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::WeightsDoNotSumToOne { .. }));
    }

    #[test]
    fn top_k_above_model_count_is_rejected() {
        let mut config = EngineConfig::default();
        config.ensemble.model_count = 2;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::TopKExceedsModelCount {
                top_k: 3,
                model_count: 2
            }
        );
    }

    #[test]
    fn zero_model_count_reports_every_violation() {
        let mut config = EngineConfig::default();
        config.ensemble.model_count = 0;
        let ConfigError::Multiple(errors) = config.validate().unwrap_err() else {
            panic!("expected several violations");
        };
        assert!(errors.contains(&ConfigError::NonPositiveModelCount));
        assert!(errors.iter().any(|e| matches!(e, ConfigError::TopKExceedsModelCount { .. })));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"ensemble": {"model_count": 7}}"#).unwrap();
        assert_eq!(config.ensemble.model_count, 7);
        assert_eq!(config.ensemble.top_k, 3);
        assert_eq!(config.backtest.seed_runs, 50);
    }
}
