use chrono::NaiveDate;
use thiserror::Error;

/// Rules violated by an `EngineConfig`. Every violation is collected so the
/// caller sees the full list before any training starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("model_count must be positive")]
    NonPositiveModelCount,
    #[error("top_k must be positive")]
    NonPositiveTopK,
    #[error("top_k ({top_k}) exceeds model_count ({model_count})")]
    TopKExceedsModelCount { top_k: usize, model_count: usize },
    #[error("expected {expected} rank weights, got {got}")]
    WeightCountMismatch { expected: usize, got: usize },
    #[error("rank weights must sum to 1 (sum = {sum:.6})")]
    WeightsDoNotSumToOne { sum: f64 },
    #[error("rank weight {index} is negative ({value})")]
    NegativeWeight { index: usize, value: f64 },
    #[error("{name} must lie in {range} (got {value})")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },
    #[error("unsupported objective {0:?} (expected \"multi:softprob\")")]
    UnsupportedObjective(String),
    #[error("unsupported eval_metric {0:?} (expected \"mlogloss\" or \"merror\")")]
    UnsupportedEvalMetric(String),
    #[error("num_class must be at least 2 (got {0})")]
    TooFewClasses(usize),
    #[error("config is invalid: {}", join_errors(.0))]
    Multiple(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures while turning raw rows into a `FeatureTable`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("feature table is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("feature table has no usable rows")]
    Empty,
    #[error("need at least {needed} seasons, but only found {found}")]
    NotEnoughSeasons { needed: usize, found: usize },
    #[error("row {row}: {message}")]
    Row { row: usize, message: String },
}

/// A single model fit that could not complete. These are recovered locally by
/// the ensemble generator (the model is skipped).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("training labels contain fewer than two classes")]
    DegenerateLabels,
    #[error("label {label} is outside 0..{num_class}")]
    LabelOutOfRange { label: usize, num_class: usize },
    #[error("feature width mismatch: expected {expected}, got {got}")]
    FeatureWidth { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("run cancelled before {0}")]
    Cancelled(NaiveDate),
}
