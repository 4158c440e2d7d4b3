//! Deterministic gradient-boosted decision-stump classifier.
//!
//! Multi-class softmax boosting over histogram stumps. The seed only drives row
//! and column sampling, so two fits with the same seed and data are identical.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration;
use crate::error::{ConfigError, TrainError};

const MIN_HESSIAN: f64 = 1e-6;
const MIN_CLASS_PRIOR: f64 = 1e-6;
/// Bin indices are stored as `u16`.
const MAX_BINS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub objective: String,
    pub num_class: usize,
    pub eval_metric: String,
    pub n_estimators: usize,
    pub learning_rate: f64,
    /// Row share sampled per boosting round.
    pub subsample: f64,
    /// Feature share sampled per boosting round.
    pub colsample: f64,
    pub max_bins: usize,
    pub min_child_weight: f64,
    pub l2: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            objective: "multi:softprob".to_string(),
            num_class: 3,
            eval_metric: "mlogloss".to_string(),
            n_estimators: 60,
            learning_rate: 0.1,
            subsample: 0.8,
            colsample: 0.8,
            max_bins: 32,
            min_child_weight: 1.0,
            l2: 1.0,
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.objective != "multi:softprob" {
            errors.push(ConfigError::UnsupportedObjective(self.objective.clone()));
        }
        if !matches!(self.eval_metric.as_str(), "mlogloss" | "merror") {
            errors.push(ConfigError::UnsupportedEvalMetric(self.eval_metric.clone()));
        }
        if self.num_class < 2 {
            errors.push(ConfigError::TooFewClasses(self.num_class));
        }
        if self.n_estimators == 0 {
            errors.push(ConfigError::OutOfRange {
                name: "hyperparameters.n_estimators",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            errors.push(ConfigError::OutOfRange {
                name: "hyperparameters.learning_rate",
                range: "(0, 1]",
                value: self.learning_rate,
            });
        }
        for (name, value) in [
            ("hyperparameters.subsample", self.subsample),
            ("hyperparameters.colsample", self.colsample),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                errors.push(ConfigError::OutOfRange {
                    name,
                    range: "(0, 1]",
                    value,
                });
            }
        }
        if !(2..=MAX_BINS).contains(&self.max_bins) {
            errors.push(ConfigError::OutOfRange {
                name: "hyperparameters.max_bins",
                range: "[2, 65535]",
                value: self.max_bins as f64,
            });
        }
        if self.l2 < 0.0 || self.min_child_weight < 0.0 {
            errors.push(ConfigError::OutOfRange {
                name: "hyperparameters.l2/min_child_weight",
                range: "[0, inf)",
                value: self.l2.min(self.min_child_weight),
            });
        }
        errors
    }
}

/// Rows borrowed from the feature table plus their labels.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet<'a> {
    pub features: Vec<&'a [f64]>,
    pub labels: Vec<usize>,
}

impl TrainingSet<'_> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub trait Classifier: Send + Sync {
    /// Class probabilities for one feature vector; sums to 1.
    fn predict_proba(&self, features: &[f64]) -> Vec<f64>;
}

pub trait Trainer: Send + Sync {
    fn fit(&self, data: &TrainingSet<'_>, seed: u64) -> Result<Box<dyn Classifier>, TrainError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f64,
    pub left: f64,
    pub right: f64,
}

impl Stump {
    fn constant(value: f64) -> Self {
        Self {
            feature: 0,
            threshold: f64::INFINITY,
            left: value,
            right: value,
        }
    }

    fn eval(&self, x: &[f64]) -> f64 {
        match x.get(self.feature) {
            Some(v) if *v > self.threshold => self.right,
            _ => self.left,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbdtModel {
    pub num_class: usize,
    pub base_scores: Vec<f64>,
    pub learning_rate: f64,
    /// One stump per class per round.
    pub rounds: Vec<Vec<Stump>>,
}

impl GbdtModel {
    fn raw_scores(&self, x: &[f64]) -> Vec<f64> {
        let mut scores = self.base_scores.clone();
        for round in &self.rounds {
            for (k, stump) in round.iter().enumerate() {
                scores[k] += self.learning_rate * stump.eval(x);
            }
        }
        scores
    }
}

impl Classifier for GbdtModel {
    fn predict_proba(&self, features: &[f64]) -> Vec<f64> {
        softmax(&self.raw_scores(features))
    }
}

pub fn softmax(scores: &[f64]) -> Vec<f64> {
    let mx = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - mx).exp()).collect();
    let den = exps.iter().sum::<f64>().max(1e-12);
    exps.into_iter().map(|e| e / den).collect()
}

#[derive(Debug, Clone, Default)]
pub struct GbdtTrainer {
    pub params: Hyperparameters,
}

impl GbdtTrainer {
    pub fn new(params: Hyperparameters) -> Self {
        Self { params }
    }

    pub fn fit_model(&self, data: &TrainingSet<'_>, seed: u64) -> Result<GbdtModel, TrainError> {
        let p = &self.params;
        let num_class = p.num_class;
        check_training_set(data, num_class)?;

        let n = data.len();
        let width = data.features[0].len();
        let binned = BinnedFeatures::build(&data.features, p.max_bins);
        let mut rng = StdRng::seed_from_u64(seed);

        let base_scores = class_log_priors(&data.labels, num_class);
        let mut raw: Vec<Vec<f64>> = vec![base_scores.clone(); n];
        let mut rounds = Vec::with_capacity(p.n_estimators);

        let row_take = ((n as f64 * p.subsample).round() as usize).clamp(1, n);
        let col_take = ((width as f64 * p.colsample).round() as usize).clamp(1, width.max(1));
        let sample_cols = width > 0;

        for _ in 0..p.n_estimators {
            let mut rows = index::sample(&mut rng, n, row_take).into_vec();
            rows.sort_unstable();
            let mut cols = if sample_cols {
                index::sample(&mut rng, width, col_take).into_vec()
            } else {
                Vec::new()
            };
            cols.sort_unstable();

            let probs: Vec<Vec<f64>> = rows.iter().map(|&i| softmax(&raw[i])).collect();
            let mut round = Vec::with_capacity(num_class);
            for k in 0..num_class {
                let mut grad = Vec::with_capacity(rows.len());
                let mut hess = Vec::with_capacity(rows.len());
                for (slot, &i) in rows.iter().enumerate() {
                    let pk = probs[slot][k];
                    let y = if data.labels[i] == k { 1.0 } else { 0.0 };
                    grad.push(pk - y);
                    hess.push((pk * (1.0 - pk)).max(MIN_HESSIAN));
                }
                round.push(best_stump(&binned, &rows, &cols, &grad, &hess, p));
            }

            for (i, scores) in raw.iter_mut().enumerate() {
                for (k, stump) in round.iter().enumerate() {
                    scores[k] += p.learning_rate * stump.eval(data.features[i]);
                }
            }
            rounds.push(round);
        }

        let model = GbdtModel {
            num_class,
            base_scores,
            learning_rate: p.learning_rate,
            rounds,
        };

        let fitted: Vec<Vec<f64>> = raw.iter().map(|s| softmax(s)).collect();
        let metrics = calibration::evaluate(&fitted, &data.labels);
        let metric_value = match p.eval_metric.as_str() {
            "merror" => 1.0 - metrics.accuracy,
            _ => metrics.log_loss,
        };
        debug!(seed, rows = n, metric = %p.eval_metric, value = metric_value, "stump ensemble fitted");

        Ok(model)
    }
}

impl Trainer for GbdtTrainer {
    fn fit(&self, data: &TrainingSet<'_>, seed: u64) -> Result<Box<dyn Classifier>, TrainError> {
        Ok(Box::new(self.fit_model(data, seed)?))
    }
}

fn check_training_set(data: &TrainingSet<'_>, num_class: usize) -> Result<(), TrainError> {
    if data.is_empty() {
        return Err(TrainError::EmptyTrainingSet);
    }
    let width = data.features[0].len();
    if let Some(row) = data.features.iter().find(|r| r.len() != width) {
        return Err(TrainError::FeatureWidth {
            expected: width,
            got: row.len(),
        });
    }
    if let Some(label) = data.labels.iter().find(|l| **l >= num_class) {
        return Err(TrainError::LabelOutOfRange {
            label: *label,
            num_class,
        });
    }
    let first = data.labels[0];
    if data.labels.iter().all(|l| *l == first) {
        return Err(TrainError::DegenerateLabels);
    }
    Ok(())
}

fn class_log_priors(labels: &[usize], num_class: usize) -> Vec<f64> {
    let mut counts = vec![0usize; num_class];
    for l in labels {
        counts[*l] += 1;
    }
    let n = labels.len().max(1) as f64;
    counts
        .into_iter()
        .map(|c| (c as f64 / n).max(MIN_CLASS_PRIOR).ln())
        .collect()
}

/// Per-feature cut points and the bin each row falls in. Bin `b` holds values
/// `<= cuts[b]`; the last bin holds everything above the final cut.
struct BinnedFeatures {
    cuts: Vec<Vec<f64>>,
    bins: Vec<Vec<u16>>,
}

impl BinnedFeatures {
    fn build(rows: &[&[f64]], max_bins: usize) -> Self {
        let max_bins = max_bins.min(MAX_BINS);
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut cuts = Vec::with_capacity(width);
        for j in 0..width {
            let mut values: Vec<f64> = rows.iter().map(|r| r[j]).collect();
            values.sort_by(f64::total_cmp);
            values.dedup();
            cuts.push(quantile_cuts(&values, max_bins));
        }

        let bins = rows
            .iter()
            .map(|r| {
                (0..width)
                    .map(|j| cuts[j].partition_point(|c| *c < r[j]) as u16)
                    .collect()
            })
            .collect();

        Self { cuts, bins }
    }
}

fn quantile_cuts(sorted_unique: &[f64], max_bins: usize) -> Vec<f64> {
    if sorted_unique.len() < 2 {
        return Vec::new();
    }
    let candidates = sorted_unique.len() - 1;
    let wanted = max_bins.saturating_sub(1).max(1).min(candidates);
    let mut out = Vec::with_capacity(wanted);
    for q in 1..=wanted {
        let idx = (q * candidates) / wanted - 1;
        let cut = (sorted_unique[idx] + sorted_unique[idx + 1]) / 2.0;
        if out.last().is_none_or(|last| *last < cut) {
            out.push(cut);
        }
    }
    out
}

fn best_stump(
    binned: &BinnedFeatures,
    rows: &[usize],
    cols: &[usize],
    grad: &[f64],
    hess: &[f64],
    params: &Hyperparameters,
) -> Stump {
    let lambda = params.l2;
    let g_total: f64 = grad.iter().sum();
    let h_total: f64 = hess.iter().sum();
    let parent = g_total * g_total / (h_total + lambda);

    let mut best: Option<(f64, Stump)> = None;
    for &j in cols {
        let cuts = &binned.cuts[j];
        if cuts.is_empty() {
            continue;
        }
        let mut g_hist = vec![0.0_f64; cuts.len() + 1];
        let mut h_hist = vec![0.0_f64; cuts.len() + 1];
        for (slot, &i) in rows.iter().enumerate() {
            let b = binned.bins[i][j] as usize;
            g_hist[b] += grad[slot];
            h_hist[b] += hess[slot];
        }

        let mut g_left = 0.0;
        let mut h_left = 0.0;
        for (b, cut) in cuts.iter().enumerate() {
            g_left += g_hist[b];
            h_left += h_hist[b];
            let g_right = g_total - g_left;
            let h_right = h_total - h_left;
            if h_left < params.min_child_weight || h_right < params.min_child_weight {
                continue;
            }
            let gain = g_left * g_left / (h_left + lambda) + g_right * g_right / (h_right + lambda)
                - parent;
            if gain > best.map(|(g, _)| g).unwrap_or(1e-12) {
                best = Some((
                    gain,
                    Stump {
                        feature: j,
                        threshold: *cut,
                        left: -g_left / (h_left + lambda),
                        right: -g_right / (h_right + lambda),
                    },
                ));
            }
        }
    }

    best.map(|(_, s)| s)
        .unwrap_or_else(|| Stump::constant(-g_total / (h_total + lambda)))
}
