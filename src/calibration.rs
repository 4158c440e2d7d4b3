use serde::{Deserialize, Serialize};

/// Confidence bins per model prediction. Fixed across every mode.
pub const CONFIDENCE_BIN_COUNT: usize = 10;
/// Algorithm-score bins, 5 points wide over [0, 1].
pub const SCORE_BIN_COUNT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Under,
    Over,
    Push,
}

impl Outcome {
    pub fn from_label(label: usize) -> Option<Self> {
        match label {
            0 => Some(Outcome::Under),
            1 => Some(Outcome::Over),
            2 => Some(Outcome::Push),
            _ => None,
        }
    }

    pub fn label(self) -> usize {
        match self {
            Outcome::Under => 0,
            Outcome::Over => 1,
            Outcome::Push => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Outcome::Under => "Under",
            Outcome::Over => "Over",
            Outcome::Push => "Push",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    pub samples: usize,
    pub log_loss: f64,
    pub accuracy: f64,
}

/// Correct/total counter for one accuracy bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub correct: usize,
    pub total: usize,
}

impl Tally {
    pub fn record(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn accuracy(&self, prior: f64) -> f64 {
        smoothed_accuracy(self.correct, self.total, prior)
    }
}

/// Accuracy of a bucket, or `prior` when the bucket has no observations.
pub fn smoothed_accuracy(correct: usize, total: usize, prior: f64) -> f64 {
    if total == 0 {
        return prior;
    }
    correct as f64 / total as f64
}

/// Fixed-width confidence buckets spanning `[1/num_class, 1]`, the range a
/// max-class probability can take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceBins {
    lower: f64,
    width: f64,
}

impl ConfidenceBins {
    pub fn for_classes(num_class: usize) -> Self {
        let lower = 1.0 / num_class.max(2) as f64;
        Self {
            lower,
            width: (1.0 - lower) / CONFIDENCE_BIN_COUNT as f64,
        }
    }

    pub fn count(&self) -> usize {
        CONFIDENCE_BIN_COUNT
    }

    pub fn bin(&self, confidence: f64) -> usize {
        right_closed_bin(confidence, self.lower, self.width, CONFIDENCE_BIN_COUNT)
    }

    pub fn bounds(&self, bin: usize) -> (f64, f64) {
        let start = self.lower + self.width * bin as f64;
        (start, start + self.width)
    }

    pub fn label(&self, bin: usize) -> String {
        let (start, end) = self.bounds(bin);
        percent_label(start, end)
    }
}

pub fn score_bin(score: f64) -> usize {
    right_closed_bin(score, 0.0, 1.0 / SCORE_BIN_COUNT as f64, SCORE_BIN_COUNT)
}

pub fn score_bin_label(bin: usize) -> String {
    let width = 1.0 / SCORE_BIN_COUNT as f64;
    percent_label(width * bin as f64, width * (bin + 1) as f64)
}

// Intervals are (start, end] except the first, which also takes its lower edge.
fn right_closed_bin(value: f64, lower: f64, width: f64, count: usize) -> usize {
    if !value.is_finite() || value <= lower {
        return 0;
    }
    let pos = ((value - lower) / width - 1e-9).ceil() as isize - 1;
    pos.clamp(0, count as isize - 1) as usize
}

fn percent_label(start: f64, end: f64) -> String {
    format!("{:.0}-{:.0}%", start * 100.0, end * 100.0)
}

/// Index of the largest probability; ties go to the lower class index.
pub fn argmax(probs: &[f64]) -> usize {
    let mut best = 0usize;
    for (idx, p) in probs.iter().enumerate() {
        if *p > probs[best] {
            best = idx;
        }
    }
    best
}

pub fn max_prob(probs: &[f64]) -> f64 {
    probs.get(argmax(probs)).copied().unwrap_or(0.0)
}

pub fn evaluate(predictions: &[Vec<f64>], labels: &[usize]) -> Metrics {
    if predictions.is_empty() || predictions.len() != labels.len() {
        return Metrics {
            samples: 0,
            log_loss: 0.0,
            accuracy: 0.0,
        };
    }

    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;
    for (p, label) in predictions.iter().zip(labels) {
        let actual_prob = p.get(*label).copied().unwrap_or(0.0).clamp(1e-12, 1.0);
        log_loss_sum += -actual_prob.ln();
        if argmax(p) == *label {
            correct += 1;
        }
    }

    let n = predictions.len() as f64;
    Metrics {
        samples: predictions.len(),
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
    }
}
