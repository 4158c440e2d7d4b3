use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::calibration::{ConfidenceBins, Tally};
use crate::ensemble::{HistoryRecord, ModelRun};

/// (model id, season, confidence bin)
pub type BucketKey = (u64, i32, usize);

/// Calibration buckets of one model, built from its held-out predictions.
#[derive(Debug, Clone, Default)]
pub struct ModelAccuracy {
    pub model_id: u64,
    pub by_bin: BTreeMap<(i32, usize), Tally>,
    pub by_season: BTreeMap<i32, Tally>,
    pub overall: Tally,
}

impl ModelAccuracy {
    /// Only records dated strictly before `as_of` are counted.
    pub fn from_history(
        model_id: u64,
        history: &[HistoryRecord],
        as_of: NaiveDate,
        bins: &ConfidenceBins,
    ) -> Self {
        let mut acc = Self {
            model_id,
            ..Self::default()
        };
        for record in history.iter().filter(|r| r.date < as_of) {
            let hit = record.is_correct();
            acc.by_bin
                .entry((record.season, bins.bin(record.confidence)))
                .or_default()
                .record(hit);
            acc.by_season.entry(record.season).or_default().record(hit);
            acc.overall.record(hit);
        }
        acc
    }

    pub fn bin_accuracy(&self, season: i32, bin: usize, prior: f64) -> f64 {
        self.by_bin
            .get(&(season, bin))
            .copied()
            .unwrap_or_default()
            .accuracy(prior)
    }

    pub fn season_accuracy(&self, season: i32, prior: f64) -> f64 {
        self.by_season
            .get(&season)
            .copied()
            .unwrap_or_default()
            .accuracy(prior)
    }

    pub fn overall_accuracy(&self, prior: f64) -> f64 {
        self.overall.accuracy(prior)
    }

    fn has_observations(&self, season: i32) -> bool {
        self.by_season.get(&season).is_some_and(|t| !t.is_empty())
    }

    /// α actually applied for this model: 1 when it has nothing from the
    /// prior season to lean on.
    pub fn effective_alpha(&self, season: i32, alpha: f64) -> f64 {
        if self.has_observations(season - 1) {
            alpha
        } else {
            1.0
        }
    }

    /// Ranking score: blend of current- and prior-season accuracy.
    pub fn seasonal_score(&self, season: i32, alpha: f64, prior: f64) -> f64 {
        let a = self.effective_alpha(season, alpha);
        a * self.season_accuracy(season, prior) + (1.0 - a) * self.season_accuracy(season - 1, prior)
    }

    /// A_i: blend of current- and prior-season accuracy in one confidence bin.
    pub fn blended_bin_accuracy(&self, season: i32, bin: usize, alpha: f64, prior: f64) -> f64 {
        let a = self.effective_alpha(season, alpha);
        a * self.bin_accuracy(season, bin, prior) + (1.0 - a) * self.bin_accuracy(season - 1, bin, prior)
    }
}

/// Bucket accuracies keyed by (model, season, bin), rebuilt for each decision
/// date. Missing keys read as the prior.
#[derive(Debug, Clone)]
pub struct AccuracyTable {
    prior: f64,
    models: BTreeMap<u64, ModelAccuracy>,
}

impl AccuracyTable {
    pub fn prior(&self) -> f64 {
        self.prior
    }

    pub fn model(&self, model_id: u64) -> Option<&ModelAccuracy> {
        self.models.get(&model_id)
    }

    pub fn tally(&self, (model_id, season, bin): BucketKey) -> Tally {
        self.model(model_id)
            .and_then(|m| m.by_bin.get(&(season, bin)))
            .copied()
            .unwrap_or_default()
    }

    pub fn accuracy(&self, key: BucketKey) -> f64 {
        self.tally(key).accuracy(self.prior)
    }

    pub fn overall_accuracy(&self, model_id: u64) -> f64 {
        self.model(model_id)
            .map_or(self.prior, |m| m.overall_accuracy(self.prior))
    }

    pub fn seasonal_score(&self, model_id: u64, season: i32, alpha: f64) -> f64 {
        self.model(model_id)
            .map_or(self.prior, |m| m.seasonal_score(season, alpha, self.prior))
    }

    /// A_i for `model_id` in confidence bin `bin`.
    pub fn blended_bin_accuracy(&self, model_id: u64, season: i32, bin: usize, alpha: f64) -> f64 {
        self.model(model_id)
            .map_or(self.prior, |m| m.blended_bin_accuracy(season, bin, alpha, self.prior))
    }

    /// Number of non-empty (model, season, bin) buckets.
    pub fn len(&self) -> usize {
        self.models.values().map(|m| m.by_bin.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-bucket accuracy over every run's history strictly before `as_of`.
pub fn score(runs: &[ModelRun], as_of: NaiveDate, bins: &ConfidenceBins, prior: f64) -> AccuracyTable {
    let models = runs
        .iter()
        .map(|run| (run.seed, ModelAccuracy::from_history(run.seed, &run.history, as_of, bins)))
        .collect();
    AccuracyTable { prior, models }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn rec(date: NaiveDate, season: i32, hit: bool, confidence: f64) -> HistoryRecord {
        HistoryRecord {
            date,
            season,
            predicted: 1,
            actual: if hit { 1 } else { 0 },
            confidence,
        }
    }

    #[test]
    fn records_on_or_after_as_of_are_ignored() {
        let bins = ConfidenceBins::for_classes(3);
        let history = vec![
            rec(d(2022, 10, 2), 2022, true, 0.6),
            rec(d(2022, 10, 9), 2022, false, 0.6),
            rec(d(2022, 10, 16), 2022, false, 0.6),
        ];
        let acc = ModelAccuracy::from_history(7, &history, d(2022, 10, 9), &bins);
        assert_eq!(acc.overall.total, 1);
        assert_eq!(acc.season_accuracy(2022, 0.5), 1.0);
    }

    #[test]
    fn missing_prior_season_forces_alpha_to_one() {
        let bins = ConfidenceBins::for_classes(3);
        let history = vec![rec(d(2022, 10, 2), 2022, true, 0.6)];
        let acc = ModelAccuracy::from_history(1, &history, d(2022, 10, 9), &bins);
        assert_eq!(acc.effective_alpha(2022, 0.1), 1.0);
        assert_eq!(acc.seasonal_score(2022, 0.1, 0.5), 1.0);
    }

    #[test]
    fn blends_current_and_prior_season_bins() {
        let bins = ConfidenceBins::for_classes(3);
        let history = vec![
            rec(d(2021, 10, 3), 2021, true, 0.6),
            rec(d(2021, 10, 10), 2021, false, 0.6),
            rec(d(2022, 9, 18), 2022, true, 0.6),
        ];
        let acc = ModelAccuracy::from_history(1, &history, d(2022, 9, 25), &bins);
        let bin = bins.bin(0.6);
        assert_relative_eq!(acc.blended_bin_accuracy(2022, bin, 0.25, 0.5), 0.25 * 1.0 + 0.75 * 0.5);
        // empty bin in both seasons
        assert_relative_eq!(acc.blended_bin_accuracy(2022, bin + 3, 0.25, 0.5), 0.5);
    }

    #[test]
    fn table_reads_prior_for_unseen_buckets() {
        let bins = ConfidenceBins::for_classes(3);
        let runs = vec![ModelRun {
            seed: 42,
            predictions: Vec::new(),
            history: vec![rec(d(2022, 10, 2), 2022, true, 0.9)],
        }];
        let table = score(&runs, d(2023, 1, 1), &bins, 0.5);
        assert_eq!(table.len(), 1);
        assert_eq!(table.accuracy((42, 2022, bins.bin(0.9))), 1.0);
        assert_eq!(table.accuracy((43, 2022, 0)), 0.5);
        assert_eq!(table.overall_accuracy(43), 0.5);
        assert_eq!(table.seasonal_score(43, 2022, 0.3), 0.5);
        assert_eq!(table.blended_bin_accuracy(42, 2022, bins.bin(0.9), 1.0), 1.0);
    }
}
