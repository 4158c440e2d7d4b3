use std::collections::BTreeMap;

use serde::Serialize;

use crate::calibration::{self, ConfidenceBins, SCORE_BIN_COUNT, Tally};
use crate::consensus::ConsensusPick;

/// One line of an accuracy table. `accuracy` and `mean_score` are `None` for
/// groups without observations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyRow {
    pub group: String,
    pub season: Option<i32>,
    pub count: usize,
    pub accuracy: Option<f64>,
    pub mean_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    tally: Tally,
    score_sum: f64,
}

impl Bucket {
    fn add(&mut self, correct: bool, score: f64) {
        self.tally.record(correct);
        self.score_sum += score;
    }

    fn row(&self, group: String, season: Option<i32>) -> AccuracyRow {
        let n = self.tally.total;
        AccuracyRow {
            group,
            season,
            count: n,
            accuracy: (n > 0).then(|| self.tally.correct as f64 / n as f64),
            mean_score: (n > 0).then(|| self.score_sum / n as f64),
        }
    }
}

/// An observation to tabulate: (correct, score, season, bin).
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub correct: bool,
    pub score: f64,
    pub season: i32,
    pub bin: usize,
}

impl Observation {
    /// Binned by the rank-1 model's confidence.
    pub fn by_confidence(pick: &ConsensusPick) -> Self {
        Self {
            correct: pick.is_correct(),
            score: pick.algorithm_score,
            season: pick.season,
            bin: pick.lead_bin(),
        }
    }

    pub fn by_score(pick: &ConsensusPick) -> Self {
        Self {
            correct: pick.is_correct(),
            score: pick.algorithm_score,
            season: pick.season,
            bin: calibration::score_bin(pick.algorithm_score),
        }
    }
}

/// Every bin in `0..bin_count` appears, empty or not.
pub fn by_bin(observations: &[Observation], bin_count: usize, label: impl Fn(usize) -> String) -> Vec<AccuracyRow> {
    let mut buckets = vec![Bucket::default(); bin_count];
    for obs in observations {
        if let Some(bucket) = buckets.get_mut(obs.bin) {
            bucket.add(obs.correct, obs.score);
        }
    }
    buckets
        .iter()
        .enumerate()
        .map(|(bin, bucket)| bucket.row(label(bin), None))
        .collect()
}

/// Bin × season grid over the seasons that have observations.
pub fn by_bin_and_season(
    observations: &[Observation],
    bin_count: usize,
    label: impl Fn(usize) -> String,
) -> Vec<AccuracyRow> {
    let mut cells: BTreeMap<(usize, i32), Bucket> = BTreeMap::new();
    let mut seasons: Vec<i32> = observations.iter().map(|o| o.season).collect();
    seasons.sort_unstable();
    seasons.dedup();
    for bin in 0..bin_count {
        for &season in &seasons {
            cells.insert((bin, season), Bucket::default());
        }
    }
    for obs in observations {
        if let Some(cell) = cells.get_mut(&(obs.bin, obs.season)) {
            cell.add(obs.correct, obs.score);
        }
    }
    cells
        .iter()
        .map(|(&(bin, season), cell)| cell.row(label(bin), Some(season)))
        .collect()
}

pub fn by_season(observations: &[Observation]) -> Vec<AccuracyRow> {
    let mut seasons: BTreeMap<i32, Bucket> = BTreeMap::new();
    for obs in observations {
        seasons.entry(obs.season).or_default().add(obs.correct, obs.score);
    }
    seasons
        .iter()
        .map(|(&season, bucket)| bucket.row(season.to_string(), Some(season)))
        .collect()
}

pub fn by_confidence_bin(picks: &[ConsensusPick], bins: &ConfidenceBins) -> Vec<AccuracyRow> {
    let obs: Vec<Observation> = picks.iter().map(Observation::by_confidence).collect();
    by_bin(&obs, bins.count(), |b| bins.label(b))
}

pub fn by_score_bin(picks: &[ConsensusPick]) -> Vec<AccuracyRow> {
    let obs: Vec<Observation> = picks.iter().map(Observation::by_score).collect();
    by_bin(&obs, SCORE_BIN_COUNT, calibration::score_bin_label)
}

pub fn by_score_bin_and_season(picks: &[ConsensusPick]) -> Vec<AccuracyRow> {
    let obs: Vec<Observation> = picks.iter().map(Observation::by_score).collect();
    by_bin_and_season(&obs, SCORE_BIN_COUNT, calibration::score_bin_label)
}

pub fn picks_by_season(picks: &[ConsensusPick]) -> Vec<AccuracyRow> {
    let obs: Vec<Observation> = picks.iter().map(Observation::by_score).collect();
    by_season(&obs)
}

/// Score bins whose in-sample accuracy is strictly above `min_accuracy`.
pub fn qualifying_score_bins(picks: &[ConsensusPick], min_accuracy: f64) -> Vec<usize> {
    by_score_bin(picks)
        .iter()
        .enumerate()
        .filter(|(_, row)| row.accuracy.is_some_and(|acc| acc > min_accuracy))
        .map(|(bin, _)| bin)
        .collect()
}

/// Averages the same table computed once per run. Accuracy and mean score
/// are averaged over the runs where the group had data; counts are summed.
/// Row order follows first appearance.
pub fn average_tables(tables: &[Vec<AccuracyRow>]) -> Vec<AccuracyRow> {
    struct Acc {
        order: usize,
        count: usize,
        accuracy_sum: f64,
        accuracy_n: usize,
        score_sum: f64,
        score_n: usize,
    }

    let mut groups: BTreeMap<(String, Option<i32>), Acc> = BTreeMap::new();
    for row in tables.iter().flatten() {
        let next = groups.len();
        let acc = groups
            .entry((row.group.clone(), row.season))
            .or_insert(Acc {
                order: next,
                count: 0,
                accuracy_sum: 0.0,
                accuracy_n: 0,
                score_sum: 0.0,
                score_n: 0,
            });
        acc.count += row.count;
        if let Some(a) = row.accuracy {
            acc.accuracy_sum += a;
            acc.accuracy_n += 1;
        }
        if let Some(s) = row.mean_score {
            acc.score_sum += s;
            acc.score_n += 1;
        }
    }

    let mut rows: Vec<(usize, AccuracyRow)> = groups
        .into_iter()
        .map(|((group, season), acc)| {
            let row = AccuracyRow {
                group,
                season,
                count: acc.count,
                accuracy: (acc.accuracy_n > 0).then(|| acc.accuracy_sum / acc.accuracy_n as f64),
                mean_score: (acc.score_n > 0).then(|| acc.score_sum / acc.score_n as f64),
            };
            (acc.order, row)
        })
        .collect();
    rows.sort_by_key(|(order, _)| *order);
    rows.into_iter().map(|(_, row)| row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn pick(score: f64, season: i32, correct: bool) -> ConsensusPick {
        ConsensusPick {
            game_id: "g".into(),
            date: NaiveDate::from_ymd_opt(season, 10, 1).unwrap(),
            season,
            predicted: 1,
            actual: if correct { 1 } else { 0 },
            algorithm_score: score,
            alpha: 0.3,
            members: Vec::new(),
        }
    }

    #[test]
    fn score_table_lists_every_bin() {
        let picks = vec![pick(0.57, 2021, true), pick(0.58, 2021, false), pick(0.62, 2022, true)];
        let table = by_score_bin(&picks);
        assert_eq!(table.len(), SCORE_BIN_COUNT);
        assert_eq!(table[11].group, "55-60%");
        assert_eq!(table[11].count, 2);
        assert_relative_eq!(table[11].accuracy.unwrap(), 0.5);
        assert_eq!(table[0].accuracy, None);
    }

    #[test]
    fn qualifying_bins_need_strictly_better_accuracy() {
        let picks = vec![
            pick(0.57, 2021, true),
            pick(0.58, 2021, false),
            pick(0.62, 2022, true),
        ];
        assert_eq!(qualifying_score_bins(&picks, 0.525), vec![12]);
        assert_eq!(qualifying_score_bins(&picks, 0.5), vec![12]);
        assert_eq!(qualifying_score_bins(&picks, 0.49), vec![11, 12]);
    }

    #[test]
    fn season_grid_covers_seen_seasons() {
        let picks = vec![pick(0.57, 2021, true), pick(0.62, 2022, true)];
        let grid = by_score_bin_and_season(&picks);
        assert_eq!(grid.len(), SCORE_BIN_COUNT * 2);
        assert!(grid.iter().filter(|r| r.count > 0).count() == 2);
    }

    #[test]
    fn averaging_skips_runs_without_data() {
        let row = |acc: Option<f64>, count| AccuracyRow {
            group: "60-65%".into(),
            season: None,
            count,
            accuracy: acc,
            mean_score: None,
        };
        let averaged = average_tables(&[vec![row(Some(0.6), 5)], vec![row(None, 0)], vec![row(Some(0.8), 5)]]);
        assert_eq!(averaged.len(), 1);
        assert_eq!(averaged[0].count, 10);
        assert_relative_eq!(averaged[0].accuracy.unwrap(), 0.7);
    }
}
