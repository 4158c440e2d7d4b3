use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::{ConfidenceBins, Outcome};
use crate::config::EnsembleConfig;
use crate::ensemble::ModelRun;
use crate::feature_table::GameDay;
use crate::season;
use crate::seasonal_accuracy::{self, AccuracyTable};

/// A model that survived the accuracy filter, in rank order (0 = best).
#[derive(Debug, Clone)]
pub struct RankedModel<'a> {
    pub rank: usize,
    pub run: &'a ModelRun,
    pub overall_accuracy: f64,
    pub seasonal_score: f64,
}

/// One selected model's contribution to a pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickMember {
    pub rank: usize,
    pub seed: u64,
    pub confidence: f64,
    pub bin: usize,
    pub weight: f64,
    /// A_i for this model's confidence bin.
    pub bin_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPick {
    pub game_id: String,
    pub date: NaiveDate,
    pub season: i32,
    pub predicted: usize,
    pub actual: usize,
    pub algorithm_score: f64,
    pub alpha: f64,
    pub members: Vec<PickMember>,
}

impl ConsensusPick {
    pub fn is_correct(&self) -> bool {
        self.predicted == self.actual
    }

    pub fn direction(&self) -> &'static str {
        Outcome::from_label(self.predicted).map_or("Unknown", Outcome::name)
    }

    /// Confidence bin of the rank-1 model.
    pub fn lead_bin(&self) -> usize {
        self.members
            .iter()
            .min_by_key(|m| m.rank)
            .map_or(0, |m| m.bin)
    }

    pub fn lead_confidence(&self) -> f64 {
        self.members
            .iter()
            .min_by_key(|m| m.rank)
            .map_or(0.0, |m| m.confidence)
    }
}

/// Picks (possibly none) for one GameDay, plus what was used to make them.
#[derive(Debug, Clone, Serialize)]
pub struct DayConsensus {
    pub date: NaiveDate,
    pub season: i32,
    pub alpha: f64,
    pub eligible_models: usize,
    pub selected_seeds: Vec<u64>,
    pub picks: Vec<ConsensusPick>,
}

/// S = Σ w_i · A_i. Terms are summed in rank order so the result does not
/// depend on the order `members` is listed in.
pub fn algorithm_score(members: &[PickMember]) -> f64 {
    let mut ordered: Vec<&PickMember> = members.iter().collect();
    ordered.sort_by_key(|m| m.rank);
    ordered.iter().map(|m| m.weight * m.bin_accuracy).sum()
}

pub struct ConsensusSelector {
    top_k: usize,
    min_accuracy: f64,
    rank_weights: Vec<f64>,
    prior: f64,
    bins: ConfidenceBins,
}

impl ConsensusSelector {
    pub fn new(config: &EnsembleConfig, bins: ConfidenceBins) -> Self {
        Self {
            top_k: config.top_k,
            min_accuracy: config.min_accuracy,
            rank_weights: config.rank_weights.clone(),
            prior: config.accuracy_prior,
            bins,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Models whose overall held-out accuracy beats `min_accuracy`, ordered by
    /// seasonal score (descending, lower seed first on ties).
    pub fn rank<'a>(
        &self,
        runs: &'a [ModelRun],
        table: &AccuracyTable,
        season: i32,
        alpha: f64,
    ) -> Vec<RankedModel<'a>> {
        let mut ranked: Vec<RankedModel<'a>> = runs
            .iter()
            .filter_map(|run| {
                let overall_accuracy = table.overall_accuracy(run.seed);
                if overall_accuracy <= self.min_accuracy {
                    return None;
                }
                Some(RankedModel {
                    rank: 0,
                    run,
                    overall_accuracy,
                    seasonal_score: table.seasonal_score(run.seed, season, alpha),
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.seasonal_score
                .partial_cmp(&a.seasonal_score)
                .unwrap_or(Ordering::Equal)
                .then(a.run.seed.cmp(&b.run.seed))
        });
        for (rank, model) in ranked.iter_mut().enumerate() {
            model.rank = rank;
        }
        ranked
    }

    pub fn select(&self, runs: &[ModelRun], day: GameDay<'_>) -> DayConsensus {
        let alpha = season::season_progress(day.date, day.season);
        let table = seasonal_accuracy::score(runs, day.date, &self.bins, self.prior);
        let ranked = self.rank(runs, &table, day.season, alpha);
        let eligible_models = ranked.len();

        let mut result = DayConsensus {
            date: day.date,
            season: day.season,
            alpha,
            eligible_models,
            selected_seeds: Vec::new(),
            picks: Vec::new(),
        };
        if eligible_models < self.top_k {
            debug!(date = %day.date, eligible_models, top_k = self.top_k, "too few models for consensus");
            return result;
        }

        let top = &ranked[..self.top_k];
        result.selected_seeds = top.iter().map(|m| m.run.seed).collect();

        for (idx, game) in day.games.iter().enumerate() {
            let Some(predicted) = unanimous_class(top, idx) else {
                continue;
            };
            let members: Vec<PickMember> = top
                .iter()
                .filter_map(|model| {
                    let pred = model.run.predictions.get(idx)?;
                    Some(PickMember {
                        rank: model.rank,
                        seed: model.run.seed,
                        confidence: pred.confidence,
                        bin: pred.bin,
                        weight: self.rank_weights.get(model.rank).copied().unwrap_or(0.0),
                        bin_accuracy: table.blended_bin_accuracy(model.run.seed, day.season, pred.bin, alpha),
                    })
                })
                .collect();
            result.picks.push(ConsensusPick {
                game_id: game.id.clone(),
                date: day.date,
                season: day.season,
                predicted,
                actual: game.outcome,
                algorithm_score: algorithm_score(&members),
                alpha,
                members,
            });
        }

        if result.picks.is_empty() {
            debug!(date = %day.date, "no consensus picks");
        }
        result
    }
}

fn unanimous_class(top: &[RankedModel<'_>], game_idx: usize) -> Option<usize> {
    let mut classes = top
        .iter()
        .map(|m| m.run.predictions.get(game_idx).map(|p| p.predicted));
    let first = classes.next()??;
    for class in classes {
        if class? != first {
            return None;
        }
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{GamePrediction, HistoryRecord};
    use crate::feature_table::Game;
    use approx::assert_relative_eq;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn config() -> EnsembleConfig {
        EnsembleConfig {
            model_count: 5,
            min_accuracy: 0.0,
            ..EnsembleConfig::default()
        }
    }

    fn run(seed: u64, predicted: usize, hits: usize) -> ModelRun {
        let bins = ConfidenceBins::for_classes(3);
        let mut probs = vec![0.2, 0.2, 0.2];
        probs[predicted] = 0.6;
        let history = (0..4)
            .map(|i| HistoryRecord {
                date: d(2022, 10, 2),
                season: 2022,
                predicted: 1,
                actual: usize::from(i < hits),
                confidence: 0.6,
            })
            .collect();
        ModelRun {
            seed,
            predictions: vec![GamePrediction::from_probs(probs, &bins)],
            history,
        }
    }

    fn table(runs: &[ModelRun]) -> AccuracyTable {
        seasonal_accuracy::score(runs, d(2022, 11, 6), &ConfidenceBins::for_classes(3), 0.5)
    }

    fn games() -> Vec<Game> {
        vec![Game {
            id: "g1".into(),
            date: d(2022, 11, 6),
            season: 2022,
            features: vec![0.0],
            outcome: 1,
        }]
    }

    #[test]
    fn two_of_three_agreement_yields_no_pick() {
        let games = games();
        let day = GameDay {
            date: d(2022, 11, 6),
            season: 2022,
            games: &games,
        };
        let selector = ConsensusSelector::new(&config(), ConfidenceBins::for_classes(3));
        let runs = vec![run(1, 1, 4), run(2, 1, 4), run(3, 0, 4)];
        assert!(selector.select(&runs, day).picks.is_empty());

        let runs = vec![run(1, 1, 4), run(2, 1, 4), run(3, 1, 4)];
        assert_eq!(selector.select(&runs, day).picks.len(), 1);
    }

    #[test]
    fn pick_members_carry_the_scored_bucket_accuracy() {
        let games = games();
        let day = GameDay {
            date: d(2022, 11, 6),
            season: 2022,
            games: &games,
        };
        let selector = ConsensusSelector::new(&config(), ConfidenceBins::for_classes(3));
        let runs = vec![run(1, 1, 4), run(2, 1, 3), run(3, 1, 2)];
        let consensus = selector.select(&runs, day);
        let table = table(&runs);

        let pick = &consensus.picks[0];
        assert_eq!(consensus.selected_seeds, vec![1, 2, 3]);
        for member in &pick.members {
            assert_relative_eq!(
                member.bin_accuracy,
                table.blended_bin_accuracy(member.seed, 2022, member.bin, consensus.alpha)
            );
        }
        // every model predicted class 1, so the bin accuracies are the hit rates
        let hit_rates: Vec<f64> = pick.members.iter().map(|m| m.bin_accuracy).collect();
        assert_eq!(hit_rates, vec![1.0, 0.75, 0.5]);
    }

    #[test]
    fn ties_rank_lower_seed_first() {
        let selector = ConsensusSelector::new(&config(), ConfidenceBins::for_classes(3));
        let runs = vec![run(9, 1, 3), run(4, 1, 3), run(7, 1, 4)];
        let ranked = selector.rank(&runs, &table(&runs), 2022, 0.5);
        let seeds: Vec<u64> = ranked.iter().map(|m| m.run.seed).collect();
        assert_eq!(seeds, vec![7, 4, 9]);
    }

    #[test]
    fn models_at_or_below_threshold_are_excluded() {
        let cfg = EnsembleConfig {
            min_accuracy: 0.5,
            ..config()
        };
        let selector = ConsensusSelector::new(&cfg, ConfidenceBins::for_classes(3));
        let runs = vec![run(1, 1, 2), run(2, 1, 3)];
        let ranked = selector.rank(&runs, &table(&runs), 2022, 0.5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].run.seed, 2);
    }

    #[test]
    fn score_ignores_member_listing_order() {
        let member = |rank: usize, weight: f64, acc: f64| PickMember {
            rank,
            seed: rank as u64,
            confidence: 0.6,
            bin: 4,
            weight,
            bin_accuracy: acc,
        };
        let a = vec![member(0, 0.4, 0.61), member(1, 0.35, 0.57), member(2, 0.25, 0.49)];
        let b = vec![a[2].clone(), a[0].clone(), a[1].clone()];
        assert_eq!(algorithm_score(&a), algorithm_score(&b));
        assert_relative_eq!(algorithm_score(&a), 0.4 * 0.61 + 0.35 * 0.57 + 0.25 * 0.49);
    }
}
