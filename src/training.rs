use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::calibration::{self, ConfidenceBins};
use crate::config::EngineConfig;
use crate::consensus::{ConsensusPick, ConsensusSelector};
use crate::ensemble::{self, CancelToken, EnsembleGenerator};
use crate::error::EngineError;
use crate::feature_table::FeatureTable;
use crate::gbdt::Trainer;
use crate::reports::{self, AccuracyRow};
use crate::simulation::{self, SimulationReport};

#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub season: i32,
    pub games: usize,
    pub models_trained: usize,
    pub models_skipped: usize,
    pub models_eligible: usize,
    pub picks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub days: Vec<DaySummary>,
    pub picks: Vec<ConsensusPick>,
    pub by_confidence: Vec<AccuracyRow>,
    pub by_score: Vec<AccuracyRow>,
    pub by_score_season: Vec<AccuracyRow>,
    pub by_season: Vec<AccuracyRow>,
    /// Labels of the score bins the simulation was restricted to.
    pub simulation_bins: Vec<String>,
    pub simulation: Option<SimulationReport>,
}

/// Walks every decision date, trains a fresh ensemble from the games before
/// it and keeps the unanimous picks; then simulates the bankroll over picks
/// from score bins that held up in-sample.
pub fn run_training(
    table: &FeatureTable,
    config: &EngineConfig,
    trainer: &dyn Trainer,
    cancel: &CancelToken,
) -> Result<TrainingReport, EngineError> {
    config.validate()?;
    let dates = table.decision_dates(config.min_training_seasons)?;
    let generator = EnsembleGenerator::new(
        trainer,
        config.train_split,
        config.hyperparameters.num_class,
        config.worker_threads(),
    );
    let bins = generator.bins();
    let selector = ConsensusSelector::new(&config.ensemble, bins);

    let mut days = Vec::with_capacity(dates.len());
    let mut picks: Vec<ConsensusPick> = Vec::new();
    for (date_index, &date) in dates.iter().enumerate() {
        let Some(day) = table.game_day(date) else {
            continue;
        };
        info!(%date, "processing date {}/{}", date_index + 1, dates.len());

        let seeds = ensemble::training_seeds(config.ensemble.base_seed, config.ensemble.model_count, date_index);
        let outcome = generator.generate(table, date, &seeds, cancel)?;
        let consensus = selector.select(&outcome.runs, day);

        if consensus.eligible_models < selector.top_k() {
            warn!(
                %date,
                eligible = consensus.eligible_models,
                needed = selector.top_k(),
                "not enough models passed the accuracy threshold"
            );
        } else if consensus.picks.is_empty() {
            info!(%date, "no consensus");
        }

        days.push(DaySummary {
            date,
            season: day.season,
            games: day.games.len(),
            models_trained: outcome.runs.len(),
            models_skipped: outcome.skipped.len(),
            models_eligible: consensus.eligible_models,
            picks: consensus.picks.len(),
        });
        picks.extend(consensus.picks);
    }

    if picks.is_empty() {
        warn!("no consensus picks across all dates");
    } else {
        info!(picks = picks.len(), "consensus picks collected");
    }

    Ok(summarize(days, picks, config, &bins))
}

fn summarize(days: Vec<DaySummary>, picks: Vec<ConsensusPick>, config: &EngineConfig, bins: &ConfidenceBins) -> TrainingReport {
    let qualifying = reports::qualifying_score_bins(&picks, config.simulation.min_bin_accuracy);
    let simulation = if qualifying.is_empty() {
        if !picks.is_empty() {
            warn!(
                threshold = config.simulation.min_bin_accuracy,
                "no algorithm score bin clears the threshold; skipping simulation"
            );
        }
        None
    } else {
        let selected: Vec<&ConsensusPick> = picks
            .iter()
            .filter(|p| qualifying.contains(&calibration::score_bin(p.algorithm_score)))
            .collect();
        let report = simulation::simulate(&selected, &config.simulation);
        info!(
            bets = report.bets,
            ending_capital = report.ending_capital,
            profit = report.total_profit,
            units = report.total_units,
            "simulation complete"
        );
        Some(report)
    };

    TrainingReport {
        by_confidence: reports::by_confidence_bin(&picks, bins),
        by_score: reports::by_score_bin(&picks),
        by_score_season: reports::by_score_bin_and_season(&picks),
        by_season: reports::picks_by_season(&picks),
        simulation_bins: qualifying.iter().map(|&b| calibration::score_bin_label(b)).collect(),
        simulation,
        days,
        picks,
    }
}
