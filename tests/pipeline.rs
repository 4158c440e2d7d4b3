use approx::assert_relative_eq;
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ou_consensus::analysis;
use ou_consensus::backtest;
use ou_consensus::calibration::ConfidenceBins;
use ou_consensus::config::{EngineConfig, SplitConfig};
use ou_consensus::consensus::ConsensusSelector;
use ou_consensus::ensemble::{self, CancelToken, EnsembleGenerator};
use ou_consensus::export;
use ou_consensus::error::{EngineError, TrainError};
use ou_consensus::feature_table::{FeatureTable, Game};
use ou_consensus::gbdt::{Classifier, GbdtTrainer, Trainer, TrainingSet};
use ou_consensus::training;

struct Constant(Vec<f64>);

impl Classifier for Constant {
    fn predict_proba(&self, _features: &[f64]) -> Vec<f64> {
        self.0.clone()
    }
}

/// Every model predicts the same fixed distribution.
struct ConstantTrainer(Vec<f64>);

impl Trainer for ConstantTrainer {
    fn fit(&self, _data: &TrainingSet<'_>, _seed: u64) -> Result<Box<dyn Classifier>, TrainError> {
        Ok(Box::new(Constant(self.0.clone())))
    }
}

/// Predicts the label frequencies of its training rows.
struct FrequencyTrainer;

impl Trainer for FrequencyTrainer {
    fn fit(&self, data: &TrainingSet<'_>, _seed: u64) -> Result<Box<dyn Classifier>, TrainError> {
        if data.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        let mut counts = vec![1.0; 3];
        for &label in &data.labels {
            counts[label] += 1.0;
        }
        let total: f64 = counts.iter().sum();
        Ok(Box::new(Constant(counts.iter().map(|c| c / total).collect())))
    }
}

/// Fails for odd seeds.
struct FlakyTrainer;

impl Trainer for FlakyTrainer {
    fn fit(&self, _data: &TrainingSet<'_>, seed: u64) -> Result<Box<dyn Classifier>, TrainError> {
        if seed % 2 == 1 {
            return Err(TrainError::DegenerateLabels);
        }
        Ok(Box::new(Constant(vec![0.3, 0.6, 0.1])))
    }
}

/// `per_season` games per season spread over weekly dates from mid September,
/// two games per date.
fn synthetic_table(seasons: &[i32], per_season: usize, outcome: impl Fn(&mut StdRng, &[f64]) -> usize) -> FeatureTable {
    let mut rng = StdRng::seed_from_u64(11);
    let mut games = Vec::new();
    for &season in seasons {
        let start = NaiveDate::from_ymd_opt(season, 9, 14).unwrap();
        for i in 0..per_season {
            let features = vec![rng.gen_range(0.0..32.0), rng.gen_range(37.0..55.0)];
            games.push(Game {
                id: format!("{season}-{i:02}"),
                date: start + Duration::weeks((i / 2) as i64),
                season,
                outcome: outcome(&mut rng, &features),
                features,
            });
        }
    }
    FeatureTable::from_games(vec!["pace".into(), "ou_line".into()], games)
}

fn small_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.ensemble.model_count = 5;
    config.ensemble.min_accuracy = 0.0;
    config.min_training_seasons = 1;
    config.threads = Some(2);
    config
}

#[test]
fn identical_constant_models_pick_every_game_at_the_prior() {
    let table = synthetic_table(&[2020, 2021, 2022], 10, |_, _| 1);
    let mut config = small_config();
    config.train_split = SplitConfig {
        validation_fraction: 0.0,
        subsample_fraction: 1.0,
    };
    let trainer = ConstantTrainer(vec![0.2, 0.7, 0.1]);

    let report = training::run_training(&table, &config, &trainer, &CancelToken::new()).unwrap();

    assert_eq!(report.picks.len(), 20);
    for pick in &report.picks {
        assert_eq!(pick.predicted, 1);
        assert_eq!(pick.members.len(), 3);
        assert_relative_eq!(pick.algorithm_score, config.ensemble.accuracy_prior, epsilon = 1e-12);
    }
    assert!(report.days.iter().all(|d| d.models_trained == 5 && d.picks == d.games));

    // no edge at a coin-flip score, so nothing is staked
    let sim = report.simulation.expect("every pick won, so its bin qualifies");
    assert_eq!(sim.bets, 20);
    assert_relative_eq!(sim.ending_capital, config.simulation.starting_capital);
}

#[test]
fn exported_picks_load_back_for_analysis() {
    let table = synthetic_table(&[2020, 2021, 2022], 10, |_, _| 1);
    let mut config = small_config();
    config.train_split = SplitConfig {
        validation_fraction: 0.0,
        subsample_fraction: 1.0,
    };
    let trainer = ConstantTrainer(vec![0.2, 0.7, 0.1]);
    let report = training::run_training(&table, &config, &trainer, &CancelToken::new()).unwrap();

    let dir = std::env::temp_dir().join(format!("ou_consensus_export_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let summary = export::export_training(&dir, &report).unwrap();
    let picks_path = dir.join(export::PICKS_FILE);
    assert!(summary.files.contains(&picks_path));
    assert!(dir.join("performance_statistics.txt").exists());

    let loaded = export::read_picks(&picks_path).unwrap();
    assert_eq!(loaded.len(), report.picks.len());
    for (back, orig) in loaded.iter().zip(&report.picks) {
        assert_eq!(back.game_id, orig.game_id);
        assert_eq!(back.date, orig.date);
        assert_eq!((back.predicted, back.actual), (orig.predicted, orig.actual));
        assert_eq!(back.members.len(), orig.members.len());
        assert_relative_eq!(back.algorithm_score, orig.algorithm_score, epsilon = 1e-12);
        assert_relative_eq!(back.alpha, orig.alpha, epsilon = 1e-12);
    }

    let analysis = analysis::analyze(&loaded, &ConfidenceBins::for_classes(3));
    assert_eq!(analysis.total_picks, 20);
    assert_eq!(analysis.overall_accuracy, Some(1.0));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn later_games_do_not_change_earlier_picks() {
    let base = synthetic_table(&[2020, 2021], 12, |rng, _| rng.gen_range(0..2));
    let decision = base.dates()[8];

    let mut games = base.games().to_vec();
    for i in 0..30 {
        games.push(Game {
            id: format!("future-{i}"),
            date: decision + Duration::days(1 + i),
            season: 2021,
            features: vec![0.0, 99.0],
            outcome: 2,
        });
    }
    let extended = FeatureTable::from_games(base.feature_names().to_vec(), games);

    let config = small_config();
    let generator = EnsembleGenerator::new(&FrequencyTrainer, config.train_split, 3, 2);
    let selector = ConsensusSelector::new(&config.ensemble, generator.bins());
    let seeds = ensemble::training_seeds(42, 5, 0);
    let cancel = CancelToken::new();

    let run_on = |table: &FeatureTable| {
        let outcome = generator.generate(table, decision, &seeds, &cancel).unwrap();
        let day = table.game_day(decision).unwrap();
        (outcome.runs.clone(), selector.select(&outcome.runs, day).picks)
    };
    let (runs_a, picks_a) = run_on(&base);
    let (runs_b, picks_b) = run_on(&extended);

    assert_eq!(runs_a, runs_b);
    assert_eq!(picks_a, picks_b);
    assert!(runs_a.iter().flat_map(|r| &r.history).all(|h| h.date < decision));
}

#[test]
fn failed_fits_are_skipped_and_too_few_survivors_means_no_pick() {
    let table = synthetic_table(&[2020, 2021], 8, |_, _| 0);
    let decision = table.decision_dates(1).unwrap()[0];
    let generator = EnsembleGenerator::new(&FlakyTrainer, SplitConfig::default(), 3, 2);
    let seeds = ensemble::training_seeds(42, 4, 0);

    let outcome = generator.generate(&table, decision, &seeds, &CancelToken::new()).unwrap();
    let trained: Vec<u64> = outcome.runs.iter().map(|r| r.seed).collect();
    assert_eq!(trained, vec![42, 44]);
    assert_eq!(outcome.skipped.len(), 2);

    let config = small_config();
    let selector = ConsensusSelector::new(&config.ensemble, generator.bins());
    let consensus = selector.select(&outcome.runs, table.game_day(decision).unwrap());
    assert!(consensus.picks.is_empty());
    assert!(consensus.selected_seeds.is_empty());
}

#[test]
fn cancelled_token_stops_the_run() {
    let table = synthetic_table(&[2020, 2021], 8, |rng, _| rng.gen_range(0..2));
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = training::run_training(&table, &small_config(), &FrequencyTrainer, &cancel).unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)));
}

#[test]
fn invalid_config_fails_before_training() {
    let table = synthetic_table(&[2020, 2021], 8, |_, _| 1);
    let mut config = small_config();
    config.ensemble.rank_weights = vec![0.5, 0.5, 0.5];
    let err = training::run_training(&table, &config, &FrequencyTrainer, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[test]
fn backtest_tables_repeat_exactly_for_the_same_seeds() {
    let table = synthetic_table(&[2019, 2020, 2021], 16, |rng, features| {
        let noisy = features[0] + rng.gen_range(-6.0..6.0);
        usize::from(noisy > 16.0)
    });
    let mut config = small_config();
    config.ensemble.model_count = 4;
    config.backtest.seed_runs = 2;
    config.backtest.split = SplitConfig {
        validation_fraction: 0.25,
        subsample_fraction: 0.8,
    };
    config.hyperparameters.n_estimators = 8;
    config.hyperparameters.max_bins = 8;

    let trainer = GbdtTrainer::new(config.hyperparameters.clone());
    let first = backtest::run_backtest(&table, &config, &trainer, &CancelToken::new()).unwrap();
    config.threads = Some(1);
    let second = backtest::run_backtest(&table, &config, &trainer, &CancelToken::new()).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.seed_runs, 2);
    assert!(first.model_accuracy.is_some());
    assert!(!first.model_by_season.is_empty());
}
