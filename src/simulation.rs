//! Bankroll simulation over consensus picks.
//!
//! Stakes are sized with fractional Kelly:
//!   f* = (b·p − q) / b
//! where
//!   b = net payout per unit staked (1/1.1 at -110 pricing)
//!   p = algorithm score, used as the win probability
//!   q = 1 − p
//!
//! A flat-unit ledger (+1 per win, −vig per loss) is kept alongside the
//! dollar ledger.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::config::SimulationConfig;
use crate::consensus::ConsensusPick;

/// Fraction of bankroll to stake. Returns `0.0` when there is no edge or the
/// inputs are unusable (NaN probability, non-positive payout).
pub fn kelly_fraction(win_prob: f64, payout_ratio: f64, multiplier: f64) -> f64 {
    if win_prob.is_nan() || payout_ratio.is_nan() || payout_ratio <= 0.0 {
        return 0.0;
    }
    let p = win_prob.clamp(0.0, 1.0);
    let q = 1.0 - p;
    let f = (payout_ratio * p - q) / payout_ratio;
    if f <= 0.0 {
        return 0.0;
    }
    (f * multiplier).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BetRecord {
    pub date: NaiveDate,
    pub game_id: String,
    pub algorithm_score: f64,
    pub stake: f64,
    pub won: bool,
    pub profit: f64,
    pub capital: f64,
    pub units: f64,
    pub cumulative_units: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationState {
    pub starting_capital: f64,
    pub capital: f64,
    pub cumulative_units: f64,
    pub ledger: Vec<BetRecord>,
}

impl SimulationState {
    pub fn new(starting_capital: f64) -> Self {
        let capital = starting_capital.max(0.0);
        Self {
            starting_capital: capital,
            capital,
            cumulative_units: 0.0,
            ledger: Vec::new(),
        }
    }

    /// Settles one pick. Callers feed picks in chronological order.
    pub fn apply(&mut self, pick: &ConsensusPick, algorithm_score: f64, config: &SimulationConfig) {
        let fraction = kelly_fraction(algorithm_score, config.payout_ratio, config.kelly_multiplier);
        let stake = (fraction * self.capital).clamp(0.0, self.capital);
        // a push against an over/under pick settles as a loss
        let won = pick.is_correct();
        let profit = if won { stake * config.payout_ratio } else { -stake };
        self.capital = (self.capital + profit).max(0.0);

        let units = if won { 1.0 } else { -config.vig_units };
        self.cumulative_units += units;

        self.ledger.push(BetRecord {
            date: pick.date,
            game_id: pick.game_id.clone(),
            algorithm_score,
            stake,
            won,
            profit,
            capital: self.capital,
            units,
            cumulative_units: self.cumulative_units,
        });
    }

    pub fn wins(&self) -> usize {
        self.ledger.iter().filter(|b| b.won).count()
    }

    pub fn win_rate(&self) -> f64 {
        if self.ledger.is_empty() {
            return 0.0;
        }
        self.wins() as f64 / self.ledger.len() as f64
    }

    pub fn dollar_profit(&self) -> f64 {
        self.capital - self.starting_capital
    }

    /// Capital at the end of each betting day.
    pub fn capital_series(&self) -> Vec<(NaiveDate, f64)> {
        let mut series: Vec<(NaiveDate, f64)> = Vec::new();
        for bet in &self.ledger {
            match series.last_mut() {
                Some(last) if last.0 == bet.date => last.1 = bet.capital,
                _ => series.push((bet.date, bet.capital)),
            }
        }
        series
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    pub const ALL: [Period; 4] = [Period::Day, Period::Week, Period::Month, Period::Year];

    pub fn name(self) -> &'static str {
        match self {
            Period::Day => "Day",
            Period::Week => "Week",
            Period::Month => "Month",
            Period::Year => "Year",
        }
    }

    fn key(self, date: NaiveDate) -> (i32, u32) {
        match self {
            Period::Day => (date.year(), date.ordinal()),
            Period::Week => {
                let week = date.iso_week();
                (week.year(), week.week())
            }
            Period::Month => (date.year(), date.month()),
            Period::Year => (date.year(), 0),
        }
    }

    fn label(self, date: NaiveDate) -> String {
        match self {
            Period::Day => date.format("%Y-%m-%d").to_string(),
            Period::Week => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Period::Month => date.format("%Y-%m").to_string(),
            Period::Year => date.year().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodExtremes {
    pub period: Period,
    pub best_label: String,
    pub best: f64,
    pub worst_label: String,
    pub worst: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    /// Best/worst by summed unit profit within each period.
    pub units: Vec<PeriodExtremes>,
    /// Best/worst by cumulative dollar profit at the end of each period.
    pub dollars: Vec<PeriodExtremes>,
}

impl PerformanceStats {
    pub fn from_ledger(ledger: &[BetRecord], starting_capital: f64) -> Self {
        let mut stats = Self::default();
        for period in Period::ALL {
            let mut units: BTreeMap<(i32, u32), (NaiveDate, f64)> = BTreeMap::new();
            let mut dollars: BTreeMap<(i32, u32), (NaiveDate, f64)> = BTreeMap::new();
            for bet in ledger {
                let key = period.key(bet.date);
                units.entry(key).or_insert((bet.date, 0.0)).1 += bet.units;
                dollars.insert(key, (bet.date, bet.capital - starting_capital));
            }
            if let Some(extremes) = extremes(period, &units) {
                stats.units.push(extremes);
            }
            if let Some(extremes) = extremes(period, &dollars) {
                stats.dollars.push(extremes);
            }
        }
        stats
    }
}

// Earliest period wins ties on both ends.
fn extremes(period: Period, values: &BTreeMap<(i32, u32), (NaiveDate, f64)>) -> Option<PeriodExtremes> {
    let mut iter = values.values();
    let first = *iter.next()?;
    let (mut best, mut worst) = (first, first);
    for &(date, value) in iter {
        if value > best.1 {
            best = (date, value);
        }
        if value < worst.1 {
            worst = (date, value);
        }
    }
    Some(PeriodExtremes {
        period,
        best_label: period.label(best.0),
        best: best.1,
        worst_label: period.label(worst.0),
        worst: worst.1,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub starting_capital: f64,
    pub ending_capital: f64,
    pub total_profit: f64,
    pub bets: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub total_units: f64,
    pub ledger: Vec<BetRecord>,
    pub capital_series: Vec<(NaiveDate, f64)>,
    pub stats: PerformanceStats,
}

/// Runs the bankroll over `picks` in date order (stable within a date).
pub fn simulate(picks: &[&ConsensusPick], config: &SimulationConfig) -> SimulationReport {
    let mut ordered: Vec<&ConsensusPick> = picks.to_vec();
    ordered.sort_by_key(|p| p.date);

    let mut state = SimulationState::new(config.starting_capital);
    for pick in ordered {
        state.apply(pick, pick.algorithm_score, config);
    }

    SimulationReport {
        starting_capital: state.starting_capital,
        ending_capital: state.capital,
        total_profit: state.dollar_profit(),
        bets: state.ledger.len(),
        wins: state.wins(),
        win_rate: state.win_rate(),
        total_units: state.cumulative_units,
        capital_series: state.capital_series(),
        stats: PerformanceStats::from_ledger(&state.ledger, state.starting_capital),
        ledger: state.ledger,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pick(date: NaiveDate, predicted: usize, actual: usize) -> ConsensusPick {
        ConsensusPick {
            game_id: format!("{date}-{predicted}"),
            date,
            season: 2022,
            predicted,
            actual,
            algorithm_score: 0.6,
            alpha: 0.5,
            members: Vec::new(),
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn kelly_has_no_stake_without_edge() {
        // break-even at -110 is 1.1 / 2.1
        assert_relative_eq!(kelly_fraction(1.1 / 2.1, 1.0 / 1.1, 1.0), 0.0, epsilon = 1e-12);
        assert_eq!(kelly_fraction(0.4, 1.0 / 1.1, 1.0), 0.0);
        assert_eq!(kelly_fraction(f64::NAN, 1.0 / 1.1, 1.0), 0.0);
    }

    #[test]
    fn kelly_scales_with_multiplier() {
        // b = 1, p = 0.6 -> f* = 0.2
        assert_relative_eq!(kelly_fraction(0.6, 1.0, 1.0), 0.2, epsilon = 1e-12);
        assert_relative_eq!(kelly_fraction(0.6, 1.0, 0.01), 0.002, epsilon = 1e-12);
        assert!(kelly_fraction(1.7, 1.0, 1.0) <= 1.0);
    }

    #[test]
    fn win_pays_stake_times_payout_and_loss_costs_the_stake() {
        let config = SimulationConfig::default();
        let mut state = SimulationState::new(100.0);

        // p = 0.7 at -110: f* = (0.7 / 1.1 - 0.3) * 1.1 = 0.37, 1% of that staked
        state.apply(&pick(d(2022, 10, 2), 1, 1), 0.7, &config);
        let win = &state.ledger[0];
        assert_relative_eq!(win.stake, 0.37, epsilon = 1e-12);
        assert_relative_eq!(win.profit, 0.37 / 1.1, epsilon = 1e-12);
        assert_relative_eq!(state.capital, 100.0 + 0.37 / 1.1, epsilon = 1e-12);

        let before = state.capital;
        state.apply(&pick(d(2022, 10, 9), 1, 0), 0.7, &config);
        let loss = &state.ledger[1];
        assert_relative_eq!(loss.stake, 0.0037 * before, epsilon = 1e-12);
        assert_relative_eq!(loss.profit, -loss.stake);
        assert_relative_eq!(state.capital, before - 0.0037 * before, epsilon = 1e-12);
        assert_relative_eq!(state.cumulative_units, 1.0 - 1.1, epsilon = 1e-12);
    }

    #[test]
    fn push_against_over_pick_is_a_loss() {
        let config = SimulationConfig::default();
        let mut state = SimulationState::new(100.0);
        state.apply(&pick(d(2022, 10, 2), 1, 2), 0.7, &config);
        assert!(!state.ledger[0].won);
        assert!(state.capital < 100.0);
        assert_relative_eq!(state.cumulative_units, -1.1);
    }

    #[test]
    fn all_losing_run_never_goes_negative() {
        let config = SimulationConfig {
            kelly_multiplier: 1.0,
            ..SimulationConfig::default()
        };
        let mut state = SimulationState::new(100.0);
        for i in 0..500 {
            state.apply(&pick(d(2022, 10, 2) + chrono::Duration::days(i), 0, 1), 0.99, &config);
            assert!(state.capital >= 0.0);
        }
    }

    #[test]
    fn stats_pick_best_and_worst_days() {
        let config = SimulationConfig::default();
        let picks = vec![
            pick(d(2022, 10, 2), 1, 1),
            pick(d(2022, 10, 2), 0, 0),
            pick(d(2022, 10, 9), 1, 0),
        ];
        let refs: Vec<&ConsensusPick> = picks.iter().collect();
        let report = simulate(&refs, &config);
        let day = &report.stats.units[0];
        assert_eq!(day.period, Period::Day);
        assert_eq!(day.best_label, "2022-10-02");
        assert_relative_eq!(day.best, 2.0);
        assert_eq!(day.worst_label, "2022-10-09");
        assert_relative_eq!(day.worst, -1.1);
        assert_eq!(report.capital_series.len(), 2);
        assert_eq!(report.wins, 2);
    }
}
