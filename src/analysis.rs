use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::Datelike;
use serde::Serialize;

use crate::calibration::{self, ConfidenceBins, Outcome, Tally};
use crate::consensus::ConsensusPick;
use crate::reports::{self, AccuracyRow};

pub const TIERS: [&str; 3] = ["High (55-60%)", "Mid (60-75%)", "Low (45-55%, 75-80%)"];
const OTHER_TIER: &str = "Other";
const TIMINGS: [&str; 2] = ["Early (Sep-Oct)", "Mid/Late (Nov-Jan)"];

/// Reliability tier of an algorithm-score bin.
pub fn tier(score_bin: usize) -> &'static str {
    match score_bin {
        11 => TIERS[0],
        12..=14 => TIERS[1],
        9 | 10 | 15 => TIERS[2],
        _ => OTHER_TIER,
    }
}

pub fn timing(pick: &ConsensusPick) -> &'static str {
    if matches!(pick.date.month(), 9 | 10) {
        TIMINGS[0]
    } else {
        TIMINGS[1]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownRow {
    pub tier: String,
    pub group: String,
    pub count: usize,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub total_picks: usize,
    pub overall_accuracy: Option<f64>,
    pub by_timing: Vec<BreakdownRow>,
    pub by_direction: Vec<BreakdownRow>,
    pub by_confidence: Vec<AccuracyRow>,
    /// Score bin × season cells that have picks.
    pub consistency: Vec<AccuracyRow>,
}

pub fn analyze(picks: &[ConsensusPick], bins: &ConfidenceBins) -> AnalysisReport {
    let mut overall = Tally::default();
    for pick in picks {
        overall.record(pick.is_correct());
    }

    let directions = [Outcome::Under.name(), Outcome::Over.name()];
    AnalysisReport {
        total_picks: picks.len(),
        overall_accuracy: (!overall.is_empty()).then(|| overall.accuracy(0.0)),
        by_timing: breakdown(picks, &TIMINGS, timing),
        by_direction: breakdown(picks, &directions, ConsensusPick::direction),
        by_confidence: reports::by_confidence_bin(picks, bins),
        consistency: reports::by_score_bin_and_season(picks)
            .into_iter()
            .filter(|row| row.count > 0)
            .collect(),
    }
}

// Every (tier, group) pair is listed, empty ones included.
fn breakdown(picks: &[ConsensusPick], groups: &[&'static str], group_of: impl Fn(&ConsensusPick) -> &'static str) -> Vec<BreakdownRow> {
    let mut cells: BTreeMap<(usize, usize), Tally> = BTreeMap::new();
    for (t, _) in TIERS.iter().enumerate() {
        for (g, _) in groups.iter().enumerate() {
            cells.insert((t, g), Tally::default());
        }
    }
    for pick in picks {
        let tier_name = tier(calibration::score_bin(pick.algorithm_score));
        let Some(t) = TIERS.iter().position(|name| *name == tier_name) else {
            continue;
        };
        let Some(g) = groups.iter().position(|name| *name == group_of(pick)) else {
            continue;
        };
        if let Some(cell) = cells.get_mut(&(t, g)) {
            cell.record(pick.is_correct());
        }
    }
    cells
        .into_iter()
        .map(|((t, g), tally)| BreakdownRow {
            tier: TIERS[t].to_string(),
            group: groups[g].to_string(),
            count: tally.total,
            accuracy: (!tally.is_empty()).then(|| tally.accuracy(0.0)),
        })
        .collect()
}

impl AnalysisReport {
    /// Plain-text summary of the breakdowns.
    pub fn render(&self) -> String {
        let rule = "=".repeat(70);
        let thin = "-".repeat(70);
        let mut out = String::new();
        let _ = writeln!(out, "{rule}\nPICK RELIABILITY ANALYSIS\n{rule}\n");
        let _ = writeln!(out, "Total scored picks: {}", self.total_picks);
        let _ = writeln!(out, "Overall accuracy:   {}\n", percent(self.overall_accuracy));

        for (title, rows) in [
            ("1. ACCURACY BY SEASON TIMING", &self.by_timing),
            ("2. ACCURACY BY PREDICTION DIRECTION", &self.by_direction),
        ] {
            let _ = writeln!(out, "{thin}\n{title}\n{thin}\n");
            for tier in TIERS {
                let _ = writeln!(out, "  {tier}:");
                for row in rows.iter().filter(|r| r.tier == tier) {
                    let _ = writeln!(out, "    {}: N={}, Accuracy={}", row.group, row.count, percent(row.accuracy));
                }
                let _ = writeln!(out);
            }
        }

        let _ = writeln!(out, "{thin}\n3. ACCURACY BY MODEL CONFIDENCE BIN\n{thin}\n");
        for row in self.by_confidence.iter().filter(|r| r.count > 0) {
            let _ = writeln!(out, "  {}: N={}, Accuracy={}", row.group, row.count, percent(row.accuracy));
        }

        let _ = writeln!(out, "\n{thin}\n4. SEASON CONSISTENCY\n{thin}\n");
        for row in &self.consistency {
            let season = row.season.map(|s| s.to_string()).unwrap_or_default();
            let _ = writeln!(out, "  {} {}: N={}, Accuracy={}", row.group, season, row.count, percent(row.accuracy));
        }
        out
    }
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.1}%", v * 100.0))
}
