use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};
use serde::Serialize;
use tracing::info;

use crate::analysis::{AnalysisReport, BreakdownRow};
use crate::backtest::BacktestReport;
use crate::consensus::ConsensusPick;
use crate::reports::AccuracyRow;
use crate::simulation::{PerformanceStats, SimulationReport};
use crate::training::TrainingReport;

pub const PICKS_FILE: &str = "picks.json";

/// Files written by one export.
#[derive(Debug, Default)]
pub struct ExportSummary {
    pub files: Vec<PathBuf>,
}

impl ExportSummary {
    fn push(&mut self, path: PathBuf) {
        info!(path = %path.display(), "saved");
        self.files.push(path);
    }
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value).context("serialize json")?;
    fs::write(path, raw).with_context(|| format!("write {}", path.display()))
}

pub fn read_picks(path: &Path) -> Result<Vec<ConsensusPick>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse picks from {}", path.display()))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

pub fn export_training(dir: &Path, report: &TrainingReport) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();

    let picks_path = dir.join(PICKS_FILE);
    write_json(&picks_path, &report.picks)?;
    summary.push(picks_path);

    let report_path = dir.join("training_report.json");
    write_json(&report_path, report)?;
    summary.push(report_path);

    let mut sheets: Vec<(&str, Vec<Vec<String>>)> = vec![
        ("Picks", pick_rows(&report.picks)),
        ("ByConfidence", accuracy_rows(&report.by_confidence)),
        ("ByScore", accuracy_rows(&report.by_score)),
        ("ByScoreSeason", accuracy_rows(&report.by_score_season)),
        ("BySeason", accuracy_rows(&report.by_season)),
    ];
    if let Some(sim) = &report.simulation {
        let stats_path = dir.join("performance_statistics.txt");
        write_text(&stats_path, &render_stats(&sim.stats))?;
        summary.push(stats_path);

        sheets.push(("Simulation", ledger_rows(sim)));
        sheets.push(("Performance", stats_rows(&sim.stats)));
        sheets.push(("Capital", capital_rows(sim)));
    }

    let book_path = dir.join("training.xlsx");
    save_workbook(&book_path, &sheets)?;
    summary.push(book_path);
    Ok(summary)
}

pub fn export_backtest(dir: &Path, report: &BacktestReport) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();
    let report_path = dir.join("backtest_report.json");
    write_json(&report_path, report)?;
    summary.push(report_path);

    let sheets = vec![
        ("ModelBySeason", accuracy_rows(&report.model_by_season)),
        ("ModelByConfidence", accuracy_rows(&report.model_by_confidence)),
        ("ModelByConfSeason", accuracy_rows(&report.model_by_confidence_season)),
        ("PicksBySeason", accuracy_rows(&report.pick_by_season)),
        ("PicksByConfidence", accuracy_rows(&report.pick_by_confidence)),
        ("PicksByConfSeason", accuracy_rows(&report.pick_by_confidence_season)),
        ("PicksByScore", accuracy_rows(&report.pick_by_score)),
    ];
    let book_path = dir.join("backtest.xlsx");
    save_workbook(&book_path, &sheets)?;
    summary.push(book_path);
    Ok(summary)
}

pub fn export_analysis(dir: &Path, report: &AnalysisReport) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();
    let report_path = dir.join("analysis.json");
    write_json(&report_path, report)?;
    summary.push(report_path);

    let text_path = dir.join("analysis_report.txt");
    write_text(&text_path, &report.render())?;
    summary.push(text_path);

    let sheets = vec![
        ("ByTiming", breakdown_rows(&report.by_timing)),
        ("ByDirection", breakdown_rows(&report.by_direction)),
        ("ByConfidence", accuracy_rows(&report.by_confidence)),
        ("Consistency", accuracy_rows(&report.consistency)),
    ];
    let book_path = dir.join("analysis.xlsx");
    save_workbook(&book_path, &sheets)?;
    summary.push(book_path);
    Ok(summary)
}

fn save_workbook(path: &Path, sheets: &[(&str, Vec<Vec<String>>)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut workbook = Workbook::new();
    for (name, rows) in sheets {
        let sheet = workbook.add_worksheet();
        sheet.set_name(*name)?;
        write_rows(sheet, rows)?;
    }
    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))
}

fn header(cols: &[&str]) -> Vec<String> {
    cols.iter().map(|c| c.to_string()).collect()
}

fn opt_to_string<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn fixed(value: f64) -> String {
    format!("{value:.4}")
}

fn accuracy_rows(rows: &[AccuracyRow]) -> Vec<Vec<String>> {
    let mut out = vec![header(&["Group", "Season", "Count", "Accuracy", "Mean Score"])];
    out.extend(rows.iter().map(|r| {
        vec![
            r.group.clone(),
            opt_to_string(r.season),
            r.count.to_string(),
            opt_to_string(r.accuracy.map(fixed)),
            opt_to_string(r.mean_score.map(fixed)),
        ]
    }));
    out
}

fn breakdown_rows(rows: &[BreakdownRow]) -> Vec<Vec<String>> {
    let mut out = vec![header(&["Tier", "Group", "Count", "Accuracy"])];
    out.extend(rows.iter().map(|r| {
        vec![
            r.tier.clone(),
            r.group.clone(),
            r.count.to_string(),
            opt_to_string(r.accuracy.map(fixed)),
        ]
    }));
    out
}

fn pick_rows(picks: &[ConsensusPick]) -> Vec<Vec<String>> {
    let mut out = vec![header(&[
        "Date",
        "Season",
        "Game",
        "Predicted",
        "Actual",
        "Correct",
        "Algorithm Score",
        "Alpha",
        "Lead Confidence",
        "Models",
    ])];
    out.extend(picks.iter().map(|p| {
        let seeds = p
            .members
            .iter()
            .map(|m| m.seed.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            p.date.to_string(),
            p.season.to_string(),
            p.game_id.clone(),
            p.direction().to_string(),
            p.actual.to_string(),
            u8::from(p.is_correct()).to_string(),
            fixed(p.algorithm_score),
            fixed(p.alpha),
            fixed(p.lead_confidence()),
            seeds,
        ]
    }));
    out
}

fn ledger_rows(sim: &SimulationReport) -> Vec<Vec<String>> {
    let mut out = vec![header(&[
        "Date",
        "Game",
        "Algorithm Score",
        "Stake",
        "Won",
        "Profit ($)",
        "Capital",
        "Units",
        "Cumulative Units",
    ])];
    out.extend(sim.ledger.iter().map(|b| {
        vec![
            b.date.to_string(),
            b.game_id.clone(),
            fixed(b.algorithm_score),
            fixed(b.stake),
            u8::from(b.won).to_string(),
            fixed(b.profit),
            fixed(b.capital),
            fixed(b.units),
            fixed(b.cumulative_units),
        ]
    }));
    out
}

fn capital_rows(sim: &SimulationReport) -> Vec<Vec<String>> {
    let mut out = vec![header(&["Date", "Capital"])];
    out.extend(sim.capital_series.iter().map(|(d, c)| vec![d.to_string(), fixed(*c)]));
    out
}

fn stats_rows(stats: &PerformanceStats) -> Vec<Vec<String>> {
    let mut out = vec![header(&["Measure", "Period", "Best", "Best Value", "Worst", "Worst Value"])];
    for (measure, rows) in [("Units", &stats.units), ("Dollars", &stats.dollars)] {
        out.extend(rows.iter().map(|e| {
            vec![
                measure.to_string(),
                e.period.name().to_string(),
                e.best_label.clone(),
                fixed(e.best),
                e.worst_label.clone(),
                fixed(e.worst),
            ]
        }));
    }
    out
}

pub fn render_stats(stats: &PerformanceStats) -> String {
    let mut out = String::from("Performance Statistics (Units):\n");
    for e in &stats.units {
        let name = e.period.name();
        let _ = writeln!(out, "  Best {name}: {} with profit {:.2} units", e.best_label, e.best);
        let _ = writeln!(out, "  Worst {name}: {} with profit {:.2} units", e.worst_label, e.worst);
    }
    out.push_str("\nPerformance Statistics ($):\n");
    for e in &stats.dollars {
        let name = e.period.name();
        let _ = writeln!(out, "  Best {name}: {} with profit ${:.2}", e.best_label, e.best);
        let _ = writeln!(out, "  Worst {name}: {} with profit ${:.2}", e.worst_label, e.worst);
    }
    out
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<String>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            worksheet
                .write_string(row_idx as u32, col_idx as u16, value)
                .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}
