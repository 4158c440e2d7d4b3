use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, info};

use crate::error::IngestError;

/// PFF grade ranks (home/away for eleven units) plus the posted total.
pub const DEFAULT_FEATURES: [&str; 23] = [
    "home-off-avg-rank",
    "away-off-avg-rank",
    "home-pass-avg-rank",
    "away-pass-avg-rank",
    "home-pblk-avg-rank",
    "away-pblk-avg-rank",
    "home-recv-avg-rank",
    "away-recv-avg-rank",
    "home-run-avg-rank",
    "away-run-avg-rank",
    "home-rblk-avg-rank",
    "away-rblk-avg-rank",
    "home-def-avg-rank",
    "away-def-avg-rank",
    "home-rdef-avg-rank",
    "away-rdef-avg-rank",
    "home-tack-avg-rank",
    "away-tack-avg-rank",
    "home-prsh-avg-rank",
    "away-prsh-avg-rank",
    "home-cov-avg-rank",
    "away-cov-avg-rank",
    "ou_line",
];

const MAX_OUTCOME_LABEL: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSchema {
    pub id_column: String,
    pub date_column: String,
    pub season_column: String,
    pub outcome_column: String,
    pub feature_columns: Vec<String>,
    /// Rows where any of these is missing or not positive are dropped
    /// (opening-week games have no rolling history yet).
    pub games_played_columns: Vec<String>,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            id_column: "game_id".to_string(),
            date_column: "Formatted Date".to_string(),
            season_column: "season".to_string(),
            outcome_column: "total".to_string(),
            feature_columns: DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect(),
            games_played_columns: vec!["home_gp".to_string(), "away_gp".to_string()],
        }
    }
}

impl TableSchema {
    fn required_columns(&self) -> Vec<&str> {
        let mut out = vec![
            self.id_column.as_str(),
            self.date_column.as_str(),
            self.season_column.as_str(),
            self.outcome_column.as_str(),
        ];
        out.extend(self.feature_columns.iter().map(String::as_str));
        out.extend(self.games_played_columns.iter().map(String::as_str));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub date: NaiveDate,
    pub season: i32,
    pub features: Vec<f64>,
    /// 0 = under, 1 = over, 2 = push.
    pub outcome: usize,
}

/// All games sharing one calendar date.
#[derive(Debug, Clone, Copy)]
pub struct GameDay<'a> {
    pub date: NaiveDate,
    pub season: i32,
    pub games: &'a [Game],
}

/// Games sorted by (date, id). Sorting makes every "games before d" query a
/// prefix slice.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    feature_names: Vec<String>,
    games: Vec<Game>,
}

impl FeatureTable {
    pub fn from_games(feature_names: Vec<String>, mut games: Vec<Game>) -> Self {
        games.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Self {
            feature_names,
            games,
        }
    }

    /// Validates `columns` against `schema` and converts `rows`.
    pub fn from_rows(
        schema: &TableSchema,
        columns: &BTreeSet<String>,
        rows: &[Map<String, Value>],
    ) -> Result<Self, IngestError> {
        let missing: Vec<String> = schema
            .required_columns()
            .into_iter()
            .filter(|c| !columns.contains(*c))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::MissingColumns(missing));
        }

        let mut games = Vec::with_capacity(rows.len());
        let mut dropped_incomplete = 0usize;
        let mut dropped_opening_week = 0usize;

        for (idx, row) in rows.iter().enumerate() {
            let played = schema
                .games_played_columns
                .iter()
                .all(|c| row.get(c).and_then(as_f64).is_some_and(|v| v > 0.0));
            if !played {
                dropped_opening_week += 1;
                continue;
            }

            let features: Option<Vec<f64>> = schema
                .feature_columns
                .iter()
                .map(|c| row.get(c).and_then(as_f64))
                .collect();
            let outcome = row
                .get(&schema.outcome_column)
                .and_then(as_f64)
                .filter(|v| v.fract() == 0.0 && *v >= 0.0 && *v <= MAX_OUTCOME_LABEL as f64);
            let (Some(features), Some(outcome)) = (features, outcome) else {
                dropped_incomplete += 1;
                continue;
            };

            let date = row
                .get(&schema.date_column)
                .and_then(as_date)
                .ok_or_else(|| IngestError::Row {
                    row: idx,
                    message: format!("unparseable {}", schema.date_column),
                })?;
            let season = row
                .get(&schema.season_column)
                .and_then(as_f64)
                .ok_or_else(|| IngestError::Row {
                    row: idx,
                    message: format!("unparseable {}", schema.season_column),
                })? as i32;
            let id = row
                .get(&schema.id_column)
                .and_then(as_id)
                .ok_or_else(|| IngestError::Row {
                    row: idx,
                    message: format!("missing {}", schema.id_column),
                })?;

            games.push(Game {
                id,
                date,
                season,
                features,
                outcome: outcome as usize,
            });
        }

        info!(
            kept = games.len(),
            dropped_incomplete, dropped_opening_week, "feature table ingested"
        );
        if games.is_empty() {
            return Err(IngestError::Empty);
        }
        Ok(Self::from_games(schema.feature_columns.clone(), games))
    }

    /// Parses a JSON array of row objects.
    pub fn from_json_str(schema: &TableSchema, raw: &str) -> Result<Self> {
        let rows: Vec<Map<String, Value>> =
            serde_json::from_str(raw).context("parse feature table json")?;
        let columns: BTreeSet<String> = rows.iter().flat_map(|r| r.keys().cloned()).collect();
        Ok(Self::from_rows(schema, &columns, &rows)?)
    }

    pub fn load_json(schema: &TableSchema, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read feature table {}", path.display()))?;
        Self::from_json_str(schema, &raw)
    }

    pub fn load_sqlite(conn: &Connection, table: &str, schema: &TableSchema) -> Result<Self> {
        let sql = format!("SELECT * FROM \"{}\"", table.replace('"', "\"\""));
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("prepare feature table query for {table}"))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let rows = stmt
            .query_map([], |row| {
                let mut out = Map::new();
                for (idx, name) in names.iter().enumerate() {
                    out.insert(name.clone(), sql_value(row.get_ref(idx)?));
                }
                Ok(out)
            })
            .context("query feature table")?;

        let mut decoded = Vec::new();
        for row in rows {
            decoded.push(row.context("decode feature row")?);
        }
        debug!(table, rows = decoded.len(), "loaded sqlite feature rows");

        let columns: BTreeSet<String> = names.into_iter().collect();
        Ok(Self::from_rows(schema, &columns, &decoded)?)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn games(&self) -> &[Game] {
        &self.games
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Every game dated strictly before `date`.
    pub fn games_before(&self, date: NaiveDate) -> &[Game] {
        let end = self.games.partition_point(|g| g.date < date);
        &self.games[..end]
    }

    pub fn game_day(&self, date: NaiveDate) -> Option<GameDay<'_>> {
        let start = self.games.partition_point(|g| g.date < date);
        let end = self.games.partition_point(|g| g.date <= date);
        if start == end {
            return None;
        }
        let games = &self.games[start..end];
        let season = games.iter().map(|g| g.season).max().unwrap_or_default();
        Some(GameDay {
            date,
            season,
            games,
        })
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut out: Vec<NaiveDate> = self.games.iter().map(|g| g.date).collect();
        out.dedup();
        out
    }

    pub fn game_days(&self) -> Vec<GameDay<'_>> {
        self.dates()
            .into_iter()
            .filter_map(|d| self.game_day(d))
            .collect()
    }

    pub fn seasons(&self) -> Vec<i32> {
        let set: BTreeSet<i32> = self.games.iter().map(|g| g.season).collect();
        set.into_iter().collect()
    }

    /// Dates to decide on: everything from the first game of the season at
    /// index `min_training_seasons` onward.
    pub fn decision_dates(&self, min_training_seasons: usize) -> Result<Vec<NaiveDate>, IngestError> {
        let seasons = self.seasons();
        if seasons.len() < min_training_seasons + 1 {
            return Err(IngestError::NotEnoughSeasons {
                needed: min_training_seasons + 1,
                found: seasons.len(),
            });
        }
        let start_season = seasons[min_training_seasons];
        let Some(start) = self
            .games
            .iter()
            .filter(|g| g.season == start_season)
            .map(|g| g.date)
            .min()
        else {
            return Ok(Vec::new());
        };
        Ok(self.dates().into_iter().filter(|d| *d >= start).collect())
    }

    pub fn season_counts(&self) -> BTreeMap<i32, usize> {
        let mut out = BTreeMap::new();
        for g in &self.games {
            *out.entry(g.season).or_insert(0) += 1;
        }
        out
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn as_date(value: &Value) -> Option<NaiveDate> {
    let raw = value.as_str()?.trim();
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::Number(Number::from(i)),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}
