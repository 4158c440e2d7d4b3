use chrono::NaiveDate;

const SEASON_START_MONTH: u32 = 9;
const SEASON_START_DAY: u32 = 1;
const CUTOFF_MONTH: u32 = 1;
const CUTOFF_DAY: u32 = 15;

/// Sep 1 of `season` and Jan 15 of the following year.
pub fn season_window(season: i32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(season, SEASON_START_MONTH, SEASON_START_DAY)?;
    let cutoff = NaiveDate::from_ymd_opt(season + 1, CUTOFF_MONTH, CUTOFF_DAY)?;
    Some((start, cutoff))
}

/// Weight of the current season (α) on `date`. Early dates lean on last
/// season's calibration, late dates on the current season's.
pub fn season_progress(date: NaiveDate, season: i32) -> f64 {
    let Some((start, cutoff)) = season_window(season) else {
        return 1.0;
    };
    let total = (cutoff - start).num_days() as f64;
    let elapsed = (date - start).num_days() as f64;
    (elapsed / total).clamp(0.0, 1.0)
}
