// Time axis conventions shared by the window fitter and the cloud filter.
// Absolute timestamps are days since 1970-01-01 with 365.25-day years; day-of-year
// timestamps are offsets into a single 365-day cycle.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::PhenoError;

pub const DAYS_PER_YEAR: f64 = 365.25;
pub const DOY_PERIOD: f64 = 365.0;
pub const EPOCH_YEAR: f64 = 1970.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeDomain {
    Absolute,
    DayOfYear,
}

impl Default for TimeDomain {
    fn default() -> Self {
        TimeDomain::DayOfYear
    }
}

impl TimeDomain {
    /// Shift applied when an observation is recentered into an adjacent period.
    pub fn period(&self) -> f64 {
        match self {
            TimeDomain::Absolute => DAYS_PER_YEAR,
            TimeDomain::DayOfYear => DOY_PERIOD,
        }
    }

    /// Half-open span of the period containing `t`. A day-of-year series is a
    /// single period, so every timestamp shares the same (unbounded) span.
    pub fn period_bounds(&self, t: f64) -> (f64, f64) {
        match self {
            TimeDomain::Absolute => {
                let start = (t / DAYS_PER_YEAR).floor() * DAYS_PER_YEAR;
                (start, start + DAYS_PER_YEAR)
            }
            TimeDomain::DayOfYear => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    /// Time position reported for a missing predecessor.
    pub fn sentinel_start(&self) -> f64 {
        0.0
    }

    /// Time position reported for a missing successor.
    pub fn sentinel_end(&self) -> f64 {
        self.period()
    }

    /// Convert a calendar date onto this axis.
    pub fn from_date(&self, date: NaiveDate) -> f64 {
        let days = days_since_epoch(date);
        match self {
            TimeDomain::Absolute => days,
            TimeDomain::DayOfYear => day_of_year(days),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TimeDomain::Absolute => "absolute",
            TimeDomain::DayOfYear => "day_of_year",
        }
    }
}

pub fn days_since_epoch(date: NaiveDate) -> f64 {
    date.signed_duration_since(NaiveDate::default()).num_days() as f64
}

/// Calendar date containing the absolute day `days`.
pub fn date_from_days(days: f64) -> Option<NaiveDate> {
    if !days.is_finite() {
        return None;
    }
    let whole = days.floor();
    let epoch = NaiveDate::default();
    if whole >= 0.0 {
        epoch.checked_add_days(Days::new(whole as u64))
    } else {
        epoch.checked_sub_days(Days::new((-whole) as u64))
    }
}

/// Day within the 365.25-day year containing `days`.
pub fn day_of_year(days: f64) -> f64 {
    days - (days / DAYS_PER_YEAR).floor() * DAYS_PER_YEAR
}

pub fn decimal_year(days: f64) -> f64 {
    days / DAYS_PER_YEAR + EPOCH_YEAR
}

pub fn parse_date(input: &str) -> Result<NaiveDate, PhenoError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| PhenoError::InvalidParameter(format!("invalid date '{}': {}", input, e)))
}

/// Evenly spaced output timestamps over `[start, end]`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TargetSchedule {
    pub start: f64,
    pub end: f64,
    pub num_time_steps: usize,
}

impl TargetSchedule {
    pub fn new(start: f64, end: f64, num_time_steps: usize) -> Self {
        Self {
            start,
            end,
            num_time_steps,
        }
    }

    /// Whole-day spacing between targets.
    pub fn interval(&self) -> Result<f64, PhenoError> {
        if self.num_time_steps == 0 {
            return Err(PhenoError::InvalidParameter(
                "num_time_steps must be at least 1".into(),
            ));
        }
        if !self.start.is_finite() || !self.end.is_finite() || self.end <= self.start {
            return Err(PhenoError::InvalidParameter(format!(
                "target range must be increasing (min_date {} / max_date {})",
                self.start, self.end
            )));
        }
        let interval = ((self.end - self.start) / self.num_time_steps as f64).floor();
        if interval < 1.0 {
            return Err(PhenoError::InvalidParameter(format!(
                "range of {:.2} days is too short for {} time steps",
                self.end - self.start,
                self.num_time_steps
            )));
        }
        Ok(interval)
    }

    pub fn targets(&self) -> Result<Vec<f64>, PhenoError> {
        let interval = self.interval()?;
        Ok((0..self.num_time_steps)
            .map(|i| self.start + interval * i as f64)
            .collect())
    }
}
