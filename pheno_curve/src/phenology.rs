//! Phenology curve fitting: one robust, outlier-checked prediction per target time.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::model::{predict, ModelKind, PredictionRecord, ValueBounds};
use crate::regression::{fit_robust, ModelOrder, RobustOptions};
use crate::series::TimeSeries;
use crate::stats::WindowStats;
use crate::time::{TargetSchedule, TimeDomain, DAYS_PER_YEAR};
use crate::window::{select_window, WindowSpec};
use crate::PhenoError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhenologyParams {
    pub band_name: String,
    pub domain: TimeDomain,
    pub lookback_width: f64,
    pub lookahead_width: f64,
    /// When set, overrides both widths.
    pub window_radius: Option<f64>,
    pub num_time_steps: usize,
    /// First target, on the `domain` axis.
    pub min_date: f64,
    pub max_date: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub wrap_data: bool,
    pub robust: RobustOptions,
}

impl Default for PhenologyParams {
    fn default() -> Self {
        Self {
            band_name: "NDVI".to_string(),
            domain: TimeDomain::DayOfYear,
            lookback_width: 45.0,
            lookahead_width: 45.0,
            window_radius: None,
            num_time_steps: 12,
            min_date: 0.0,
            max_date: DAYS_PER_YEAR,
            min_value: -1.0,
            max_value: 1.0,
            wrap_data: false,
            robust: RobustOptions::default(),
        }
    }
}

impl PhenologyParams {
    pub fn from_json_str(json: &str) -> Result<Self, PhenoError> {
        serde_json::from_str(json)
            .map_err(|e| PhenoError::InvalidParameter(format!("invalid phenology config: {}", e)))
    }

    pub fn with_window_radius(mut self, radius: f64) -> Self {
        self.window_radius = Some(radius);
        self
    }

    pub fn window_spec(&self) -> WindowSpec {
        match self.window_radius {
            Some(radius) => WindowSpec::symmetric(radius, self.wrap_data),
            None => WindowSpec::new(self.lookback_width, self.lookahead_width, self.wrap_data),
        }
    }

    pub fn bounds(&self) -> ValueBounds {
        ValueBounds {
            min_value: self.min_value,
            max_value: self.max_value,
        }
    }

    pub fn schedule(&self) -> TargetSchedule {
        TargetSchedule::new(self.min_date, self.max_date, self.num_time_steps)
    }

    pub fn target_times(&self) -> Result<Vec<f64>, PhenoError> {
        self.schedule().targets()
    }

    pub fn validate(&self) -> Result<(), PhenoError> {
        if self.band_name.trim().is_empty() {
            return Err(PhenoError::InvalidParameter("band_name must not be empty".into()));
        }
        self.window_spec().validate()?;
        self.bounds().validate()?;
        self.robust.validate()?;
        self.schedule().interval()?;
        Ok(())
    }
}

/// Fit the curve value at a single target time.
pub fn fit_target(series: &TimeSeries, target: f64, params: &PhenologyParams) -> PredictionRecord {
    let window = select_window(series, target, &params.window_spec(), params.domain);
    let (times, values) = window.valid_points();
    let stats = WindowStats::from_values(&values);
    let quadratic = fit_robust(&times, &values, ModelOrder::Quadratic, target, &params.robust);
    let linear = fit_robust(&times, &values, ModelOrder::Linear, target, &params.robust);

    let record = predict(
        &window,
        &stats,
        quadratic.as_ref(),
        linear.as_ref(),
        &params.bounds(),
    );
    if record.model == ModelKind::Fallback && record.unmasked_count > 0 {
        trace!(
            target,
            unmasked = record.unmasked_count,
            "too few samples for a regression, using window median"
        );
    }
    record
}

pub(crate) fn fit_targets(
    series: &TimeSeries,
    targets: &[f64],
    params: &PhenologyParams,
) -> Vec<PredictionRecord> {
    targets
        .iter()
        .map(|&target| fit_target(series, target, params))
        .collect()
}

/// Fit the whole evenly spaced curve for one pixel's series.
pub fn fit_series(series: &TimeSeries, params: &PhenologyParams) -> Result<Vec<PredictionRecord>, PhenoError> {
    params.validate()?;
    let targets = params.target_times()?;
    let records = fit_targets(series, &targets, params);
    debug!(
        observations = series.len(),
        targets = targets.len(),
        masked = records.iter().filter(|r| r.is_masked()).count(),
        "fitted phenology series"
    );
    Ok(records)
}
