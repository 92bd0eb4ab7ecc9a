//! Model choice by sample count and rejection of implausible predictions.

use serde::{Deserialize, Serialize};

use crate::regression::{Predictor, RobustFit};
use crate::stats::WindowStats;
use crate::window::Window;
use crate::PhenoError;

pub const QUADRATIC_MIN_SAMPLES: usize = 6;
pub const LINEAR_MIN_SAMPLES: usize = 3;
pub const OUTLIER_STDEV_FACTOR: f64 = 1.5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Quadratic,
    Linear,
    Fallback,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Quadratic => "quadratic",
            ModelKind::Linear => "linear",
            ModelKind::Fallback => "median",
        }
    }
}

/// The model used to predict one target. Polynomial coefficients are relative
/// to `origin` (the target time).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Model {
    Quadratic { coeffs: [f64; 3], origin: f64 },
    Linear { coeffs: [f64; 2], origin: f64 },
    Fallback { median: f64 },
}

impl Model {
    pub fn kind(&self) -> ModelKind {
        match self {
            Model::Quadratic { .. } => ModelKind::Quadratic,
            Model::Linear { .. } => ModelKind::Linear,
            Model::Fallback { .. } => ModelKind::Fallback,
        }
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        match self {
            Model::Quadratic { coeffs, origin } => {
                let x = t - origin;
                coeffs[0] + coeffs[1] * x + coeffs[2] * x * x
            }
            Model::Linear { coeffs, origin } => coeffs[0] + coeffs[1] * (t - origin),
            Model::Fallback { median } => *median,
        }
    }

    fn from_fit(fit: &RobustFit) -> Option<Self> {
        let c = fit.centered_coefficients();
        match c.len() {
            3 => Some(Model::Quadratic {
                coeffs: [c[0], c[1], c[2]],
                origin: fit.origin(),
            }),
            2 => Some(Model::Linear {
                coeffs: [c[0], c[1]],
                origin: fit.origin(),
            }),
            _ => None,
        }
    }
}

/// Which side of the acceptable range a prediction fell on, if any.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    Accepted,
    TooHigh,
    TooLow,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Accepted => "accepted",
            Rejection::TooHigh => "high",
            Rejection::TooLow => "low",
        }
    }
}

/// Physically plausible range of the fitted band (NDVI by default).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValueBounds {
    pub min_value: f64,
    pub max_value: f64,
}

impl Default for ValueBounds {
    fn default() -> Self {
        Self {
            min_value: -1.0,
            max_value: 1.0,
        }
    }
}

impl ValueBounds {
    pub fn validate(&self) -> Result<(), PhenoError> {
        if !self.min_value.is_finite() || !self.max_value.is_finite() {
            return Err(PhenoError::InvalidParameter(
                "min_value and max_value must be finite".into(),
            ));
        }
        if self.min_value >= self.max_value {
            return Err(PhenoError::InvalidParameter(format!(
                "min_value ({}) must be below max_value ({})",
                self.min_value, self.max_value
            )));
        }
        Ok(())
    }
}

/// One fitted sample of the phenology curve.
///
/// Serialized field names follow the output band names.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    #[serde(rename = "time")]
    pub target_time: f64,
    pub median: f64,
    #[serde(rename = "prediction_filtered")]
    pub prediction: f64,
    /// Unmasked observations in the window.
    #[serde(rename = "clear_images")]
    pub unmasked_count: usize,
    /// All observations in the window, masked ones included.
    #[serde(rename = "window_size")]
    pub observed_count: usize,
    pub min: f64,
    pub max: f64,
    pub stdev: f64,
    #[serde(rename = "linear_coef")]
    pub linear_constant: f64,
    #[serde(rename = "quadratic_coef")]
    pub quadratic_constant: f64,
    pub model: ModelKind,
    pub rejection: Rejection,
}

impl PredictionRecord {
    /// No unmasked data informed this sample.
    pub fn is_masked(&self) -> bool {
        self.prediction.is_nan()
    }
}

/// Pick the most complex model the sample count supports. A fit that could not
/// be computed drops to the next tier.
pub fn select_model(
    valid_count: usize,
    quadratic: Option<&RobustFit>,
    linear: Option<&RobustFit>,
    median: f64,
) -> Model {
    if valid_count >= QUADRATIC_MIN_SAMPLES {
        if let Some(model) = quadratic.and_then(Model::from_fit) {
            return model;
        }
    }
    if valid_count >= LINEAR_MIN_SAMPLES {
        if let Some(model) = linear.and_then(Model::from_fit) {
            return model;
        }
    }
    Model::Fallback { median }
}

/// Replace predictions outside the physical range, or further than
/// 1.5 standard deviations from the window median, by `median ± stdev`.
pub fn reject_outliers(
    prediction: f64,
    stats: &WindowStats,
    bounds: &ValueBounds,
) -> (f64, Rejection) {
    let spread = OUTLIER_STDEV_FACTOR * stats.stdev;
    let too_high = prediction > bounds.max_value || prediction > stats.median + spread;
    let too_low = prediction < bounds.min_value || prediction < stats.median - spread;
    // the low replacement is applied last, so it wins when both fire
    if too_low {
        (stats.median - stats.stdev, Rejection::TooLow)
    } else if too_high {
        (stats.median + stats.stdev, Rejection::TooHigh)
    } else {
        (prediction, Rejection::Accepted)
    }
}

/// Build the record for one window from its precomputed statistics and fits.
pub fn predict(
    window: &Window,
    stats: &WindowStats,
    quadratic: Option<&RobustFit>,
    linear: Option<&RobustFit>,
    bounds: &ValueBounds,
) -> PredictionRecord {
    let model = select_model(window.valid_count(), quadratic, linear, stats.median);
    let raw = model.evaluate(window.target());
    let (prediction, rejection) = reject_outliers(raw, stats, bounds);
    let constant = |fit: Option<&RobustFit>| {
        fit.and_then(|f| f.coefficient(Predictor::Constant))
            .unwrap_or(f64::NAN)
    };

    PredictionRecord {
        target_time: window.target(),
        median: stats.median,
        prediction,
        unmasked_count: window.valid_count(),
        observed_count: window.observed_count(),
        min: stats.min,
        max: stats.max,
        stdev: stats.stdev,
        linear_constant: constant(linear),
        quadratic_constant: constant(quadratic),
        model: model.kind(),
        rejection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::{fit_robust, ModelOrder, RobustOptions};
    use crate::series::{Observation, TimeSeries};
    use crate::time::TimeDomain;
    use crate::window::{select_window, WindowSpec};

    fn fits(times: &[f64], values: &[f64], origin: f64) -> (Option<RobustFit>, Option<RobustFit>) {
        let opts = RobustOptions::default();
        (
            fit_robust(times, values, ModelOrder::Quadratic, origin, &opts),
            fit_robust(times, values, ModelOrder::Linear, origin, &opts),
        )
    }

    fn window_record(points: &[(f64, f64)], target: f64, spec: WindowSpec, bounds: ValueBounds) -> PredictionRecord {
        let series = TimeSeries::from_observations(
            points.iter().map(|&(t, v)| Observation::valid(t, v)).collect(),
        )
        .unwrap();
        let window = select_window(&series, target, &spec, TimeDomain::DayOfYear);
        let (times, values) = window.valid_points();
        let stats = WindowStats::from_values(&values);
        let (quad, lin) = fits(&times, &values, target);
        predict(&window, &stats, quad.as_ref(), lin.as_ref(), &bounds)
    }

    #[test]
    fn test_tier_thresholds() {
        let times: Vec<f64> = (0..6).map(|i| i as f64).collect();
        let values: Vec<f64> = times.iter().map(|t| 0.3 + 0.01 * t).collect();
        let (quad, lin) = fits(&times, &values, 2.5);
        assert_eq!(select_model(6, quad.as_ref(), lin.as_ref(), 0.3).kind(), ModelKind::Quadratic);
        assert_eq!(select_model(5, quad.as_ref(), lin.as_ref(), 0.3).kind(), ModelKind::Linear);
        assert_eq!(select_model(3, quad.as_ref(), lin.as_ref(), 0.3).kind(), ModelKind::Linear);
        assert_eq!(select_model(2, quad.as_ref(), lin.as_ref(), 0.3), Model::Fallback { median: 0.3 });
    }

    #[test]
    fn test_unusable_quadratic_falls_to_linear() {
        let times: Vec<f64> = (0..6).map(|i| i as f64).collect();
        let values: Vec<f64> = times.iter().map(|t| 0.3 + 0.01 * t).collect();
        let (_, lin) = fits(&times, &values, 0.0);
        assert_eq!(select_model(8, None, lin.as_ref(), 0.3).kind(), ModelKind::Linear);
        assert_eq!(select_model(8, None, None, 0.3).kind(), ModelKind::Fallback);
    }

    #[test]
    fn test_model_evaluation() {
        let quad = Model::Quadratic {
            coeffs: [1.0, 2.0, 3.0],
            origin: 10.0,
        };
        assert_eq!(quad.evaluate(11.0), 6.0);
        let lin = Model::Linear {
            coeffs: [0.5, -0.1],
            origin: 0.0,
        };
        assert!((lin.evaluate(2.0) - 0.3).abs() < 1e-12);
        assert_eq!(Model::Fallback { median: 0.7 }.evaluate(123.0), 0.7);
    }

    #[test]
    fn test_statistical_outlier_replaced_by_median_plus_stdev() {
        let stats = WindowStats::from_values(&[0.4, 0.5, 0.5, 0.6]);
        let (value, rejection) = reject_outliers(0.9, &stats, &ValueBounds::default());
        assert_eq!(rejection, Rejection::TooHigh);
        assert_eq!(value, stats.median + stats.stdev);

        let (value, rejection) = reject_outliers(0.1, &stats, &ValueBounds::default());
        assert_eq!(rejection, Rejection::TooLow);
        assert_eq!(value, stats.median - stats.stdev);

        let (value, rejection) = reject_outliers(0.55, &stats, &ValueBounds::default());
        assert_eq!(rejection, Rejection::Accepted);
        assert_eq!(value, 0.55);
    }

    #[test]
    fn test_extrapolated_prediction_is_clipped() {
        // a linear trend extrapolated well past the data overshoots both checks
        let points = [(0.0, 0.1), (1.0, 0.2), (2.0, 0.3), (3.0, 0.4)];
        let record = window_record(&points, 10.0, WindowSpec::new(20.0, 0.0, false), ValueBounds::default());
        let stats = WindowStats::from_values(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(record.model, ModelKind::Linear);
        assert_eq!(record.rejection, Rejection::TooHigh);
        assert_eq!(record.prediction, stats.median + stats.stdev);
        assert_eq!(record.unmasked_count, 4);
    }

    #[test]
    fn test_physical_bound_applies_without_statistical_outlier() {
        let points = [(0.0, 0.1), (1.0, 0.2), (2.0, 0.3), (3.0, 0.4)];
        let bounds = ValueBounds {
            min_value: -1.0,
            max_value: 0.35,
        };
        let record = window_record(&points, 3.0, WindowSpec::new(20.0, 1.0, false), bounds);
        let stats = WindowStats::from_values(&[0.1, 0.2, 0.3, 0.4]);
        // 0.4 is inside median + 1.5 * stdev but above max_value
        assert!(0.4 < stats.median + OUTLIER_STDEV_FACTOR * stats.stdev);
        assert_eq!(record.rejection, Rejection::TooHigh);
        assert_eq!(record.prediction, stats.median + stats.stdev);
    }

    #[test]
    fn test_physical_lower_bound() {
        let points = [(0.0, 0.4), (1.0, 0.3), (2.0, 0.2), (3.0, 0.1)];
        let bounds = ValueBounds {
            min_value: 0.15,
            max_value: 1.0,
        };
        let record = window_record(&points, 3.0, WindowSpec::new(20.0, 1.0, false), bounds);
        let stats = WindowStats::from_values(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(record.rejection, Rejection::TooLow);
        assert_eq!(record.prediction, stats.median - stats.stdev);
    }

    #[test]
    fn test_empty_window_produces_masked_record() {
        let record = window_record(&[(100.0, 0.5)], 10.0, WindowSpec::symmetric(5.0, false), ValueBounds::default());
        assert!(record.is_masked());
        assert_eq!(record.observed_count, 0);
        assert_eq!(record.unmasked_count, 0);
        assert_eq!(record.model, ModelKind::Fallback);
        assert!(record.linear_constant.is_nan());
    }

    #[test]
    fn test_bounds_validation() {
        assert!(ValueBounds::default().validate().is_ok());
        let inverted = ValueBounds {
            min_value: 1.0,
            max_value: -1.0,
        };
        assert!(inverted.validate().is_err());
    }
}
