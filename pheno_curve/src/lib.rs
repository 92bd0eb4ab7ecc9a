//! Phenology curve extraction and temporal cloud filtering for per-pixel
//! satellite observation time series.
//!
//! Two independent per-pixel algorithms live here:
//!
//! * [`phenology::fit_series`] turns a sparse, partly masked series into an
//!   evenly spaced curve using windowed robust regression, falling back from
//!   quadratic to linear to the window median as data thins out, and replacing
//!   implausible predictions.
//! * [`cloud_filter::cloud_temporal_filter`] masks observations that stray too
//!   far from the line through their nearest unmasked neighbours.
//!
//! [`raster`] maps both over whole scene stacks in parallel.

use thiserror::Error;

pub mod cloud_filter;
pub mod landsat;
pub mod model;
pub mod phenology;
pub mod raster;
pub mod regression;
pub mod series;
pub mod stats;
pub mod time;
pub mod window;

pub use cloud_filter::{cloud_temporal_filter, CloudFilterParams, CloudFilterRecord, Neighbor, NeighborPair};
pub use model::{Model, ModelKind, PredictionRecord, Rejection, ValueBounds};
pub use phenology::{fit_series, fit_target, PhenologyParams};
pub use raster::{cloud_filter_stack, fit_phenology_stack, PhenologyImage, Scene, SceneStack, SeriesProvider};
pub use regression::{fit_robust, ModelOrder, Predictor, RobustFit, RobustOptions};
pub use series::{Observation, TimeSeries};
pub use stats::WindowStats;
pub use time::{TargetSchedule, TimeDomain};
pub use window::{select_window, Window, WindowSpec};

#[derive(Error, Debug)]
pub enum PhenoError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("missing band: {0}")]
    MissingBand(String),
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },
    #[error("scene stack is empty")]
    EmptyStack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PhenoError::ShapeMismatch {
            expected: "3 values".into(),
            found: "2 values".into(),
        };
        assert_eq!(err.to_string(), "shape mismatch: expected 3 values, found 2 values");
        assert_eq!(
            PhenoError::InvalidParameter("num_time_steps must be at least 1".into()).to_string(),
            "invalid parameter: num_time_steps must be at least 1"
        );
    }

    #[test]
    fn test_end_to_end_filter_then_fit() {
        let observations: Vec<Observation> = (0..36)
            .map(|i| {
                let t = 10.0 * i as f64 + 2.0;
                let v = 0.45 + 0.3 * (t / 365.0 * std::f64::consts::TAU - 1.5).sin();
                // every ninth scene is a cloud: a sharp drop in the index.
                // Its clear neighbours then sit about 0.25 above their expectation.
                if i % 9 == 4 {
                    Observation::valid(t, v - 0.5)
                } else {
                    Observation::valid(t, v)
                }
            })
            .collect();
        let series = TimeSeries::from_observations(observations).unwrap();

        let filter = CloudFilterParams {
            threshold_low: -0.15,
            threshold_high: 0.3,
            num_padding_scenes: 2,
            ..CloudFilterParams::default()
        };
        let filtered = cloud_filter::apply_filter(&series, &filter).unwrap();
        for (i, ok) in filtered.validity().iter().enumerate() {
            assert_eq!(*ok, i % 9 != 4, "scene {}", i);
        }

        let params = PhenologyParams {
            wrap_data: true,
            ..PhenologyParams::default()
        };
        let curve = fit_series(&filtered, &params).unwrap();
        assert_eq!(curve.len(), 12);
        assert!(curve.iter().all(|r| r.prediction.is_finite()));
        assert!(curve.iter().all(|r| r.model == ModelKind::Quadratic));
    }
}
