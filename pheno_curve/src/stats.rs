//! Summary statistics of the unmasked values in a window.
//!
//! Computed once per window and handed to the model selector, rather than
//! re-reduced at each stage.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub median: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub stdev: f64,
}

impl WindowStats {
    /// Statistics of an empty sample: every field is NaN (a masked output pixel).
    pub fn empty() -> Self {
        Self {
            count: 0,
            median: f64::NAN,
            mean: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            stdev: f64::NAN,
        }
    }

    pub fn from_values(values: &[f64]) -> Self {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let Some(median) = median(&finite) else {
            return Self::empty();
        };
        let n = finite.len() as f64;
        let mean = finite.iter().sum::<f64>() / n;
        let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            count: finite.len(),
            median,
            mean,
            min,
            max,
            stdev: variance.sqrt(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Median with the even-length case averaged; `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by_key(|v| OrderedFloat(*v));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_population_stdev() {
        let stats = WindowStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(stats.count, 8);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        assert!((stats.stdev - 2.0).abs() < 1e-12);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.median, 4.5);
    }

    #[test]
    fn test_empty_stats_are_nan() {
        let stats = WindowStats::from_values(&[f64::NAN]);
        assert!(stats.is_empty());
        assert!(stats.median.is_nan());
        assert!(stats.stdev.is_nan());
    }

    #[test]
    fn test_single_value_has_zero_spread() {
        let stats = WindowStats::from_values(&[0.42]);
        assert_eq!(stats.median, 0.42);
        assert_eq!(stats.stdev, 0.0);
    }
}
