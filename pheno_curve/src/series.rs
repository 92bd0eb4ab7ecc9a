//! Per-pixel observation series.

use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::PhenoError;

/// One dated scalar sample of a band at one pixel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub timestamp: f64,
    pub value: f64,
    pub valid: bool,
}

impl Observation {
    pub fn new(timestamp: f64, value: f64, valid: bool) -> Self {
        Self {
            timestamp,
            value,
            valid,
        }
    }

    pub fn valid(timestamp: f64, value: f64) -> Self {
        Self::new(timestamp, value, true)
    }

    pub fn masked(timestamp: f64, value: f64) -> Self {
        Self::new(timestamp, value, false)
    }

    /// Zero-valued masked placeholder carrying the band schema.
    pub fn sentinel(timestamp: f64) -> Self {
        Self::new(timestamp, 0.0, false)
    }

    /// Same observation moved along the time axis by `offset`.
    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            timestamp: self.timestamp + offset,
            ..*self
        }
    }

    pub fn with_valid(&self, valid: bool) -> Self {
        Self { valid, ..*self }
    }
}

/// Time-ordered observations for one pixel and band.
///
/// Masked entries are retained so that index positions line up with the
/// scene stack they were extracted from.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    times: Array1<f64>,
    values: Array1<f64>,
    valid: Vec<bool>,
}

impl TimeSeries {
    /// Build a series from unordered observations. Sorting is stable, so
    /// observations sharing a timestamp keep their input order. Non-finite
    /// values are treated as masked.
    pub fn from_observations(mut observations: Vec<Observation>) -> Result<Self, PhenoError> {
        if let Some(bad) = observations.iter().find(|o| !o.timestamp.is_finite()) {
            return Err(PhenoError::InvalidParameter(format!(
                "non-finite observation timestamp {}",
                bad.timestamp
            )));
        }
        observations.sort_by_key(|o| OrderedFloat(o.timestamp));
        let mut times = Vec::with_capacity(observations.len());
        let mut values = Vec::with_capacity(observations.len());
        let mut valid = Vec::with_capacity(observations.len());
        for obs in observations {
            times.push(obs.timestamp);
            values.push(obs.value);
            valid.push(obs.valid && obs.value.is_finite());
        }
        Ok(Self {
            times: Array1::from_vec(times),
            values: Array1::from_vec(values),
            valid,
        })
    }

    /// Build a series from parallel columns that are already sorted by time.
    pub fn from_columns(
        times: Vec<f64>,
        values: Vec<f64>,
        valid: Vec<bool>,
    ) -> Result<Self, PhenoError> {
        if values.len() != times.len() {
            return Err(PhenoError::ShapeMismatch {
                expected: format!("{} values", times.len()),
                found: format!("{} values", values.len()),
            });
        }
        if valid.len() != times.len() {
            return Err(PhenoError::ShapeMismatch {
                expected: format!("{} validity flags", times.len()),
                found: format!("{} validity flags", valid.len()),
            });
        }
        if times.iter().any(|t| !t.is_finite()) || times.windows(2).any(|w| w[0] > w[1]) {
            return Err(PhenoError::InvalidParameter(
                "series timestamps must be finite and non-decreasing".into(),
            ));
        }
        let valid = valid
            .into_iter()
            .zip(values.iter())
            .map(|(flag, v)| flag && v.is_finite())
            .collect();
        Ok(Self {
            times: Array1::from_vec(times),
            values: Array1::from_vec(values),
            valid,
        })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Observation> {
        if index >= self.len() {
            return None;
        }
        Some(Observation::new(
            self.times[index],
            self.values[index],
            self.valid[index],
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = Observation> + '_ {
        self.times
            .iter()
            .zip(self.values.iter())
            .zip(self.valid.iter())
            .map(|((&t, &v), &ok)| Observation::new(t, v, ok))
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.iter().collect()
    }

    pub fn times(&self) -> &Array1<f64> {
        &self.times
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn validity(&self) -> &[bool] {
        &self.valid
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&ok| ok).count()
    }

    pub fn span(&self) -> Option<(f64, f64)> {
        match (self.times.first(), self.times.last()) {
            (Some(&start), Some(&end)) => Some((start, end)),
            _ => None,
        }
    }

    /// Copy of this series with a replacement validity mask.
    pub fn with_validity(&self, valid: Vec<bool>) -> Result<Self, PhenoError> {
        Self::from_columns(self.times.to_vec(), self.values.to_vec(), valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_observations_sorts_by_time() {
        let series = TimeSeries::from_observations(vec![
            Observation::valid(10.0, 3.0),
            Observation::masked(0.0, 1.0),
            Observation::valid(5.0, 2.0),
        ])
        .unwrap();
        let times: Vec<f64> = series.iter().map(|o| o.timestamp).collect();
        assert_eq!(times, vec![0.0, 5.0, 10.0]);
        assert_eq!(series.valid_count(), 2);
        assert!(!series.get(0).unwrap().valid);
    }

    #[test]
    fn test_non_finite_values_are_masked() {
        let series = TimeSeries::from_observations(vec![
            Observation::valid(1.0, f64::NAN),
            Observation::valid(2.0, 0.4),
        ])
        .unwrap();
        assert_eq!(series.valid_count(), 1);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_rejects_non_finite_timestamp() {
        let err = TimeSeries::from_observations(vec![Observation::valid(f64::NAN, 1.0)]);
        assert!(matches!(err, Err(PhenoError::InvalidParameter(_))));
    }

    #[test]
    fn test_from_columns_checks_lengths_and_order() {
        assert!(TimeSeries::from_columns(vec![0.0, 1.0], vec![1.0], vec![true, true]).is_err());
        assert!(TimeSeries::from_columns(vec![2.0, 1.0], vec![1.0, 1.0], vec![true, true]).is_err());
        let ok = TimeSeries::from_columns(vec![1.0, 1.0], vec![1.0, 2.0], vec![true, false]).unwrap();
        assert_eq!(ok.span(), Some((1.0, 1.0)));
    }

    #[test]
    fn test_from_columns_rejects_non_finite_timestamps() {
        for times in [vec![f64::NAN], vec![0.0, f64::INFINITY], vec![f64::NEG_INFINITY, 0.0]] {
            let n = times.len();
            let err = TimeSeries::from_columns(times, vec![1.0; n], vec![true; n]);
            assert!(matches!(err, Err(PhenoError::InvalidParameter(_))));
        }
    }
}
