//! Selection of the observations that inform a prediction at one target time.

use serde::{Deserialize, Serialize};

use crate::series::{Observation, TimeSeries};
use crate::time::TimeDomain;
use crate::PhenoError;

/// Extent of the temporal neighbourhood around a target.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindowSpec {
    pub lookback: f64,
    pub lookahead: f64,
    /// Fold in observations from the opposite end of the target's period.
    pub wrap: bool,
}

impl WindowSpec {
    pub fn new(lookback: f64, lookahead: f64, wrap: bool) -> Self {
        Self {
            lookback,
            lookahead,
            wrap,
        }
    }

    pub fn symmetric(radius: f64, wrap: bool) -> Self {
        Self::new(radius, radius, wrap)
    }

    pub fn validate(&self) -> Result<(), PhenoError> {
        if !self.lookback.is_finite() || self.lookback < 0.0 {
            return Err(PhenoError::InvalidParameter(format!(
                "lookback width must be a non-negative number (got {})",
                self.lookback
            )));
        }
        if !self.lookahead.is_finite() || self.lookahead < 0.0 {
            return Err(PhenoError::InvalidParameter(format!(
                "lookahead width must be a non-negative number (got {})",
                self.lookahead
            )));
        }
        if self.lookback + self.lookahead <= 0.0 {
            return Err(PhenoError::InvalidParameter(
                "window must have a positive width".into(),
            ));
        }
        Ok(())
    }

    /// Half-open bounds `[target - lookback, target + lookahead)`.
    pub fn bounds(&self, target: f64) -> (f64, f64) {
        (target - self.lookback, target + self.lookahead)
    }
}

/// Observations around one target, possibly recentered across a period boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct Window {
    target: f64,
    entries: Vec<Observation>,
    padded: bool,
}

impl Window {
    pub fn target(&self) -> f64 {
        self.target
    }

    /// All entries, masked ones and the sentinel included.
    pub fn entries(&self) -> &[Observation] {
        &self.entries
    }

    /// True when nothing matched and a sentinel was injected.
    pub fn is_padded(&self) -> bool {
        self.padded
    }

    /// Number of real observations (masked or not) that fell in the window.
    pub fn observed_count(&self) -> usize {
        if self.padded {
            0
        } else {
            self.entries.len()
        }
    }

    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|o| o.valid).count()
    }

    pub fn valid_values(&self) -> Vec<f64> {
        self.entries
            .iter()
            .filter(|o| o.valid)
            .map(|o| o.value)
            .collect()
    }

    /// Regression inputs: `(times, values)` of the unmasked entries.
    pub fn valid_points(&self) -> (Vec<f64>, Vec<f64>) {
        self.entries
            .iter()
            .filter(|o| o.valid)
            .map(|o| (o.timestamp, o.value))
            .unzip()
    }
}

/// Gather the window for `target`.
///
/// With `spec.wrap`, observations lying in the target's period are also
/// considered one period earlier and one period later, so that a target near
/// a period boundary sees data from the opposite end of that period.
pub fn select_window(
    series: &TimeSeries,
    target: f64,
    spec: &WindowSpec,
    domain: TimeDomain,
) -> Window {
    let (lo, hi) = spec.bounds(target);
    let contains = |t: f64| t >= lo && t < hi;

    let mut entries: Vec<Observation> = series.iter().filter(|o| contains(o.timestamp)).collect();

    if spec.wrap {
        let shift = domain.period();
        let (period_start, period_end) = domain.period_bounds(target);
        let in_period = |t: f64| t >= period_start && t < period_end;
        entries.extend(
            series
                .iter()
                .filter(|o| in_period(o.timestamp) && contains(o.timestamp - shift))
                .map(|o| o.shifted(-shift)),
        );
        entries.extend(
            series
                .iter()
                .filter(|o| in_period(o.timestamp) && contains(o.timestamp + shift))
                .map(|o| o.shifted(shift)),
        );
    }

    let padded = entries.is_empty();
    if padded {
        entries.push(Observation::sentinel(target));
    }

    Window {
        target,
        entries,
        padded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DAYS_PER_YEAR;

    fn doy_series(days: &[f64]) -> TimeSeries {
        TimeSeries::from_observations(days.iter().map(|&d| Observation::valid(d, 0.5)).collect())
            .unwrap()
    }

    #[test]
    fn test_window_is_half_open() {
        let series = doy_series(&[90.0, 100.0, 110.0]);
        let window = select_window(&series, 100.0, &WindowSpec::new(10.0, 10.0, false), TimeDomain::DayOfYear);
        let times: Vec<f64> = window.entries().iter().map(|o| o.timestamp).collect();
        assert_eq!(times, vec![90.0, 100.0]);
        assert_eq!(window.observed_count(), 2);
    }

    #[test]
    fn test_masked_entries_are_kept_but_not_counted_valid() {
        let series = TimeSeries::from_observations(vec![
            Observation::valid(99.0, 0.3),
            Observation::masked(101.0, 0.9),
        ])
        .unwrap();
        let window = select_window(&series, 100.0, &WindowSpec::symmetric(5.0, false), TimeDomain::DayOfYear);
        assert_eq!(window.observed_count(), 2);
        assert_eq!(window.valid_count(), 1);
        assert_eq!(window.valid_values(), vec![0.3]);
    }

    #[test]
    fn test_empty_window_gets_sentinel() {
        let series = doy_series(&[10.0, 20.0]);
        let window = select_window(&series, 200.0, &WindowSpec::symmetric(15.0, false), TimeDomain::DayOfYear);
        assert!(window.is_padded());
        assert_eq!(window.entries().len(), 1);
        assert_eq!(window.entries()[0], Observation::sentinel(200.0));
        assert_eq!(window.observed_count(), 0);
        assert_eq!(window.valid_count(), 0);
    }

    #[test]
    fn test_wrap_near_year_end_includes_early_observations() {
        let series = doy_series(&[3.0, 7.0, 180.0, 355.0, 360.0]);
        let spec = WindowSpec::symmetric(15.0, true);
        let wrapped = select_window(&series, 358.0, &spec, TimeDomain::DayOfYear);
        let plain = select_window(&series, 358.0, &WindowSpec::symmetric(15.0, false), TimeDomain::DayOfYear);
        assert_eq!(plain.observed_count(), 2);
        assert_eq!(wrapped.observed_count(), 4);
        let mut times: Vec<f64> = wrapped.entries().iter().map(|o| o.timestamp).collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(times, vec![355.0, 360.0, 368.0, 372.0]);
    }

    #[test]
    fn test_wrap_near_year_start_includes_late_observations() {
        let series = doy_series(&[2.0, 180.0, 350.0, 362.0]);
        let wrapped = select_window(&series, 5.0, &WindowSpec::symmetric(20.0, true), TimeDomain::DayOfYear);
        let plain = select_window(&series, 5.0, &WindowSpec::symmetric(20.0, false), TimeDomain::DayOfYear);
        assert_eq!(plain.observed_count(), 1);
        assert_eq!(wrapped.observed_count(), 3);
        assert!(wrapped.entries().iter().any(|o| (o.timestamp + 3.0).abs() < 1e-9));
        assert!(wrapped.entries().iter().any(|o| (o.timestamp + 15.0).abs() < 1e-9));
    }

    #[test]
    fn test_absolute_wrap_stays_within_target_year() {
        let year = 50.0 * DAYS_PER_YEAR;
        // Two early-January scenes: one in the target's year, one in the following year.
        let series = doy_series(&[year + 5.0, year + 300.0, year + 360.0, year + DAYS_PER_YEAR + 4.0]);
        let target = year + 362.0;
        let window = select_window(&series, target, &WindowSpec::symmetric(10.0, true), TimeDomain::Absolute);
        let times: Vec<f64> = window.entries().iter().map(|o| o.timestamp).collect();
        // direct: year+360 and next-year+4 (which lies within lookahead); wrapped: year+5 moved forward
        assert_eq!(times.len(), 3);
        assert!(times.iter().any(|&t| (t - (year + 5.0 + DAYS_PER_YEAR)).abs() < 1e-9));
    }

    #[test]
    fn test_spec_validation() {
        assert!(WindowSpec::new(-1.0, 5.0, false).validate().is_err());
        assert!(WindowSpec::new(0.0, 0.0, false).validate().is_err());
        assert!(WindowSpec::new(f64::NAN, 5.0, false).validate().is_err());
        assert!(WindowSpec::symmetric(30.0, true).validate().is_ok());
    }
}
