//! Temporal cloud filter.
//!
//! Each observation is compared with the straight line through its nearest
//! unmasked predecessor and successor. Observations whose residual leaves
//! `(threshold_low, threshold_high)` are masked. Neighbours are found with a
//! forward and a backward carry scan over a series that has optionally been
//! padded with scenes folded in from the opposite end of the period.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::series::{Observation, TimeSeries};
use crate::time::TimeDomain;
use crate::PhenoError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudFilterParams {
    pub band_name: String,
    pub threshold_low: f64,
    pub threshold_high: f64,
    /// Scenes folded from each end of the series onto the other.
    pub num_padding_scenes: usize,
    pub domain: TimeDomain,
}

impl Default for CloudFilterParams {
    fn default() -> Self {
        Self {
            band_name: "NDVI".to_string(),
            threshold_low: -0.1,
            threshold_high: 0.1,
            num_padding_scenes: 0,
            domain: TimeDomain::DayOfYear,
        }
    }
}

impl CloudFilterParams {
    pub fn from_json_str(json: &str) -> Result<Self, PhenoError> {
        serde_json::from_str(json)
            .map_err(|e| PhenoError::InvalidParameter(format!("invalid cloud filter config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), PhenoError> {
        if self.band_name.trim().is_empty() {
            return Err(PhenoError::InvalidParameter("band_name must not be empty".into()));
        }
        if !self.threshold_low.is_finite() || !self.threshold_high.is_finite() {
            return Err(PhenoError::InvalidParameter("thresholds must be finite".into()));
        }
        if self.threshold_low >= self.threshold_high {
            return Err(PhenoError::InvalidParameter(format!(
                "threshold_low ({}) must be below threshold_high ({})",
                self.threshold_low, self.threshold_high
            )));
        }
        Ok(())
    }

    /// Whether a residual is inside the open acceptance band.
    pub fn allows(&self, diff: f64) -> bool {
        self.threshold_low < diff && diff < self.threshold_high
    }
}

/// Nearest unmasked observation on one side, or the placeholder used when none exists.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Neighbor {
    Observed { time: f64, value: f64 },
    Sentinel { time: f64 },
}

impl Neighbor {
    pub fn time(&self) -> f64 {
        match self {
            Neighbor::Observed { time, .. } | Neighbor::Sentinel { time } => *time,
        }
    }

    /// Sentinels carry a zero value.
    pub fn value(&self) -> f64 {
        match self {
            Neighbor::Observed { value, .. } => *value,
            Neighbor::Sentinel { .. } => 0.0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Neighbor::Sentinel { .. })
    }
}

impl From<&Observation> for Neighbor {
    fn from(obs: &Observation) -> Self {
        Neighbor::Observed {
            time: obs.timestamp,
            value: obs.value,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct NeighborPair {
    pub previous: Neighbor,
    pub next: Neighbor,
}

impl NeighborPair {
    /// Straight-line expectation at `t`. `None` when either side is a sentinel
    /// or both neighbours share a time position.
    pub fn interpolate(&self, t: f64) -> Option<f64> {
        match (self.previous, self.next) {
            (
                Neighbor::Observed { time: t0, value: v0 },
                Neighbor::Observed { time: t1, value: v1 },
            ) if t1 != t0 => {
                let slope = (v1 - v0) / (t1 - t0);
                Some(v0 + (t - t0) * slope)
            }
            _ => None,
        }
    }
}

/// Filter output for one scene of the input series.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct CloudFilterRecord {
    /// The input observation with its validity updated.
    #[serde(flatten)]
    pub observation: Observation,
    /// Valid on input, masked by this filter.
    pub rejected: bool,
    pub reg_diff: f64,
    pub reg_expected: f64,
    pub previous: f64,
    #[serde(rename = "previous_DOY")]
    pub previous_doy: f64,
    pub next: f64,
    #[serde(rename = "next_DOY")]
    pub next_doy: f64,
}

/// Whole periods that move a folded scene strictly past the other end of a
/// series covering `span` time units. One period for a series within a year.
pub fn padding_shift(span: f64, domain: TimeDomain) -> f64 {
    let period = domain.period();
    ((span / period).floor() + 1.0) * period
}

/// Series with the last `k` observations shifted back in front and the first
/// `k` shifted forward behind, by [`padding_shift`]. Not re-sorted.
pub fn augment_series(series: &TimeSeries, num_padding: usize, domain: TimeDomain) -> Vec<Observation> {
    let observations = series.observations();
    let n = observations.len();
    let k = num_padding.min(n);
    let shift = series
        .span()
        .map_or(domain.period(), |(start, end)| padding_shift(end - start, domain));

    let mut augmented = Vec::with_capacity(n + 2 * k);
    augmented.extend(observations[n - k..].iter().map(|o| o.shifted(-shift)));
    augmented.extend_from_slice(&observations);
    augmented.extend(observations[..k].iter().map(|o| o.shifted(shift)));
    augmented
}

/// For each index, the last unmasked observation strictly before it.
fn carry_scan<'a, I>(observations: I, sentinel: Neighbor) -> Vec<Neighbor>
where
    I: Iterator<Item = &'a Observation>,
{
    observations
        .scan(sentinel, |carry, obs| {
            let before = *carry;
            if obs.valid {
                *carry = Neighbor::from(obs);
            }
            Some(before)
        })
        .collect()
}

/// Previous/next unmasked neighbours for every observation of `series`.
pub fn find_neighbors(series: &TimeSeries, num_padding: usize, domain: TimeDomain) -> Vec<NeighborPair> {
    let augmented = augment_series(series, num_padding, domain);
    let k = num_padding.min(series.len());

    let previous = carry_scan(
        augmented.iter(),
        Neighbor::Sentinel {
            time: domain.sentinel_start(),
        },
    );
    let mut next = carry_scan(
        augmented.iter().rev(),
        Neighbor::Sentinel {
            time: domain.sentinel_end(),
        },
    );
    next.reverse();

    previous[k..k + series.len()]
        .iter()
        .zip(&next[k..k + series.len()])
        .map(|(&previous, &next)| NeighborPair { previous, next })
        .collect()
}

/// Judge one observation against its neighbours.
pub fn evaluate(current: &Observation, pair: &NeighborPair, params: &CloudFilterParams) -> CloudFilterRecord {
    let expected = pair.interpolate(current.timestamp);
    let diff = expected.map(|e| current.value - e);
    let allowed = diff.map_or(true, |d| params.allows(d));

    CloudFilterRecord {
        observation: current.with_valid(current.valid && allowed),
        rejected: current.valid && !allowed,
        reg_diff: diff.unwrap_or(f64::NAN),
        reg_expected: expected.unwrap_or(f64::NAN),
        previous: pair.previous.value(),
        previous_doy: pair.previous.time(),
        next: pair.next.value(),
        next_doy: pair.next.time(),
    }
}

/// Run the filter over one pixel's series. One record per input observation, in order.
pub fn cloud_temporal_filter(
    series: &TimeSeries,
    params: &CloudFilterParams,
) -> Result<Vec<CloudFilterRecord>, PhenoError> {
    params.validate()?;
    if params.num_padding_scenes > series.len() && !series.is_empty() {
        debug!(
            requested = params.num_padding_scenes,
            available = series.len(),
            "padding clamped to series length"
        );
    }
    let pairs = find_neighbors(series, params.num_padding_scenes, params.domain);
    let records: Vec<CloudFilterRecord> = series
        .iter()
        .zip(&pairs)
        .map(|(obs, pair)| evaluate(&obs, pair, params))
        .collect();
    debug!(
        observations = records.len(),
        rejected = records.iter().filter(|r| r.rejected).count(),
        "cloud filter pass"
    );
    Ok(records)
}

/// The input series with filter-rejected observations masked.
pub fn apply_filter(series: &TimeSeries, params: &CloudFilterParams) -> Result<TimeSeries, PhenoError> {
    let records = cloud_temporal_filter(series, params)?;
    series.with_validity(records.iter().map(|r| r.observation.valid).collect())
}
