// Robust polynomial regression of value against time.
//
// Iteratively reweighted least squares with Tukey bisquare weights: an ordinary
// least-squares pass is scored, leverage-adjusted residuals are scaled by their
// MAD, and high-residual rows are down-weighted in the following pass until the
// coefficients settle or the iteration cap is reached.

use nalgebra::{DMatrix, DVector, SVD};
use serde::{Deserialize, Serialize};

use crate::stats::median;
use crate::PhenoError;

const RANK_TOLERANCE: f64 = 1e-10;
const MAX_LEVERAGE: f64 = 0.9999;
const MAD_TO_SIGMA: f64 = 0.6745;
const SCALE_FLOOR: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Predictor {
    Constant,
    Time,
    TimeSq,
}

impl Predictor {
    pub fn name(&self) -> &'static str {
        match self {
            Predictor::Constant => "constant",
            Predictor::Time => "time",
            Predictor::TimeSq => "time_sq",
        }
    }

    fn power(&self) -> usize {
        match self {
            Predictor::Constant => 0,
            Predictor::Time => 1,
            Predictor::TimeSq => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelOrder {
    Linear,
    Quadratic,
}

impl ModelOrder {
    pub fn degree(&self) -> usize {
        match self {
            ModelOrder::Linear => 1,
            ModelOrder::Quadratic => 2,
        }
    }

    pub fn unknowns(&self) -> usize {
        self.degree() + 1
    }

    pub fn predictors(&self) -> &'static [Predictor] {
        match self {
            ModelOrder::Linear => &[Predictor::Constant, Predictor::Time],
            ModelOrder::Quadratic => &[Predictor::Constant, Predictor::Time, Predictor::TimeSq],
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RobustOptions {
    /// Bisquare tuning constant, in units of the robust residual scale.
    pub tuning: f64,
    pub max_iterations: usize,
    /// Relative change in coefficients below which iteration stops.
    pub tolerance: f64,
}

impl Default for RobustOptions {
    fn default() -> Self {
        Self {
            tuning: 4.685,
            max_iterations: 50,
            tolerance: 1e-6,
        }
    }
}

impl RobustOptions {
    pub fn validate(&self) -> Result<(), PhenoError> {
        if !(self.tuning.is_finite() && self.tuning > 0.0) {
            return Err(PhenoError::InvalidParameter(format!(
                "robust tuning constant must be positive (got {})",
                self.tuning
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(PhenoError::InvalidParameter(format!(
                "robust tolerance must be positive (got {})",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Coefficients of a robust fit, stored relative to `origin` for conditioning.
#[derive(Clone, Debug, PartialEq)]
pub struct RobustFit {
    order: ModelOrder,
    origin: f64,
    centered: Vec<f64>,
    weights: Vec<f64>,
    iterations: usize,
    converged: bool,
}

impl RobustFit {
    pub fn order(&self) -> ModelOrder {
        self.order
    }

    pub fn origin(&self) -> f64 {
        self.origin
    }

    /// Coefficients of `sum c_k * (t - origin)^k`.
    pub fn centered_coefficients(&self) -> &[f64] {
        &self.centered
    }

    /// Final per-row weights, in input order.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Coefficients of `sum c_k * t^k`.
    pub fn coefficients(&self) -> Vec<f64> {
        let len = self.centered.len();
        let shift = -self.origin;
        (0..len)
            .map(|j| {
                (j..len)
                    .map(|k| self.centered[k] * binomial(k, j) * shift.powi((k - j) as i32))
                    .sum()
            })
            .collect()
    }

    pub fn coefficient(&self, predictor: Predictor) -> Option<f64> {
        self.coefficients().get(predictor.power()).copied()
    }

    pub fn named_coefficients(&self) -> Vec<(Predictor, f64)> {
        self.order
            .predictors()
            .iter()
            .copied()
            .zip(self.coefficients())
            .collect()
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        let x = t - self.origin;
        self.centered.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }
}

/// Fit `value ~ polynomial(time)` of the given order.
///
/// Returns `None` when the system is underdetermined or the design matrix is
/// rank deficient; callers fall back to a simpler model.
pub fn fit_robust(
    times: &[f64],
    values: &[f64],
    order: ModelOrder,
    origin: f64,
    options: &RobustOptions,
) -> Option<RobustFit> {
    let n = times.len();
    let p = order.unknowns();
    if n != values.len() || n < p {
        return None;
    }

    let design = DMatrix::from_fn(n, p, |i, j| (times[i] - origin).powi(j as i32));
    let y = DVector::from_column_slice(values);
    let leverage = leverage(&design)?;
    let scale_floor = SCALE_FLOOR * (1.0 + y.amax());

    let mut weights = vec![1.0; n];
    let mut beta = solve_weighted(&design, &y, &weights)?;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        iterations += 1;
        let residuals = &y - &design * &beta;
        let adjusted: Vec<f64> = residuals
            .iter()
            .zip(leverage.iter())
            .map(|(r, h)| r / (1.0 - h.min(MAX_LEVERAGE)).sqrt())
            .collect();
        let scale = robust_scale(&adjusted);
        if scale <= scale_floor {
            converged = true;
            break;
        }

        let next_weights = bisquare_weights(&adjusted, options.tuning * scale);
        let Some(next) = solve_weighted(&design, &y, &next_weights) else {
            tracing::trace!(iterations, "reweighted system became singular; keeping previous pass");
            break;
        };
        let delta = (&next - &beta).amax();
        let magnitude = next.amax().max(beta.amax()).max(f64::EPSILON);
        beta = next;
        weights = next_weights;
        if delta <= options.tolerance * magnitude {
            converged = true;
            break;
        }
    }

    Some(RobustFit {
        order,
        origin,
        centered: beta.iter().copied().collect(),
        weights,
        iterations,
        converged,
    })
}

fn solve_weighted(
    design: &DMatrix<f64>,
    y: &DVector<f64>,
    weights: &[f64],
) -> Option<DVector<f64>> {
    let mut a = design.clone();
    let mut b = y.clone();
    for (i, &w) in weights.iter().enumerate() {
        let s = w.sqrt();
        a.row_mut(i).iter_mut().for_each(|x| *x *= s);
        b[i] *= s;
    }
    let svd = SVD::new(a, true, true);
    let cutoff = rank_cutoff(&svd)?;
    if svd.rank(cutoff) < design.ncols() {
        return None;
    }
    svd.solve(&b, cutoff).ok()
}

/// Diagonal of the hat matrix of the unweighted design.
fn leverage(design: &DMatrix<f64>) -> Option<Vec<f64>> {
    let svd = SVD::new(design.clone(), true, false);
    let cutoff = rank_cutoff(&svd)?;
    if svd.rank(cutoff) < design.ncols() {
        return None;
    }
    let u = svd.u.as_ref()?;
    let hat = (0..design.nrows())
        .map(|i| {
            svd.singular_values
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s > cutoff)
                .map(|(j, _)| u[(i, j)].powi(2))
                .sum()
        })
        .collect();
    Some(hat)
}

fn rank_cutoff(svd: &SVD<f64, nalgebra::Dyn, nalgebra::Dyn>) -> Option<f64> {
    let largest = svd.singular_values.max();
    if largest.is_finite() && largest > 0.0 {
        Some(RANK_TOLERANCE * largest)
    } else {
        None
    }
}

fn robust_scale(adjusted: &[f64]) -> f64 {
    let magnitudes: Vec<f64> = adjusted.iter().map(|r| r.abs()).collect();
    median(&magnitudes).unwrap_or(0.0) / MAD_TO_SIGMA
}

fn bisquare_weights(residuals: &[f64], cutoff: f64) -> Vec<f64> {
    residuals
        .iter()
        .map(|&r| {
            let u = r / cutoff;
            if u.abs() < 1.0 {
                (1.0 - u * u).powi(2)
            } else {
                0.0
            }
        })
        .collect()
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}
