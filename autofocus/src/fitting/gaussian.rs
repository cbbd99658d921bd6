//! Gaussian fit `y = d + A·exp(−(x − μ)²/(2σ²))` for contrast-based focusing
//!
//! Weighted Levenberg-Marquardt over the four parameters. Positions are mapped to
//! roughly [-1, 1] first so the parameter scales are comparable.

use super::{solve_linear, weighted_r_squared, FitPoint, PositionScale};
use crate::config::DetectionMethod;
use crate::sample::FocusSample;
use serde::{Deserialize, Serialize};

const MAX_ITERATIONS: usize = 200;
const CONVERGENCE_THRESHOLD: f64 = 1e-10;
const INITIAL_LAMBDA: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_SIGMA: f64 = 1e-3;
const MAX_SIGMA: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianFit {
    pub amplitude: f64,
    /// μ in focuser steps
    pub center: f64,
    /// σ in focuser steps
    pub sigma: f64,
    pub offset: f64,
    /// (μ, A + d)
    pub peak: FitPoint,
    pub r_squared: f64,
    pub iterations: usize,
    pub converged: bool,
}

// [amplitude, center, sigma, offset] in scaled coordinates
type Params = [f64; 4];

impl GaussianFit {
    /// Needs at least four samples; `None` if the fit degenerates
    pub fn calculate(samples: &[FocusSample], _method: DetectionMethod) -> Option<Self> {
        if samples.len() < 4 {
            return None;
        }
        let scale = PositionScale::from_samples(samples)?;
        let data: Vec<(f64, f64, f64)> = samples
            .iter()
            .map(|s| (scale.to_unit(s.position as f64), s.measure, s.weight()))
            .collect();

        let mut params = initial_guess(&data)?;
        let mut lambda = INITIAL_LAMBDA;
        let mut chi2 = compute_chi2(&data, &params);
        let mut converged = false;
        let mut iterations = 0;

        for iter in 0..MAX_ITERATIONS {
            iterations = iter + 1;

            let (hessian, gradient) = normal_equations(&data, &params);
            let mut damped = hessian;
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] *= 1.0 + lambda;
            }
            let Some(delta) = solve_linear(damped, gradient) else {
                break;
            };

            let mut candidate = params;
            for (p, d) in candidate.iter_mut().zip(delta.iter()) {
                *p += d;
            }
            candidate[0] = candidate[0].max(f64::EPSILON);
            candidate[2] = candidate[2].abs().clamp(MIN_SIGMA, MAX_SIGMA);

            let candidate_chi2 = compute_chi2(&data, &candidate);
            if candidate_chi2 < chi2 {
                params = candidate;
                chi2 = candidate_chi2;
                lambda *= LAMBDA_DOWN;

                let max_delta = delta.iter().map(|d| d.abs()).fold(0.0f64, f64::max);
                if max_delta < CONVERGENCE_THRESHOLD {
                    converged = true;
                    break;
                }
            } else {
                lambda *= LAMBDA_UP;
                if lambda > 1e10 {
                    // no further descent possible, current parameters are the optimum
                    converged = true;
                    break;
                }
            }
        }

        let [amplitude, center_u, sigma_u, offset] = params;
        if params.iter().any(|p| !p.is_finite()) {
            return None;
        }

        let center = scale.from_unit(center_u);
        let sigma = sigma_u * scale.half_span;
        let r_squared = weighted_r_squared(samples, |x| gaussian(x, amplitude, center, sigma, offset));

        Some(Self {
            amplitude,
            center,
            sigma,
            offset,
            peak: FitPoint::new(center, amplitude + offset),
            r_squared,
            iterations,
            converged,
        })
    }

    pub fn value_at(&self, x: f64) -> f64 {
        gaussian(x, self.amplitude, self.center, self.sigma, self.offset)
    }
}

fn gaussian(x: f64, amplitude: f64, center: f64, sigma: f64, offset: f64) -> f64 {
    let dx = x - center;
    offset + amplitude * (-(dx * dx) / (2.0 * sigma * sigma)).exp()
}

fn initial_guess(data: &[(f64, f64, f64)]) -> Option<Params> {
    let (peak_u, peak_y, _) = *data.iter().max_by(|a, b| a.1.total_cmp(&b.1))?;
    let floor = data.iter().map(|d| d.1).fold(f64::INFINITY, f64::min);
    let amplitude = peak_y - floor;
    if !(amplitude > 0.0) {
        return None;
    }

    // width of the region above half maximum, FWHM = 2.355σ
    let half = floor + amplitude / 2.0;
    let (lo, hi) = data
        .iter()
        .filter(|d| d.1 >= half)
        .fold((peak_u, peak_u), |(lo, hi), d| (lo.min(d.0), hi.max(d.0)));
    let sigma = ((hi - lo) / 2.355).clamp(0.1, MAX_SIGMA);

    Some([amplitude, peak_u, sigma, floor])
}

fn compute_chi2(data: &[(f64, f64, f64)], params: &Params) -> f64 {
    let [amplitude, center, sigma, offset] = *params;
    data.iter()
        .map(|&(u, y, w)| w * (y - gaussian(u, amplitude, center, sigma, offset)).powi(2))
        .sum()
}

/// Weighted JᵀWJ and JᵀWr for the current parameters
fn normal_equations(data: &[(f64, f64, f64)], params: &Params) -> ([[f64; 4]; 4], [f64; 4]) {
    let [amplitude, center, sigma, offset] = *params;
    let sigma2 = sigma * sigma;
    let mut hessian = [[0.0f64; 4]; 4];
    let mut gradient = [0.0f64; 4];

    for &(u, y, w) in data {
        let du = u - center;
        let e = (-(du * du) / (2.0 * sigma2)).exp();
        let residual = y - (offset + amplitude * e);
        let jacobian = [
            e,
            amplitude * e * du / sigma2,
            amplitude * e * du * du / (sigma2 * sigma),
            1.0,
        ];
        for i in 0..4 {
            gradient[i] += w * jacobian[i] * residual;
            for j in 0..4 {
                hessian[i][j] += w * jacobian[i] * jacobian[j];
            }
        }
    }

    (hessian, gradient)
}
