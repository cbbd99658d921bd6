//! Hyperbola fit `y = a·√(1 + ((x − p)/b)²)`
//!
//! The model is non-linear in all three parameters, so it is fitted by refining a
//! grid around the best guess: each cycle evaluates an 11³ grid and then halves the
//! search ranges around the best node. A dimension whose best node sits on the grid
//! edge keeps its range, so a poor initial guess can still walk outwards. Refinement
//! stops once the position range is below half a step and the error has settled.

use super::{weighted_r_squared, FitPoint};
use super::trendline::MIN_VALID_HFR;
use crate::config::DetectionMethod;
use crate::sample::FocusSample;
use serde::{Deserialize, Serialize};

const GRID_NODES: usize = 11;
const MAX_CYCLES: u32 = 30;
const MIN_IMPROVEMENT: f64 = 1e-4;
/// Position search range below which refinement stops, in steps
const MIN_POSITION_RANGE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperbolicFit {
    /// Measure at best focus
    pub a: f64,
    /// Asymptote steepness, in focuser steps
    pub b: f64,
    /// Best-focus position
    pub p: f64,
    pub minimum: FitPoint,
    pub r_squared: f64,
    pub cycles: u32,
}

impl HyperbolicFit {
    /// Fit to HFR samples; needs three valid points and is undefined for contrast data
    pub fn calculate(samples: &[FocusSample], method: DetectionMethod) -> Option<Self> {
        if method.higher_is_better() {
            return None;
        }
        let valid: Vec<FocusSample> = samples
            .iter()
            .filter(|s| s.measure >= MIN_VALID_HFR)
            .copied()
            .collect();
        if valid.len() < 3 {
            return None;
        }

        let lowest = valid
            .iter()
            .min_by(|a, b| a.measure.total_cmp(&b.measure))?;
        let highest = valid
            .iter()
            .max_by(|a, b| a.measure.total_cmp(&b.measure))?;
        let span = (valid.last()?.position - valid.first()?.position)
            .abs()
            .max(1) as f64;

        let mut a = lowest.measure;
        let mut p = lowest.position as f64;
        let mut b = {
            let ratio = highest.measure / lowest.measure;
            let dx = (highest.position - lowest.position).abs() as f64;
            let guess = dx / (ratio * ratio - 1.0).sqrt();
            if guess.is_finite() && guess > 0.0 {
                guess
            } else {
                span
            }
        };

        let mut ranges = [span, a, b];
        let mut best_error = Self::error(&valid, a, b, p);
        let mut cycles = 0;

        while cycles < MAX_CYCLES {
            cycles += 1;
            let previous_error = best_error;
            let center = [p, a, b];
            let mut best_nodes = [GRID_NODES / 2; 3];

            for i in 0..GRID_NODES {
                let p1 = grid_value(center[0], ranges[0], i);
                for j in 0..GRID_NODES {
                    let a1 = grid_value(center[1], ranges[1], j);
                    if a1 <= 0.0 {
                        continue;
                    }
                    for k in 0..GRID_NODES {
                        let b1 = grid_value(center[2], ranges[2], k);
                        if b1 <= 0.0 {
                            continue;
                        }
                        let error = Self::error(&valid, a1, b1, p1);
                        if error < best_error {
                            best_error = error;
                            p = p1;
                            a = a1;
                            b = b1;
                            best_nodes = [i, j, k];
                        }
                    }
                }
            }

            for (range, node) in ranges.iter_mut().zip(best_nodes) {
                if node != 0 && node != GRID_NODES - 1 {
                    *range /= 2.0;
                }
            }

            let improvement = if previous_error > 0.0 {
                (previous_error - best_error) / previous_error
            } else {
                0.0
            };
            if improvement < MIN_IMPROVEMENT && ranges[0] < MIN_POSITION_RANGE {
                break;
            }
        }

        let r_squared = weighted_r_squared(&valid, |x| hyperbola(x, a, b, p));
        Some(Self {
            a,
            b,
            p,
            minimum: FitPoint::new(p, a),
            r_squared,
            cycles,
        })
    }

    pub fn value_at(&self, x: f64) -> f64 {
        hyperbola(x, self.a, self.b, self.p)
    }

    fn error(samples: &[FocusSample], a: f64, b: f64, p: f64) -> f64 {
        samples
            .iter()
            .map(|s| s.weight() * (s.measure - hyperbola(s.position as f64, a, b, p)).powi(2))
            .sum()
    }
}

fn hyperbola(x: f64, a: f64, b: f64, p: f64) -> f64 {
    let t = (x - p) / b;
    a * (1.0 + t * t).sqrt()
}

fn grid_value(center: f64, range: f64, node: usize) -> f64 {
    center - range + 2.0 * range * node as f64 / (GRID_NODES - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(a: f64, b: f64, p: f64) -> Vec<FocusSample> {
        (4000..=6000)
            .step_by(200)
            .map(|x| FocusSample::new(x, hyperbola(x as f64, a, b, p), 0.05))
            .collect()
    }

    #[test]
    fn test_recovers_hyperbola_minimum() {
        let samples = curve(1.8, 250.0, 5070.0);
        let fit = HyperbolicFit::calculate(&samples, DetectionMethod::StarHfr).unwrap();

        assert!((fit.p - 5070.0).abs() < 5.0, "p = {}", fit.p);
        assert!((fit.a - 1.8).abs() < 0.05, "a = {}", fit.a);
        assert!(fit.r_squared > 0.99);
        assert_eq!(fit.minimum, FitPoint::new(fit.p, fit.a));
    }

    #[test]
    fn test_rejects_contrast_and_sparse_data() {
        let samples = curve(1.8, 250.0, 5070.0);
        assert!(HyperbolicFit::calculate(&samples, DetectionMethod::ContrastDetection).is_none());
        assert!(HyperbolicFit::calculate(&samples[..2], DetectionMethod::StarHfr).is_none());

        let mostly_failed = vec![
            FocusSample::new(100, 0.0, 1000.0),
            FocusSample::new(200, 2.0, 0.1),
            FocusSample::new(300, 0.05, 0.1),
            FocusSample::new(400, 3.0, 0.1),
        ];
        assert!(HyperbolicFit::calculate(&mostly_failed, DetectionMethod::StarHfr).is_none());
    }

    #[test]
    fn test_noisy_data_has_poor_fit() {
        let samples: Vec<FocusSample> = [3.0, 1.0, 4.0, 1.2, 3.8, 1.1, 4.2, 1.0, 3.5]
            .iter()
            .enumerate()
            .map(|(i, &hfr)| FocusSample::new(4000 + i as i32 * 100, hfr, 0.1))
            .collect();
        let fit = HyperbolicFit::calculate(&samples, DetectionMethod::StarHfr).unwrap();
        assert!(fit.r_squared < 0.5, "r² = {}", fit.r_squared);
    }
}
