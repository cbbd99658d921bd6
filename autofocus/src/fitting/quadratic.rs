//! Weighted parabola fit
//!
//! Positions are centered and scaled before solving the normal equations, since raw
//! focuser steps in the tens of thousands make the x⁴ sums badly conditioned.

use super::{solve_linear, weighted_r_squared, FitPoint, PositionScale};
use crate::config::DetectionMethod;
use crate::sample::FocusSample;
use serde::{Deserialize, Serialize};

/// `y = a·x² + b·x + c` in focuser steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadraticFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Vertex of the parabola
    pub minimum: FitPoint,
    pub r_squared: f64,
}

impl QuadraticFit {
    /// Needs at least three distinct positions; `None` when the parabola opens the wrong way
    pub fn calculate(samples: &[FocusSample], method: DetectionMethod) -> Option<Self> {
        let mut positions: Vec<i32> = samples.iter().map(|s| s.position).collect();
        positions.sort_unstable();
        positions.dedup();
        if positions.len() < 3 {
            return None;
        }
        let scale = PositionScale::from_samples(samples)?;

        // normal equations in scaled coordinates u: Σw·u^(i+j)
        let mut moments = [0.0f64; 5];
        let mut rhs = [0.0f64; 3];
        for s in samples {
            let w = s.weight();
            let u = scale.to_unit(s.position as f64);
            let mut power = 1.0;
            for k in 0..5 {
                moments[k] += w * power;
                if k < 3 {
                    rhs[k] += w * power * s.measure;
                }
                power *= u;
            }
        }
        let matrix = [
            [moments[4], moments[3], moments[2]],
            [moments[3], moments[2], moments[1]],
            [moments[2], moments[1], moments[0]],
        ];
        let [ua, ub, uc] = solve_linear(matrix, [rhs[2], rhs[1], rhs[0]])?;

        let opens_correctly = if method.higher_is_better() { ua < 0.0 } else { ua > 0.0 };
        if !opens_correctly {
            return None;
        }

        let vertex_u = -ub / (2.0 * ua);
        let vertex_value = uc - ub * ub / (4.0 * ua);
        let model = |x: f64| {
            let u = scale.to_unit(x);
            ua * u * u + ub * u + uc
        };
        let r_squared = weighted_r_squared(samples, model);

        let h = scale.half_span;
        let x0 = scale.center;
        let a = ua / (h * h);
        let b = ub / h - 2.0 * ua * x0 / (h * h);
        let c = ua * x0 * x0 / (h * h) - ub * x0 / h + uc;

        Some(Self {
            a,
            b,
            c,
            minimum: FitPoint::new(scale.from_unit(vertex_u), vertex_value),
            r_squared,
        })
    }

    pub fn value_at(&self, x: f64) -> f64 {
        self.a * x * x + self.b * x + self.c
    }
}
