//! Trendline fit: two weighted regression lines meeting at the best-focus point

use super::{weighted_r_squared, FitPoint};
use crate::config::DetectionMethod;
use crate::sample::FocusSample;
use serde::{Deserialize, Serialize};

/// HFR values below this are treated as failed detections
pub const MIN_VALID_HFR: f64 = 0.1;

/// A side point must exceed the pivot HFR by this much to count toward its trend
pub const HFR_TREND_MARGIN: f64 = 0.1;

/// Weighted least-squares line `y = slope·x + intercept`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendLine {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub point_count: usize,
}

impl TrendLine {
    /// Fit a line through the given points; fewer than two points give an empty line
    pub fn calculate(points: &[FocusSample]) -> Self {
        let point_count = points.len();
        if point_count < 2 {
            return Self {
                point_count,
                ..Self::default()
            };
        }

        let sum_w: f64 = points.iter().map(|p| p.weight()).sum();
        let mean_x = points.iter().map(|p| p.weight() * p.position as f64).sum::<f64>() / sum_w;
        let mean_y = points.iter().map(|p| p.weight() * p.measure).sum::<f64>() / sum_w;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for p in points {
            let dx = p.position as f64 - mean_x;
            sxx += p.weight() * dx * dx;
            sxy += p.weight() * dx * (p.measure - mean_y);
        }
        if sxx <= f64::EPSILON {
            return Self {
                point_count,
                ..Self::default()
            };
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        let r_squared = weighted_r_squared(points, |x| slope * x + intercept);

        Self {
            slope,
            intercept,
            r_squared,
            point_count,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.point_count >= 2
    }

    pub fn value_at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    /// Crossing point of two lines, `None` when parallel or undefined
    pub fn intersect(&self, other: &TrendLine) -> Option<FitPoint> {
        if !self.is_defined() || !other.is_defined() {
            return None;
        }
        let slope_diff = self.slope - other.slope;
        if slope_diff.abs() < 1e-12 {
            return None;
        }
        let x = (other.intercept - self.intercept) / slope_diff;
        Some(FitPoint::new(x, self.value_at(x)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendlineFit {
    /// Best measured point splitting the samples into the two trends
    pub pivot: FitPoint,
    pub left: TrendLine,
    pub right: TrendLine,
    pub intersection: Option<FitPoint>,
}

impl TrendlineFit {
    /// Fit both trends around the best valid sample; `None` without any valid sample
    pub fn calculate(samples: &[FocusSample], method: DetectionMethod) -> Option<Self> {
        let higher_is_better = method.higher_is_better();
        let valid: Vec<FocusSample> = samples
            .iter()
            .filter(|s| if higher_is_better { !s.is_placeholder() } else { s.measure >= MIN_VALID_HFR })
            .copied()
            .collect();

        // first sample wins ties
        let pivot = valid.iter().fold(None::<&FocusSample>, |best, s| match best {
            Some(b) if higher_is_better && b.measure >= s.measure => Some(b),
            Some(b) if !higher_is_better && b.measure <= s.measure => Some(b),
            _ => Some(s),
        })?;

        let on_trend = |s: &FocusSample| {
            if higher_is_better {
                s.measure < pivot.measure
            } else {
                s.measure > pivot.measure + HFR_TREND_MARGIN
            }
        };
        let left: Vec<FocusSample> = valid
            .iter()
            .filter(|s| s.position < pivot.position && on_trend(s))
            .copied()
            .collect();
        let right: Vec<FocusSample> = valid
            .iter()
            .filter(|s| s.position > pivot.position && on_trend(s))
            .copied()
            .collect();

        let left = TrendLine::calculate(&left);
        let right = TrendLine::calculate(&right);
        let intersection = left.intersect(&right);

        Some(Self {
            pivot: FitPoint::new(pivot.position as f64, pivot.measure),
            left,
            right,
            intersection,
        })
    }

    /// Real points supporting the left trend
    pub fn left_count(&self) -> usize {
        self.left.point_count
    }

    pub fn right_count(&self) -> usize {
        self.right.point_count
    }

    pub fn pivot_position(&self) -> i32 {
        self.pivot.step()
    }
}
