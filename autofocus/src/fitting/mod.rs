//! Curve fitting over focus samples
//!
//! Four independent models are fitted to the same sample set. The set of models is
//! closed, so they are dispatched through [`FitModel`] rather than trait objects, and
//! their results live side by side in [`CurveFits`], which the sampling loop
//! recomputes after every new sample.

pub mod gaussian;
pub mod hyperbolic;
pub mod quadratic;
pub mod trendline;

pub use gaussian::GaussianFit;
pub use hyperbolic::HyperbolicFit;
pub use quadratic::QuadraticFit;
pub use trendline::{TrendLine, TrendlineFit};

use crate::config::{DetectionMethod, FittingMode};
use crate::error::ValidationRejection;
use crate::sample::{FocusSample, FocusSampleStore};
use serde::{Deserialize, Serialize};

/// A fitted extremum: focuser position and predicted measure there
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitPoint {
    pub position: f64,
    pub value: f64,
}

impl FitPoint {
    pub fn new(position: f64, value: f64) -> Self {
        Self { position, value }
    }

    /// Nearest whole focuser step
    pub fn step(&self) -> i32 {
        self.position.round() as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitModel {
    Trendline,
    Quadratic,
    Hyperbolic,
    Gaussian,
}

impl FitModel {
    pub fn name(&self) -> &'static str {
        match self {
            FitModel::Trendline => "Trendline",
            FitModel::Quadratic => "Quadratic",
            FitModel::Hyperbolic => "Hyperbolic",
            FitModel::Gaussian => "Gaussian",
        }
    }

    /// Models that are meaningful for a detection method
    pub fn models_for(method: DetectionMethod) -> &'static [FitModel] {
        match method {
            DetectionMethod::StarHfr => &[FitModel::Trendline, FitModel::Quadratic, FitModel::Hyperbolic],
            DetectionMethod::ContrastDetection => &[FitModel::Trendline, FitModel::Gaussian],
        }
    }

    pub fn fit(&self, samples: &[FocusSample], method: DetectionMethod) -> Option<CurveFit> {
        match self {
            FitModel::Trendline => TrendlineFit::calculate(samples, method).map(CurveFit::Trendline),
            FitModel::Quadratic => QuadraticFit::calculate(samples, method).map(CurveFit::Quadratic),
            FitModel::Hyperbolic => HyperbolicFit::calculate(samples, method).map(CurveFit::Hyperbolic),
            FitModel::Gaussian => GaussianFit::calculate(samples, method).map(CurveFit::Gaussian),
        }
    }
}

/// Result of one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model")]
pub enum CurveFit {
    Trendline(TrendlineFit),
    Quadratic(QuadraticFit),
    Hyperbolic(HyperbolicFit),
    Gaussian(GaussianFit),
}

impl CurveFit {
    pub fn model(&self) -> FitModel {
        match self {
            CurveFit::Trendline(_) => FitModel::Trendline,
            CurveFit::Quadratic(_) => FitModel::Quadratic,
            CurveFit::Hyperbolic(_) => FitModel::Hyperbolic,
            CurveFit::Gaussian(_) => FitModel::Gaussian,
        }
    }

    /// Fitted best-focus point
    pub fn extremum(&self) -> Option<FitPoint> {
        match self {
            CurveFit::Trendline(fit) => fit.intersection,
            CurveFit::Quadratic(fit) => Some(fit.minimum),
            CurveFit::Hyperbolic(fit) => Some(fit.minimum),
            CurveFit::Gaussian(fit) => Some(fit.peak),
        }
    }

    /// R²; for trendlines the weaker of the two segments
    pub fn goodness_of_fit(&self) -> f64 {
        match self {
            CurveFit::Trendline(fit) => fit.left.r_squared.min(fit.right.r_squared),
            CurveFit::Quadratic(fit) => fit.r_squared,
            CurveFit::Hyperbolic(fit) => fit.r_squared,
            CurveFit::Gaussian(fit) => fit.r_squared,
        }
    }
}

/// Latest results of every model for the current sample set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurveFits {
    pub trendline: Option<TrendlineFit>,
    pub quadratic: Option<QuadraticFit>,
    pub hyperbolic: Option<HyperbolicFit>,
    pub gaussian: Option<GaussianFit>,
}

impl CurveFits {
    pub fn calculate(store: &FocusSampleStore, method: DetectionMethod) -> Self {
        let mut fits = Self::default();
        for model in FitModel::models_for(method) {
            match model.fit(store.samples(), method) {
                Some(CurveFit::Trendline(fit)) => fits.trendline = Some(fit),
                Some(CurveFit::Quadratic(fit)) => fits.quadratic = Some(fit),
                Some(CurveFit::Hyperbolic(fit)) => fits.hyperbolic = Some(fit),
                Some(CurveFit::Gaussian(fit)) => fits.gaussian = Some(fit),
                None => {}
            }
        }
        fits
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn get(&self, model: FitModel) -> Option<CurveFit> {
        match model {
            FitModel::Trendline => self.trendline.clone().map(CurveFit::Trendline),
            FitModel::Quadratic => self.quadratic.clone().map(CurveFit::Quadratic),
            FitModel::Hyperbolic => self.hyperbolic.clone().map(CurveFit::Hyperbolic),
            FitModel::Gaussian => self.gaussian.clone().map(CurveFit::Gaussian),
        }
    }

    /// Every model result that was computed
    pub fn computed(&self) -> Vec<CurveFit> {
        [FitModel::Trendline, FitModel::Quadratic, FitModel::Hyperbolic, FitModel::Gaussian]
            .iter()
            .filter_map(|model| self.get(*model))
            .collect()
    }

    /// Pick the focus point for a fitting mode and detection method.
    ///
    /// Contrast runs always use the gaussian peak. The hybrid modes average the
    /// trendline intersection with the second model, position and value separately.
    pub fn final_point(
        &self,
        mode: FittingMode,
        method: DetectionMethod,
    ) -> Result<FitPoint, ValidationRejection> {
        if method.higher_is_better() {
            return self
                .gaussian
                .as_ref()
                .map(|fit| fit.peak)
                .ok_or(ValidationRejection::NoCandidate { model: "Gaussian" });
        }

        let trend = || {
            self.trendline
                .as_ref()
                .and_then(|fit| fit.intersection)
                .ok_or(ValidationRejection::NoCandidate { model: "Trendline" })
        };
        let quadratic = || {
            self.quadratic
                .as_ref()
                .map(|fit| fit.minimum)
                .ok_or(ValidationRejection::NoCandidate { model: "Quadratic" })
        };
        let hyperbolic = || {
            self.hyperbolic
                .as_ref()
                .map(|fit| fit.minimum)
                .ok_or(ValidationRejection::NoCandidate { model: "Hyperbolic" })
        };

        match mode {
            FittingMode::Trendlines => trend(),
            FittingMode::Parabolic => quadratic(),
            FittingMode::Hyperbolic => hyperbolic(),
            FittingMode::TrendParabolic => Ok(average(trend()?, quadratic()?)),
            FittingMode::TrendHyperbolic => Ok(average(trend()?, hyperbolic()?)),
        }
    }
}

fn average(a: FitPoint, b: FitPoint) -> FitPoint {
    FitPoint::new(
        ((a.position + b.position) / 2.0).round(),
        (a.value + b.value) / 2.0,
    )
}

/// Weighted coefficient of determination of `model` against the samples
pub(crate) fn weighted_r_squared<F>(samples: &[FocusSample], model: F) -> f64
where
    F: Fn(f64) -> f64,
{
    let sum_w: f64 = samples.iter().map(|s| s.weight()).sum();
    if samples.is_empty() || sum_w <= 0.0 {
        return 0.0;
    }
    let mean = samples.iter().map(|s| s.weight() * s.measure).sum::<f64>() / sum_w;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for sample in samples {
        let w = sample.weight();
        let predicted = model(sample.position as f64);
        ss_res += w * (sample.measure - predicted).powi(2);
        ss_tot += w * (sample.measure - mean).powi(2);
    }

    if ss_tot > 1e-12 {
        (1.0 - ss_res / ss_tot).max(0.0)
    } else {
        0.0
    }
}

/// Solve `a · x = b` with Gaussian elimination and partial pivoting
pub(crate) fn solve_linear<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Option<[f64; N]> {
    let magnitude = a.iter().flatten().fold(0.0f64, |m, v| m.max(v.abs()));
    let singular = magnitude * 1e-12;
    for col in 0..N {
        let pivot_row = (col..N).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot_row][col].abs() <= singular {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in col + 1..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let mut sum = b[row];
        for k in row + 1..N {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }

    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

/// Center and scale positions so higher powers stay well conditioned
#[derive(Debug, Clone, Copy)]
pub(crate) struct PositionScale {
    pub center: f64,
    pub half_span: f64,
}

impl PositionScale {
    pub fn from_samples(samples: &[FocusSample]) -> Option<Self> {
        let min = samples.iter().map(|s| s.position).min()? as f64;
        let max = samples.iter().map(|s| s.position).max()? as f64;
        Some(Self {
            center: (min + max) / 2.0,
            half_span: ((max - min) / 2.0).max(1.0),
        })
    }

    pub fn to_unit(&self, position: f64) -> f64 {
        (position - self.center) / self.half_span
    }

    pub fn from_unit(&self, u: f64) -> f64 {
        self.center + u * self.half_span
    }
}
