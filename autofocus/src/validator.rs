//! Acceptance checks for a candidate focus point
//!
//! The gates run in order: fit quality, sampled range, then a fresh measurement at the
//! candidate compared with the pre-run baseline. The first two are pure functions over
//! the fits and samples; the last one moves the focuser.

use crate::config::{AutofocusSettings, DetectionMethod, FittingMode};
use crate::error::{AutofocusResult, ValidationRejection};
use crate::fitting::{CurveFits, FitPoint};
use crate::sample::{FocusSample, FocusSampleStore};
use crate::sampling::SamplingController;

/// A new focus measurement may be at most this much worse than the baseline
pub const REGRESSION_TOLERANCE: f64 = 1.15;

/// Outcome of validating one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The focuser is parked at `point`
    Accepted {
        point: FitPoint,
        measurement: Option<FocusSample>,
    },
    Rejected(ValidationRejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

/// R² of every model feeding the fitting mode must reach the threshold (HFR only)
pub fn check_fit_quality(
    fits: &CurveFits,
    mode: FittingMode,
    method: DetectionMethod,
    threshold: f64,
) -> Result<(), ValidationRejection> {
    if method.higher_is_better() || threshold <= 0.0 {
        return Ok(());
    }

    let gate = |model: &'static str, r_squared: Option<f64>| match r_squared {
        None => Err(ValidationRejection::NoCandidate { model }),
        Some(r_squared) if r_squared < threshold => Err(ValidationRejection::PoorFit {
            model,
            r_squared,
            threshold,
        }),
        Some(_) => Ok(()),
    };

    if mode.uses_hyperbolic() {
        gate("Hyperbolic", fits.hyperbolic.as_ref().map(|f| f.r_squared))?;
    }
    if mode.uses_quadratic() {
        gate("Quadratic", fits.quadratic.as_ref().map(|f| f.r_squared))?;
    }
    if mode.uses_trendlines() {
        gate("Left trendline", fits.trendline.as_ref().map(|f| f.left.r_squared))?;
        gate("Right trendline", fits.trendline.as_ref().map(|f| f.right.r_squared))?;
    }
    Ok(())
}

/// The candidate must not be extrapolated beyond the sampled positions
pub fn check_range(point: &FitPoint, store: &FocusSampleStore) -> Result<(), ValidationRejection> {
    let Some((min, max)) = store.position_range() else {
        return Err(ValidationRejection::OutOfRange {
            position: point.position,
            min: 0,
            max: 0,
        });
    };
    if !point.position.is_finite() || point.position < min as f64 || point.position > max as f64 {
        return Err(ValidationRejection::OutOfRange {
            position: point.position,
            min,
            max,
        });
    }
    Ok(())
}

/// Focus must not have become materially worse than before the run (HFR only).
/// A zero baseline means nothing was detected before the run, so there is nothing to
/// compare against.
pub fn check_regression(
    measured: f64,
    baseline: f64,
    method: DetectionMethod,
) -> Result<(), ValidationRejection> {
    if method.higher_is_better() || baseline == 0.0 {
        return Ok(());
    }
    let limit = baseline * REGRESSION_TOLERANCE;
    if measured > limit {
        return Err(ValidationRejection::Regressed {
            measured,
            baseline,
            limit,
        });
    }
    Ok(())
}

/// Run all gates for the current attempt. Only hardware faults and cancellation are
/// errors; a refused candidate is a [`Verdict::Rejected`].
pub async fn validate(
    settings: &AutofocusSettings,
    fits: &CurveFits,
    store: &FocusSampleStore,
    baseline: &FocusSample,
    sampler: &mut SamplingController<'_>,
) -> AutofocusResult<Verdict> {
    let method = settings.detection_method;

    let point = match fits.final_point(settings.fitting_mode, method) {
        Ok(point) => point,
        Err(rejection) => return Ok(Verdict::Rejected(rejection)),
    };
    tracing::info!(
        "Candidate focus point {:.1} (predicted {:.3})",
        point.position,
        point.value
    );

    if let Err(rejection) =
        check_fit_quality(fits, settings.fitting_mode, method, settings.r_squared_threshold)
    {
        return Ok(Verdict::Rejected(rejection));
    }
    if let Err(rejection) = check_range(&point, store) {
        return Ok(Verdict::Rejected(rejection));
    }

    sampler.move_absolute(point.step()).await?;

    if method.higher_is_better() {
        return Ok(Verdict::Accepted {
            point,
            measurement: None,
        });
    }

    let measurement = sampler.averaged_measurement().await?;
    tracing::info!(
        "Measured {:.3} at {} (baseline {:.3})",
        measurement.measure,
        measurement.position,
        baseline.measure
    );
    if let Err(rejection) = check_regression(measurement.measure, baseline.measure, method) {
        return Ok(Verdict::Rejected(rejection));
    }

    Ok(Verdict::Accepted {
        point,
        measurement: Some(measurement),
    })
}
