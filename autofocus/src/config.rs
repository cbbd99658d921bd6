//! Autofocus settings
//!
//! Everything a run needs to know up front: sweep geometry, exposure parameters,
//! fitting strategy, validation thresholds and the equipment changes the run is
//! allowed to make. Settings deserialize with defaults for any missing field, so a
//! partial JSON profile is valid.

use crate::error::{AutofocusError, AutofocusResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Curve-fit strategy used to pick the final focus point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FittingMode {
    /// Intersection of the left and right trend lines
    Trendlines,
    /// Vertex of a parabola through all points
    Parabolic,
    /// Minimum of a hyperbola through all points
    Hyperbolic,
    /// Average of the trendline intersection and the parabola vertex
    TrendParabolic,
    /// Average of the trendline intersection and the hyperbola minimum
    TrendHyperbolic,
}

impl FittingMode {
    pub fn uses_trendlines(&self) -> bool {
        matches!(
            self,
            FittingMode::Trendlines | FittingMode::TrendParabolic | FittingMode::TrendHyperbolic
        )
    }

    pub fn uses_quadratic(&self) -> bool {
        matches!(self, FittingMode::Parabolic | FittingMode::TrendParabolic)
    }

    pub fn uses_hyperbolic(&self) -> bool {
        matches!(self, FittingMode::Hyperbolic | FittingMode::TrendHyperbolic)
    }
}

/// How sharpness is measured on each exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMethod {
    /// Half-flux radius of detected stars, lower is better
    StarHfr,
    /// Image contrast statistics, higher is better
    ContrastDetection,
}

impl DetectionMethod {
    pub fn higher_is_better(&self) -> bool {
        matches!(self, DetectionMethod::ContrastDetection)
    }
}

/// Timeouts applied while a run is in progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusTimeouts {
    /// Added to the exposure duration before an exposure is considered lost
    pub exposure_margin_secs: u64,
    /// How long to wait for guiding to resume after the run
    pub guider_resume_secs: u64,
}

impl Default for AutofocusTimeouts {
    fn default() -> Self {
        Self {
            exposure_margin_secs: 60,
            guider_resume_secs: 60,
        }
    }
}

impl AutofocusTimeouts {
    /// Exposure completion deadline for the given exposure time
    pub fn exposure_timeout(&self, exposure_secs: f64) -> Duration {
        Duration::try_from_secs_f64(exposure_secs.max(0.0))
            .unwrap_or(Duration::MAX)
            .saturating_add(Duration::from_secs(self.exposure_margin_secs))
    }

    pub fn guider_resume_timeout(&self) -> Duration {
        Duration::from_secs(self.guider_resume_secs)
    }
}

/// Longest accepted focus exposure in seconds
pub const MAX_EXPOSURE_SECS: f64 = 3600.0;

/// Upper bound for every configured timeout in seconds
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Upper bound for `offset_steps × step_size`, the initial outward move
pub const MAX_SWEEP_STEPS: i64 = 10_000_000;

/// Configuration for an autofocus run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusSettings {
    pub fitting_mode: FittingMode,
    pub detection_method: DetectionMethod,
    /// Focuser steps between consecutive focus points
    pub step_size: i32,
    /// Points required on each side of the minimum
    pub offset_steps: u32,
    /// Exposures averaged at every focus point
    pub exposures_per_point: u32,
    /// Exposure duration in seconds for focus frames
    pub exposure_duration: f64,
    pub binning: i32,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    /// Minimum R² for the fits feeding the fitting mode (0 disables the check)
    pub r_squared_threshold: f64,
    /// Total attempts before the run gives up
    pub max_attempts: u32,
    /// Filter to switch to for the run, by name
    pub autofocus_filter: Option<String>,
    /// Stop guiding while focusing and resume afterwards
    pub stop_guiding: bool,
    /// Centered fraction of the sensor to read out while focusing
    pub subsample_ratio: Option<f64>,
    /// Settling time after focuser moves in milliseconds
    pub settle_time_ms: u64,
    /// Overshoot for absolute moves toward lower positions (0 = disabled)
    pub backlash_steps: i32,
    /// Star count change between points that triggers a warning (0.5 = 50%)
    pub max_star_count_change: Option<f64>,
    pub timeouts: AutofocusTimeouts,
}

impl Default for AutofocusSettings {
    fn default() -> Self {
        Self {
            fitting_mode: FittingMode::Hyperbolic,
            detection_method: DetectionMethod::StarHfr,
            step_size: 100,
            offset_steps: 4,
            exposures_per_point: 1,
            exposure_duration: 3.0,
            binning: 1,
            gain: None,
            offset: None,
            r_squared_threshold: 0.7,
            max_attempts: 1,
            autofocus_filter: None,
            stop_guiding: false,
            subsample_ratio: None,
            settle_time_ms: 500,
            backlash_steps: 0,
            max_star_count_change: Some(0.5),
            timeouts: AutofocusTimeouts::default(),
        }
    }
}

impl AutofocusSettings {
    /// Parse settings from a JSON profile
    pub fn from_json(json: &str) -> AutofocusResult<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| AutofocusError::InvalidSettings(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AutofocusResult<()> {
        if self.step_size <= 0 {
            return Err(AutofocusError::InvalidSettings(format!(
                "step size must be positive, got {}",
                self.step_size
            )));
        }
        if self.offset_steps == 0 {
            return Err(AutofocusError::InvalidSettings(
                "offset steps must be at least 1".to_string(),
            ));
        }
        if self.exposures_per_point == 0 {
            return Err(AutofocusError::InvalidSettings(
                "at least one exposure per point is required".to_string(),
            ));
        }
        if !(self.exposure_duration >= 0.0 && self.exposure_duration <= MAX_EXPOSURE_SECS) {
            return Err(AutofocusError::InvalidSettings(format!(
                "exposure duration must be between 0 and {}s, got {}",
                MAX_EXPOSURE_SECS, self.exposure_duration
            )));
        }
        let sweep = self.offset_steps as i64 * self.step_size as i64;
        if sweep > MAX_SWEEP_STEPS {
            return Err(AutofocusError::InvalidSettings(format!(
                "offset steps × step size must not exceed {}, got {}",
                MAX_SWEEP_STEPS, sweep
            )));
        }
        // the gaussian needs four samples, one point per side leaves it with three
        if self.detection_method.higher_is_better() && self.offset_steps < 2 {
            return Err(AutofocusError::InvalidSettings(
                "contrast detection needs at least 2 offset steps".to_string(),
            ));
        }
        if self.timeouts.exposure_margin_secs > MAX_TIMEOUT_SECS
            || self.timeouts.guider_resume_secs > MAX_TIMEOUT_SECS
        {
            return Err(AutofocusError::InvalidSettings(format!(
                "timeouts must not exceed {}s",
                MAX_TIMEOUT_SECS
            )));
        }
        if !(1..=4).contains(&self.binning) {
            return Err(AutofocusError::InvalidSettings(format!(
                "binning must be between 1 and 4, got {}",
                self.binning
            )));
        }
        if self.max_attempts == 0 {
            return Err(AutofocusError::InvalidSettings(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if let Some(ratio) = self.subsample_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(AutofocusError::InvalidSettings(format!(
                    "sub-sample ratio must be in (0, 1], got {}",
                    ratio
                )));
            }
        }
        if self.backlash_steps < 0 {
            return Err(AutofocusError::InvalidSettings(
                "backlash steps must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_time_ms)
    }
}
