//! Error types for the autofocus engine
//!
//! Device traits report failures as plain strings (see [`crate::device_ops::DeviceResult`]);
//! the orchestrator wraps them into [`AutofocusError`] together with the operation that
//! failed, so the caller always learns which step of the run broke.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an autofocus run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutofocusError {
    /// A focuser, camera, filter wheel or guider operation failed
    #[error("Hardware error during {operation}: {message}")]
    Hardware {
        operation: String,
        message: String,
    },

    /// The camera did not deliver the exposure in time
    #[error("Exposure did not complete within {duration:?}")]
    ExposureTimeout { duration: Duration },

    /// The measurement source kept returning no image
    #[error("Image download failed after {attempts} attempts")]
    ImageDownload { attempts: u32 },

    /// No sharpness variation on either side of the candidate minimum
    #[error("Not enough spread in focus measurements: {samples} samples, no usable points on either side of position {pivot:?}")]
    DegenerateSignal { samples: usize, pivot: Option<i32> },

    /// Every attempt produced a focus point that failed validation
    #[error("Autofocus failed after {attempts} attempt(s): {reason}")]
    AttemptsExhausted { attempts: u32, reason: String },

    /// The run was cancelled; equipment restoration was still attempted
    #[error("Autofocus cancelled")]
    Cancelled,

    #[error("Invalid autofocus settings: {0}")]
    InvalidSettings(String),

    #[error("Failed to publish autofocus report: {0}")]
    Report(String),
}

impl AutofocusError {
    /// Build a hardware error from a device failure message
    pub fn hardware(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hardware {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Cancellation is a graceful abort rather than a fault
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the failure came from the equipment rather than the data
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            Self::Hardware { .. } | Self::ExposureTimeout { .. } | Self::ImageDownload { .. }
        )
    }
}

/// Why the validator refused a candidate focus point
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationRejection {
    #[error("No focus point could be determined from the {model} fit")]
    NoCandidate { model: &'static str },

    #[error("{model} fit R² {r_squared:.3} is below the threshold {threshold:.3}")]
    PoorFit {
        model: &'static str,
        r_squared: f64,
        threshold: f64,
    },

    #[error("Focus point {position:.1} is outside the sampled range [{min}, {max}]")]
    OutOfRange { position: f64, min: i32, max: i32 },

    #[error("Measurement {measured:.3} at the new focus point is worse than {limit:.3} (baseline {baseline:.3})")]
    Regressed {
        measured: f64,
        baseline: f64,
        limit: f64,
    },
}

pub type AutofocusResult<T> = Result<T, AutofocusError>;
