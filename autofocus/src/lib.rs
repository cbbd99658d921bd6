//! Nightshade Autofocus
//!
//! Drives a focuser through a series of positions, measures star HFR or image
//! contrast at each one, fits focus curves to the samples and moves the focuser to
//! the best focus point once it passes validation. Equipment is reached through the
//! traits in [`device_ops`]; a simulated rig lives in [`simulator`].

pub mod config;
pub mod device_ops;
pub mod error;
pub mod fitting;
pub mod orchestrator;
pub mod report;
pub mod sample;
pub mod sampling;
pub mod simulator;
pub mod validator;

#[cfg(test)]
mod testing;

pub use config::{AutofocusSettings, AutofocusTimeouts, DetectionMethod, FittingMode};
pub use device_ops::{
    new_cancellation_token, AutofocusDevices, CancellationToken, DeviceResult, ExposureHandle,
    ExposureParams, FilterInfo, FilterWheel, Focuser, Guider, Measurement, MeasurementSource,
    ReportSink,
};
pub use error::{AutofocusError, AutofocusResult, ValidationRejection};
pub use fitting::{CurveFits, FitPoint};
pub use orchestrator::{AutofocusEngine, AutofocusRun, RunState};
pub use report::{AutofocusReport, JsonReportSink};
pub use sample::{FocusSample, FocusSampleStore};
pub use sampling::ProgressCallback;
