//! Device Operations Traits
//!
//! This module defines the narrow equipment interfaces the autofocus engine needs.
//! The actual implementations are provided by the driver layer (or by the simulator
//! and the scripted fakes used in tests); the engine calls these methods without
//! knowing the implementation details.

use crate::config::DetectionMethod;
use crate::report::AutofocusReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, String>;

/// Cooperative cancellation flag shared by everything a run awaits
pub type CancellationToken = Arc<AtomicBool>;

/// Parameters for a single focus exposure
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureParams {
    pub duration_secs: f64,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub binning: i32,
}

/// Handle to a captured exposure, only meaningful to the source that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureHandle {
    pub id: u64,
}

/// Scalar sharpness measurement of one exposure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// HFR in pixels or contrast statistic; 0 means nothing was detected
    pub value: f64,
    /// Standard deviation of the value across the measured stars or regions
    pub uncertainty: f64,
    pub star_count: Option<u32>,
}

/// A filter wheel slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInfo {
    pub name: String,
    /// 0-indexed slot
    pub position: i32,
}

/// Focuser control
#[async_trait]
pub trait Focuser: Send + Sync {
    /// Get current focuser position
    async fn get_position(&self) -> DeviceResult<i32>;

    /// Move by a relative number of steps, returns the new position
    async fn move_relative(&self, steps: i32) -> DeviceResult<i32>;

    /// Move to absolute position, returns the position reached
    async fn move_absolute(&self, position: i32) -> DeviceResult<i32>;

    /// Get focuser temperature (if available)
    async fn get_temperature(&self) -> DeviceResult<Option<f64>>;

    /// Whether the focuser is currently compensating for temperature
    async fn temp_comp_enabled(&self) -> DeviceResult<bool>;

    async fn set_temp_comp(&self, enabled: bool) -> DeviceResult<()>;
}

/// Camera exposure plus sharpness evaluation
#[async_trait]
pub trait MeasurementSource: Send + Sync {
    /// Take an exposure; `None` means the image never arrived
    async fn capture(&self, params: &ExposureParams) -> DeviceResult<Option<ExposureHandle>>;

    /// Evaluate a captured exposure with the given detection method
    async fn measure(&self, exposure: &ExposureHandle, method: DetectionMethod) -> DeviceResult<Measurement>;

    /// Abort current exposure
    async fn abort_exposure(&self) -> DeviceResult<()>;

    /// Current sub-sample readout ratio (`None` = full frame)
    async fn subsample(&self) -> DeviceResult<Option<f64>>;

    async fn set_subsample(&self, ratio: Option<f64>) -> DeviceResult<()>;
}

/// Filter wheel control
#[async_trait]
pub trait FilterWheel: Send + Sync {
    async fn current_filter(&self) -> DeviceResult<Option<FilterInfo>>;

    /// Get installed filters
    async fn filters(&self) -> DeviceResult<Vec<FilterInfo>>;

    /// Change filter, returns the filter actually selected
    async fn change_filter(&self, filter: &FilterInfo) -> DeviceResult<FilterInfo>;
}

/// Guider control
#[async_trait]
pub trait Guider: Send + Sync {
    /// Stop guiding, returns whether guiding was actually stopped
    async fn stop_guiding(&self) -> DeviceResult<bool>;

    /// Start guiding, returns whether guiding resumed
    async fn start_guiding(&self) -> DeviceResult<bool>;
}

/// Destination for completed autofocus reports
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &AutofocusReport) -> DeviceResult<()>;
}

/// The equipment an autofocus run operates on
#[derive(Clone)]
pub struct AutofocusDevices {
    pub focuser: Arc<dyn Focuser>,
    pub camera: Arc<dyn MeasurementSource>,
    pub filter_wheel: Option<Arc<dyn FilterWheel>>,
    pub guider: Option<Arc<dyn Guider>>,
}

impl AutofocusDevices {
    pub fn new(focuser: Arc<dyn Focuser>, camera: Arc<dyn MeasurementSource>) -> Self {
        Self {
            focuser,
            camera,
            filter_wheel: None,
            guider: None,
        }
    }

    pub fn with_filter_wheel(mut self, filter_wheel: Arc<dyn FilterWheel>) -> Self {
        self.filter_wheel = Some(filter_wheel);
        self
    }

    pub fn with_guider(mut self, guider: Arc<dyn Guider>) -> Self {
        self.guider = Some(guider);
        self
    }
}

pub fn new_cancellation_token() -> CancellationToken {
    Arc::new(AtomicBool::new(false))
}

pub fn is_cancelled(token: &CancellationToken) -> bool {
    token.load(Ordering::Relaxed)
}

/// Resolves once the token is set
pub async fn wait_for_cancellation(token: CancellationToken) {
    loop {
        if token.load(Ordering::Relaxed) { return; }
        sleep(Duration::from_millis(100)).await;
    }
}
