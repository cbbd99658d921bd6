//! Adaptive focus point acquisition
//!
//! The [`SamplingController`] owns every hardware interaction of a run: focuser moves,
//! exposures and measurements. Each awaited operation races the cancellation token and
//! device failures are wrapped with the operation that failed. Which way to sample
//! next is decided by [`next_phase`], a pure function over the current trendline fit.

use crate::config::AutofocusSettings;
use crate::device_ops::{
    is_cancelled, wait_for_cancellation, AutofocusDevices, CancellationToken, DeviceResult,
    ExposureHandle, ExposureParams, Measurement,
};
use crate::error::{AutofocusError, AutofocusResult};
use crate::fitting::{CurveFits, TrendlineFit};
use crate::sample::{FocusSample, FocusSampleStore, NO_DETECTION_UNCERTAINTY};
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

/// Total capture tries when the camera returns no image
pub const MAX_CAPTURE_ATTEMPTS: u32 = 3;

/// Percentage + message progress reporting
pub type ProgressCallback<'a> = Option<&'a (dyn Fn(f64, String) + Send + Sync)>;

/// Where the next sampling pass goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionPhase {
    /// Nothing sampled yet
    Initial,
    ExpandLeft,
    ExpandRight,
    /// Enough points on both sides of the minimum
    Converged,
    /// No usable points on either side; the signal is flat or missing
    Degenerate,
}

/// Decide the next pass from the current samples and trendline fit.
///
/// A side needs more points while both its real trend points and its no-detection
/// placeholders are below `offset_steps`. Zero real points on both sides means there is
/// no sharpness variation to follow.
pub fn next_phase(
    store: &FocusSampleStore,
    trend: Option<&TrendlineFit>,
    offset_steps: usize,
) -> ExpansionPhase {
    if store.is_empty() {
        return ExpansionPhase::Initial;
    }
    let Some(trend) = trend else {
        return ExpansionPhase::Degenerate;
    };
    if trend.left_count() == 0 && trend.right_count() == 0 {
        return ExpansionPhase::Degenerate;
    }

    let pivot = trend.pivot.position;
    let left_placeholders = store.placeholders_left_of(pivot);
    let right_placeholders = store.placeholders_right_of(pivot);

    if trend.left_count() < offset_steps && left_placeholders < offset_steps {
        ExpansionPhase::ExpandLeft
    } else if trend.right_count() < offset_steps && right_placeholders < offset_steps {
        ExpansionPhase::ExpandRight
    } else {
        ExpansionPhase::Converged
    }
}

/// Drives the focuser and camera for one run
pub struct SamplingController<'a> {
    devices: &'a AutofocusDevices,
    settings: &'a AutofocusSettings,
    cancel: &'a CancellationToken,
    progress: ProgressCallback<'a>,
    position: i32,
    progress_pct: f64,
    reference_star_count: Option<u32>,
}

impl<'a> SamplingController<'a> {
    pub fn new(
        devices: &'a AutofocusDevices,
        settings: &'a AutofocusSettings,
        cancel: &'a CancellationToken,
        progress: ProgressCallback<'a>,
    ) -> Self {
        Self {
            devices,
            settings,
            cancel,
            progress,
            position: 0,
            progress_pct: 0.0,
            reference_star_count: None,
        }
    }

    /// Last known focuser position
    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn progress(&self) -> ProgressCallback<'a> {
        self.progress
    }

    pub fn check_cancelled(&self) -> AutofocusResult<()> {
        if is_cancelled(self.cancel) {
            Err(AutofocusError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Await a device operation unless the run is cancelled first
    pub async fn guarded<T, F>(&self, operation: &str, op: F) -> AutofocusResult<T>
    where
        F: Future<Output = DeviceResult<T>>,
    {
        self.check_cancelled()?;
        tokio::select! {
            result = op => result.map_err(|e| AutofocusError::hardware(operation, e)),
            _ = wait_for_cancellation(self.cancel.clone()) => {
                tracing::info!("Autofocus cancelled during {}", operation);
                Err(AutofocusError::Cancelled)
            }
        }
    }

    pub async fn read_position(&mut self) -> AutofocusResult<i32> {
        let focuser = self.devices.focuser.clone();
        self.position = self.guarded("focuser position", focuser.get_position()).await?;
        Ok(self.position)
    }

    pub async fn move_relative(&mut self, steps: i32) -> AutofocusResult<i32> {
        let focuser = self.devices.focuser.clone();
        self.position = self.guarded("focuser move", focuser.move_relative(steps)).await?;
        self.settle().await?;
        Ok(self.position)
    }

    /// Absolute move; moves toward lower positions overshoot by the backlash
    /// amount and finish moving outward
    pub async fn move_absolute(&mut self, target: i32) -> AutofocusResult<i32> {
        let focuser = self.devices.focuser.clone();
        let backlash = self.settings.backlash_steps;
        if backlash > 0 && target < self.position {
            let overshoot = target - backlash;
            tracing::debug!(
                "Backlash compensation: {} -> {} -> {}",
                self.position,
                overshoot,
                target
            );
            self.position = self
                .guarded("focuser move (backlash)", focuser.move_absolute(overshoot))
                .await?;
        }
        self.position = self.guarded("focuser move", focuser.move_absolute(target)).await?;
        self.settle().await?;
        Ok(self.position)
    }

    async fn settle(&self) -> AutofocusResult<()> {
        let settle = self.settings.settle_time();
        if settle.is_zero() {
            return Ok(());
        }
        self.guarded("focuser settle", async {
            sleep(settle).await;
            Ok(())
        })
        .await
    }

    fn exposure_params(&self) -> ExposureParams {
        ExposureParams {
            duration_secs: self.settings.exposure_duration,
            gain: self.settings.gain,
            offset: self.settings.offset,
            binning: self.settings.binning,
        }
    }

    /// Take one exposure, retrying when the camera returns no image
    pub async fn capture(&self) -> AutofocusResult<ExposureHandle> {
        let params = self.exposure_params();
        let deadline = self.settings.timeouts.exposure_timeout(params.duration_secs);

        for attempt in 1..=MAX_CAPTURE_ATTEMPTS {
            self.check_cancelled()?;

            let camera = self.devices.camera.clone();
            let outcome = tokio::select! {
                result = timeout(deadline, camera.capture(&params)) => result,
                never = self.exposure_ticker(params.duration_secs) => match never {},
                _ = wait_for_cancellation(self.cancel.clone()) => {
                    tracing::info!("Autofocus cancelled during exposure, aborting...");
                    if let Err(e) = self.devices.camera.abort_exposure().await {
                        tracing::warn!("Failed to abort exposure: {}", e);
                    }
                    return Err(AutofocusError::Cancelled);
                }
            };

            match outcome {
                Err(_) => {
                    if let Err(e) = self.devices.camera.abort_exposure().await {
                        tracing::warn!("Failed to abort timed out exposure: {}", e);
                    }
                    return Err(AutofocusError::ExposureTimeout { duration: deadline });
                }
                Ok(Err(e)) => return Err(AutofocusError::hardware("exposure", e)),
                Ok(Ok(Some(handle))) => return Ok(handle),
                Ok(Ok(None)) => {
                    tracing::warn!(
                        "No image received (attempt {}/{})",
                        attempt,
                        MAX_CAPTURE_ATTEMPTS
                    );
                }
            }
        }

        Err(AutofocusError::ImageDownload {
            attempts: MAX_CAPTURE_ATTEMPTS,
        })
    }

    /// Ticks exposure progress once a second; never completes
    async fn exposure_ticker(&self, duration_secs: f64) -> Infallible {
        let started = tokio::time::Instant::now();
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Some(cb) = self.progress {
                let elapsed = started.elapsed().as_secs_f64();
                cb(
                    self.progress_pct,
                    format!("Exposing {:.0}/{:.0}s at {}", elapsed, duration_secs, self.position),
                );
            }
        }
    }

    async fn measure(&self, handle: &ExposureHandle) -> AutofocusResult<Measurement> {
        let camera = self.devices.camera.clone();
        self.guarded(
            "measurement",
            camera.measure(handle, self.settings.detection_method),
        )
        .await
    }

    /// Average `exposures_per_point` measurements at the current position
    pub async fn averaged_measurement(&mut self) -> AutofocusResult<FocusSample> {
        let repeats = self.settings.exposures_per_point.max(1);
        let mut measurements = Vec::with_capacity(repeats as usize);
        for _ in 0..repeats {
            let handle = self.capture().await?;
            let measurement = self.measure(&handle).await?;
            self.check_star_count(&measurement);
            measurements.push(measurement);
        }
        Ok(aggregate(self.position, &measurements))
    }

    /// Compare against the first frame that found stars; returns whether the change
    /// exceeded the configured limit
    fn check_star_count(&mut self, measurement: &Measurement) -> bool {
        let Some(count) = measurement.star_count else {
            return false;
        };
        let Some(reference) = self.reference_star_count else {
            if count > 0 {
                self.reference_star_count = Some(count);
            }
            return false;
        };
        let Some(limit) = self.settings.max_star_count_change else {
            return false;
        };

        let change = ((count as f64 - reference as f64) / reference as f64).abs();
        if change > limit {
            tracing::warn!(
                "Star count changed by {:.1}% ({} -> {}), possible clouds or tracking issue",
                change * 100.0,
                reference,
                count
            );
            return true;
        }
        false
    }

    /// Sample `count` points. A non-zero `direction_offset` first moves by that many
    /// steps; every following point is one step toward lower positions.
    pub async fn collect_points(
        &mut self,
        store: &mut FocusSampleStore,
        fits: &mut CurveFits,
        count: u32,
        direction_offset: i32,
    ) -> AutofocusResult<()> {
        let step = self.settings.step_size;
        if direction_offset != 0 {
            self.move_relative(direction_offset * step).await?;
        }

        for i in 0..count {
            self.check_cancelled()?;
            let sample = self.averaged_measurement().await?;
            store.insert(sample);
            *fits = CurveFits::calculate(store, self.settings.detection_method);

            tracing::info!(
                "Focus point at {}: measure {:.3} ± {:.3} ({} samples)",
                sample.position,
                sample.measure,
                sample.uncertainty,
                store.len()
            );
            if let Some(cb) = self.progress {
                let expected = 2 * self.settings.offset_steps as usize + 1;
                self.progress_pct = (store.len() as f64 / expected as f64 * 80.0).min(90.0);
                cb(
                    self.progress_pct,
                    format!("Point {} at {}: {:.2}", store.len(), sample.position, sample.measure),
                );
            }

            if i + 1 < count {
                self.move_relative(-step).await?;
            }
        }
        Ok(())
    }

    /// First pass: out by `offset_steps`, then back across the start position
    pub async fn initial_pass(
        &mut self,
        store: &mut FocusSampleStore,
        fits: &mut CurveFits,
    ) -> AutofocusResult<()> {
        let offset = self.settings.offset_steps;
        self.collect_points(store, fits, offset + 1, offset as i32).await
    }

    /// One expansion step for [`ExpansionPhase::ExpandLeft`] or
    /// [`ExpansionPhase::ExpandRight`]; other phases are no-ops
    pub async fn expand(
        &mut self,
        phase: ExpansionPhase,
        store: &mut FocusSampleStore,
        fits: &mut CurveFits,
    ) -> AutofocusResult<()> {
        let (edge, direction) = match phase {
            ExpansionPhase::ExpandLeft => (store.leftmost().map(|s| s.position), -1),
            ExpansionPhase::ExpandRight => (store.rightmost().map(|s| s.position), 1),
            _ => return Ok(()),
        };
        tracing::debug!("Expanding {:?} from {:?}", phase, edge);

        if let Some(edge) = edge {
            if self.position != edge {
                self.move_absolute(edge).await?;
            }
        }
        self.collect_points(store, fits, 1, direction).await
    }
}

/// Combine repeated measurements: mean of values, RMS of uncertainties
pub fn aggregate(position: i32, measurements: &[Measurement]) -> FocusSample {
    if measurements.is_empty() {
        return FocusSample::new(position, 0.0, NO_DETECTION_UNCERTAINTY);
    }
    let n = measurements.len() as f64;
    let measure = measurements.iter().map(|m| m.value).sum::<f64>() / n;
    let variance = measurements.iter().map(|m| m.uncertainty * m.uncertainty).sum::<f64>() / n;

    let uncertainty = if measure == 0.0 {
        NO_DETECTION_UNCERTAINTY
    } else {
        variance.sqrt()
    };
    FocusSample::new(position, measure, uncertainty)
}
