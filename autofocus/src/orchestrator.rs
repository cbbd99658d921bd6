//! Autofocus run orchestration
//!
//! [`AutofocusEngine::run`] sequences one run through its states:
//!
//! ```text
//! Idle → Initializing → Sampling → Expanding → Fitting → Validating
//!      → {Accepted | Retrying | Aborted} → Restoring → Done
//! ```
//!
//! Whatever the outcome, the equipment changes made while initializing are undone in
//! `Restoring`. Restoration is best-effort: failures there are logged and never replace
//! the run's own result.

use crate::config::{AutofocusSettings, DetectionMethod, FittingMode};
use crate::device_ops::{AutofocusDevices, CancellationToken, FilterInfo, ReportSink};
use crate::error::{AutofocusError, AutofocusResult, ValidationRejection};
use crate::fitting::{CurveFits, FitPoint};
use crate::report::AutofocusReport;
use crate::sample::{FocusSample, FocusSampleStore};
use crate::sampling::{next_phase, ExpansionPhase, ProgressCallback, SamplingController};
use crate::validator::{validate, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Initializing,
    Sampling,
    Expanding,
    Fitting,
    Validating,
    Accepted,
    Retrying,
    Aborted,
    Restoring,
    Done,
}

/// State of one autofocus invocation
#[derive(Debug, Clone)]
pub struct AutofocusRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub fitting_mode: FittingMode,
    pub detection_method: DetectionMethod,
    pub state: RunState,
    /// Every state entered, in order
    pub history: Vec<RunState>,
    pub initial_position: Option<i32>,
    pub baseline: Option<FocusSample>,
    pub store: FocusSampleStore,
    pub fits: CurveFits,
    pub attempt: u32,
    pub rejections: Vec<ValidationRejection>,
    pub final_point: Option<FitPoint>,
    pub final_position: Option<i32>,
    pub final_measurement: Option<FocusSample>,
    pub temperature: Option<f64>,
    pub filter: Option<FilterInfo>,
}

impl AutofocusRun {
    fn new(settings: &AutofocusSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            fitting_mode: settings.fitting_mode,
            detection_method: settings.detection_method,
            state: RunState::Idle,
            history: vec![RunState::Idle],
            initial_position: None,
            baseline: None,
            store: FocusSampleStore::new(),
            fits: CurveFits::default(),
            attempt: 0,
            rejections: Vec::new(),
            final_point: None,
            final_position: None,
            final_measurement: None,
            temperature: None,
            filter: None,
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!("Autofocus {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Drop the samples and fits of a rejected attempt
    fn reset_samples(&mut self) {
        self.store.clear();
        self.fits.clear();
    }

    fn report(&self, duration: Duration) -> Option<AutofocusReport> {
        Some(AutofocusReport {
            id: self.id,
            timestamp: self.started_at,
            detection_method: self.detection_method,
            fitting_mode: self.fitting_mode,
            initial_position: self.initial_position?,
            baseline: self.baseline?,
            final_point: self.final_point?,
            final_position: self.final_position?,
            final_measurement: self.final_measurement,
            temperature: self.temperature,
            filter: self.filter.clone(),
            attempts: self.attempt,
            samples: self.store.samples().to_vec(),
            fits: self.fits.clone(),
            duration_secs: duration.as_secs_f64(),
        })
    }
}

/// Equipment changes made while initializing, undone while restoring
#[derive(Debug, Clone, Default)]
struct EquipmentChanges {
    initial_position: Option<i32>,
    temp_comp_disabled: bool,
    guiding_stopped: bool,
    previous_subsample: Option<Option<f64>>,
    original_filter: Option<FilterInfo>,
    /// The focuser sits at an accepted focus point and must not be moved back
    focuser_parked: bool,
}

/// Runs autofocus against a set of devices
pub struct AutofocusEngine {
    devices: AutofocusDevices,
    settings: AutofocusSettings,
    report_sink: Option<Arc<dyn ReportSink>>,
}

impl AutofocusEngine {
    pub fn new(devices: AutofocusDevices, settings: AutofocusSettings) -> AutofocusResult<Self> {
        settings.validate()?;
        Ok(Self {
            devices,
            settings,
            report_sink: None,
        })
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report_sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &AutofocusSettings {
        &self.settings
    }

    /// Run autofocus; returns the report of an accepted run
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> AutofocusResult<AutofocusReport> {
        self.run_tracked(cancel, progress).await.0
    }

    /// Like [`run`](Self::run), also handing back the final run state
    pub async fn run_tracked(
        &self,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> (AutofocusResult<AutofocusReport>, AutofocusRun) {
        let started = Instant::now();
        let mut run = AutofocusRun::new(&self.settings);
        let mut changes = EquipmentChanges::default();

        tracing::info!(
            "Starting autofocus {}: {:?} fit, {:?}, {} offset steps of {}, {} exposure(s) of {}s per point",
            run.id,
            self.settings.fitting_mode,
            self.settings.detection_method,
            self.settings.offset_steps,
            self.settings.step_size,
            self.settings.exposures_per_point,
            self.settings.exposure_duration
        );
        if let Some(cb) = progress {
            cb(0.0, "Starting autofocus".to_string());
        }

        let mut sampler = SamplingController::new(&self.devices, &self.settings, cancel, progress);
        let outcome = self.execute(&mut run, &mut changes, &mut sampler).await;

        if outcome.is_err() && run.state != RunState::Aborted {
            run.transition(RunState::Aborted);
        }
        run.transition(RunState::Restoring);
        self.restore(&changes).await;
        run.transition(RunState::Done);

        let result = match outcome {
            Ok(()) => match run.report(started.elapsed()) {
                Some(report) => {
                    tracing::info!(
                        "Autofocus complete: position {}, measure {:.3} after {} attempt(s)",
                        report.final_position,
                        report.final_point.value,
                        report.attempts
                    );
                    self.publish(&report).await;
                    if let Some(cb) = progress {
                        cb(100.0, format!("Autofocus complete: position {}", report.final_position));
                    }
                    Ok(report)
                }
                None => Err(AutofocusError::Report(
                    "accepted run is missing its final point".to_string(),
                )),
            },
            Err(e) => {
                if e.is_cancellation() {
                    tracing::info!("Autofocus cancelled, equipment restored");
                } else {
                    tracing::error!("Autofocus failed: {}", e);
                }
                if let Some(cb) = progress {
                    cb(100.0, format!("Autofocus failed: {}", e));
                }
                Err(e)
            }
        };

        (result, run)
    }

    async fn execute(
        &self,
        run: &mut AutofocusRun,
        changes: &mut EquipmentChanges,
        sampler: &mut SamplingController<'_>,
    ) -> AutofocusResult<()> {
        run.transition(RunState::Initializing);
        let position = sampler.read_position().await?;
        changes.initial_position = Some(position);

        self.prepare_equipment(run, changes, sampler).await?;

        // filter offsets may have moved the focuser
        let initial = sampler.read_position().await?;
        changes.initial_position = Some(initial);
        run.initial_position = Some(initial);

        let focuser = self.devices.focuser.clone();
        run.temperature = match sampler.guarded("focuser temperature", focuser.get_temperature()).await {
            Ok(temperature) => temperature,
            Err(AutofocusError::Cancelled) => return Err(AutofocusError::Cancelled),
            Err(e) => {
                tracing::warn!("Could not read focuser temperature: {}", e);
                None
            }
        };

        if let Some(cb) = sampler.progress() {
            cb(2.0, format!("Measuring baseline at {}", initial));
        }
        let baseline = sampler.averaged_measurement().await?;
        tracing::info!(
            "Baseline at {}: {:.3} ± {:.3}",
            initial,
            baseline.measure,
            baseline.uncertainty
        );
        run.baseline = Some(baseline);

        let offset = self.settings.offset_steps as usize;
        loop {
            run.attempt += 1;
            tracing::info!("Autofocus attempt {}/{}", run.attempt, self.settings.max_attempts);

            run.transition(RunState::Sampling);
            sampler.initial_pass(&mut run.store, &mut run.fits).await?;

            run.transition(RunState::Expanding);
            loop {
                match next_phase(&run.store, run.fits.trendline.as_ref(), offset) {
                    ExpansionPhase::Converged => break,
                    ExpansionPhase::Degenerate => {
                        let pivot = run.fits.trendline.as_ref().map(|t| t.pivot_position());
                        tracing::warn!(
                            "No sharpness variation in {} samples, aborting autofocus",
                            run.store.len()
                        );
                        run.transition(RunState::Aborted);
                        return Err(AutofocusError::DegenerateSignal {
                            samples: run.store.len(),
                            pivot,
                        });
                    }
                    ExpansionPhase::Initial => {
                        sampler.initial_pass(&mut run.store, &mut run.fits).await?;
                    }
                    phase => sampler.expand(phase, &mut run.store, &mut run.fits).await?,
                }
            }

            run.transition(RunState::Fitting);
            run.fits = CurveFits::calculate(&run.store, self.settings.detection_method);
            for fit in run.fits.computed() {
                tracing::debug!(
                    "{} fit: extremum {:?}, R² {:.4}",
                    fit.model().name(),
                    fit.extremum(),
                    fit.goodness_of_fit()
                );
            }

            run.transition(RunState::Validating);
            let verdict = validate(&self.settings, &run.fits, &run.store, &baseline, sampler).await?;
            match verdict {
                Verdict::Accepted { point, measurement } => {
                    run.transition(RunState::Accepted);
                    changes.focuser_parked = true;
                    run.final_point = Some(point);
                    run.final_position = Some(sampler.position());
                    run.final_measurement = measurement;
                    return Ok(());
                }
                Verdict::Rejected(reason) => {
                    tracing::warn!("Autofocus attempt {} rejected: {}", run.attempt, reason);
                    run.rejections.push(reason.clone());

                    if run.attempt >= self.settings.max_attempts {
                        run.transition(RunState::Aborted);
                        return Err(AutofocusError::AttemptsExhausted {
                            attempts: run.attempt,
                            reason: reason.to_string(),
                        });
                    }

                    run.transition(RunState::Retrying);
                    run.reset_samples();
                    sampler.move_absolute(initial).await?;
                }
            }
        }
    }

    /// Put the equipment into autofocus configuration, recording every change
    async fn prepare_equipment(
        &self,
        run: &mut AutofocusRun,
        changes: &mut EquipmentChanges,
        sampler: &mut SamplingController<'_>,
    ) -> AutofocusResult<()> {
        let focuser = self.devices.focuser.clone();
        if sampler
            .guarded("temperature compensation", focuser.temp_comp_enabled())
            .await?
        {
            // recorded first: a cancelled call may already have reached the focuser
            changes.temp_comp_disabled = true;
            sampler
                .guarded("temperature compensation", focuser.set_temp_comp(false))
                .await?;
            tracing::info!("Temperature compensation disabled for autofocus");
        }

        if self.settings.stop_guiding {
            match &self.devices.guider {
                Some(guider) => {
                    let guider = guider.clone();
                    // not raced against cancellation, whether guiding stopped must be known
                    changes.guiding_stopped = guider
                        .stop_guiding()
                        .await
                        .map_err(|e| AutofocusError::hardware("stop guiding", e))?;
                    sampler.check_cancelled()?;
                    if changes.guiding_stopped {
                        tracing::info!("Guiding stopped for autofocus");
                    }
                }
                None => tracing::warn!("Stop guiding requested but no guider is connected"),
            }
        }

        if let Some(ratio) = self.settings.subsample_ratio {
            let camera = self.devices.camera.clone();
            let previous = sampler.guarded("sub-sampling", camera.subsample()).await?;
            changes.previous_subsample = Some(previous);
            sampler
                .guarded("sub-sampling", camera.set_subsample(Some(ratio)))
                .await?;
        }

        if let Some(wheel) = &self.devices.filter_wheel {
            let wheel = wheel.clone();
            let current = sampler.guarded("filter wheel", wheel.current_filter()).await?;
            run.filter = current.clone();

            if let Some(name) = &self.settings.autofocus_filter {
                let filters = sampler.guarded("filter wheel", wheel.filters()).await?;
                match filters.iter().find(|f| f.name.eq_ignore_ascii_case(name)) {
                    Some(target) if current.as_ref() != Some(target) => {
                        changes.original_filter = current.clone();
                        let selected = sampler
                            .guarded("filter change", wheel.change_filter(target))
                            .await?;
                        tracing::info!("Switched to autofocus filter {}", selected.name);
                        run.filter = Some(selected);
                    }
                    Some(_) => {}
                    None => tracing::warn!("Autofocus filter '{}' is not installed", name),
                }
            }
        }

        Ok(())
    }

    /// Undo equipment changes; never fails
    async fn restore(&self, changes: &EquipmentChanges) {
        if !changes.focuser_parked {
            if let Some(position) = changes.initial_position {
                match self.devices.focuser.move_absolute(position).await {
                    Ok(reached) => tracing::info!("Focuser restored to {}", reached),
                    Err(e) => tracing::warn!("Failed to restore focuser to {}: {}", position, e),
                }
            }
        }

        if changes.temp_comp_disabled {
            if let Err(e) = self.devices.focuser.set_temp_comp(true).await {
                tracing::warn!("Failed to re-enable temperature compensation: {}", e);
            }
        }

        if let Some(previous) = changes.previous_subsample {
            if let Err(e) = self.devices.camera.set_subsample(previous).await {
                tracing::warn!("Failed to restore sub-sampling: {}", e);
            }
        }

        if let (Some(filter), Some(wheel)) = (&changes.original_filter, &self.devices.filter_wheel) {
            match wheel.change_filter(filter).await {
                Ok(selected) => tracing::info!("Filter restored to {}", selected.name),
                Err(e) => tracing::warn!("Failed to restore filter {}: {}", filter.name, e),
            }
        }

        if changes.guiding_stopped {
            if let Some(guider) = &self.devices.guider {
                let limit = self.settings.timeouts.guider_resume_timeout();
                match timeout(limit, guider.start_guiding()).await {
                    Ok(Ok(true)) => tracing::info!("Guiding resumed"),
                    Ok(Ok(false)) => tracing::warn!("Guiding did not resume after autofocus"),
                    Ok(Err(e)) => tracing::warn!("Failed to resume guiding: {}", e),
                    Err(_) => tracing::warn!("Guiding did not resume within {:?}", limit),
                }
            }
        }
    }

    async fn publish(&self, report: &AutofocusReport) {
        if let Some(sink) = &self.report_sink {
            if let Err(e) = sink.publish(report).await {
                tracing::warn!("Failed to publish autofocus report: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ops::new_cancellation_token;
    use crate::testing::{
        CollectingSink, CurveCamera, RecordingFilterWheel, RecordingGuider, ScriptedFocuser,
    };
    use std::sync::Mutex;

    fn settings(mode: FittingMode, offset_steps: u32) -> AutofocusSettings {
        AutofocusSettings {
            fitting_mode: mode,
            offset_steps,
            step_size: 100,
            settle_time_ms: 0,
            r_squared_threshold: 0.9,
            ..AutofocusSettings::default()
        }
    }

    fn hyperbola(x: i32) -> f64 {
        let t = (x - 4900) as f64 / 150.0;
        1.5 * (1.0 + t * t).sqrt()
    }

    #[tokio::test]
    async fn test_trendline_run_accepts_intersection() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        let sink = Arc::new(CollectingSink::default());
        let devices = AutofocusDevices::new(focuser.clone(), camera.clone());
        let engine = AutofocusEngine::new(devices, settings(FittingMode::Trendlines, 5))
            .unwrap()
            .with_report_sink(sink.clone());

        let cancel = new_cancellation_token();
        let (result, run) = engine.run_tracked(&cancel, None).await;
        let report = result.unwrap();

        // initial pass goes out to 5500 and samples back down to 5000
        assert_eq!(&focuser.moves()[..6], &[5500, 5400, 5300, 5200, 5100, 5000]);
        assert!((report.baseline.measure - 4.0).abs() < 1e-9);
        assert_eq!(report.initial_position, 5000);
        assert_eq!(report.final_position, 4800);
        assert_eq!(focuser.position(), 4800);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.samples.first().map(|s| s.position), Some(4300));
        assert_eq!(report.samples.last().map(|s| s.position), Some(5500));

        let trend = report.fits.trendline.as_ref().unwrap();
        assert!(trend.left.r_squared >= 0.9 && trend.right.r_squared >= 0.9);
        assert!(report.fits.gaussian.is_none());

        assert_eq!(
            run.history,
            vec![
                RunState::Idle,
                RunState::Initializing,
                RunState::Sampling,
                RunState::Expanding,
                RunState::Fitting,
                RunState::Validating,
                RunState::Accepted,
                RunState::Restoring,
                RunState::Done,
            ]
        );
        assert_eq!(sink.reports().len(), 1);
        assert_eq!(sink.reports()[0].id, report.id);
    }

    #[tokio::test]
    async fn test_poor_fit_retries_from_initial_position() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::new(focuser.clone(), hyperbola));
        // baseline, then a zigzag first attempt: 5300..5000, then 4900..4600
        camera.queue_values(&[4.0, 3.0, 6.0, 2.5, 6.5, 2.0, 5.0, 2.4, 6.0]);

        let devices = AutofocusDevices::new(focuser.clone(), camera.clone());
        let engine = AutofocusEngine::new(
            devices,
            AutofocusSettings {
                r_squared_threshold: 0.8,
                max_attempts: 2,
                ..settings(FittingMode::Hyperbolic, 3)
            },
        )
        .unwrap();

        let cancel = new_cancellation_token();
        let (result, run) = engine.run_tracked(&cancel, None).await;
        let report = result.unwrap();

        assert_eq!(run.attempt, 2);
        assert!(matches!(
            run.rejections.as_slice(),
            [ValidationRejection::PoorFit { model: "Hyperbolic", .. }]
        ));
        assert!(run.history.contains(&RunState::Retrying));

        // back to 5000 after the rejected attempt, then out again to 5300
        let moves = focuser.moves();
        let retry = moves.windows(3).position(|w| w == [4600, 5000, 5300]);
        assert!(retry.is_some(), "moves: {:?}", moves);

        // only the second attempt's samples survive
        assert_eq!(report.samples.len(), 8);
        assert!((report.final_position - 4900).abs() <= 2);
        assert!(report.fits.hyperbolic.as_ref().unwrap().r_squared > 0.99);
    }

    #[tokio::test]
    async fn test_attempts_exhausted_restores_focuser() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::new(focuser.clone(), hyperbola));
        camera.queue_values(&[4.0, 3.0, 6.0, 2.5, 6.5, 2.0, 5.0, 2.4, 6.0]);

        let devices = AutofocusDevices::new(focuser.clone(), camera);
        let engine = AutofocusEngine::new(
            devices,
            AutofocusSettings {
                r_squared_threshold: 0.8,
                max_attempts: 1,
                ..settings(FittingMode::Hyperbolic, 3)
            },
        )
        .unwrap();

        let cancel = new_cancellation_token();
        let (result, run) = engine.run_tracked(&cancel, None).await;
        assert!(matches!(
            result,
            Err(AutofocusError::AttemptsExhausted { attempts: 1, .. })
        ));
        assert_eq!(focuser.position(), 5000);
        assert!(!run.history.contains(&RunState::Retrying));
        assert_eq!(
            &run.history[run.history.len() - 3..],
            &[RunState::Aborted, RunState::Restoring, RunState::Done]
        );
    }

    #[tokio::test]
    async fn test_no_stars_aborts_without_retry() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::flat(focuser.clone(), 0.0));
        let sink = Arc::new(CollectingSink::default());
        let devices = AutofocusDevices::new(focuser.clone(), camera.clone());
        let engine = AutofocusEngine::new(
            devices,
            AutofocusSettings {
                max_attempts: 3,
                ..settings(FittingMode::Trendlines, 5)
            },
        )
        .unwrap()
        .with_report_sink(sink.clone());

        let cancel = new_cancellation_token();
        let (result, run) = engine.run_tracked(&cancel, None).await;

        assert_eq!(
            result.unwrap_err(),
            AutofocusError::DegenerateSignal {
                samples: 6,
                pivot: None
            }
        );
        assert_eq!(run.store.len(), 6);
        assert!(run.store.samples().iter().all(|s| s.uncertainty == 1000.0));
        assert_eq!(run.attempt, 1);
        assert_eq!(focuser.position(), 5000);
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_flat_signal_terminates_in_one_pass() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::flat(focuser.clone(), 3.2));
        let devices = AutofocusDevices::new(focuser.clone(), camera.clone());
        let engine = AutofocusEngine::new(devices, settings(FittingMode::Hyperbolic, 4)).unwrap();

        let cancel = new_cancellation_token();
        let result = engine.run(&cancel, None).await;

        assert!(matches!(result, Err(AutofocusError::DegenerateSignal { samples: 5, .. })));
        // baseline plus the five points of the initial pass
        assert_eq!(camera.capture_calls(), 6);
        assert_eq!(focuser.position(), 5000);
    }

    #[tokio::test]
    async fn test_cancellation_restores_all_equipment() {
        let focuser = Arc::new(ScriptedFocuser::new(5000).with_temp_comp());
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        let wheel = Arc::new(RecordingFilterWheel::new(&["L", "R", "G", "B", "Ha"], 4));
        let guider = Arc::new(RecordingGuider::new());
        let cancel = new_cancellation_token();
        camera.cancel_after(3, cancel.clone());

        let devices = AutofocusDevices::new(focuser.clone(), camera.clone())
            .with_filter_wheel(wheel.clone())
            .with_guider(guider.clone());
        let engine = AutofocusEngine::new(
            devices,
            AutofocusSettings {
                autofocus_filter: Some("L".to_string()),
                stop_guiding: true,
                subsample_ratio: Some(0.5),
                ..settings(FittingMode::Trendlines, 5)
            },
        )
        .unwrap();

        let (result, run) = engine.run_tracked(&cancel, None).await;

        assert_eq!(result.unwrap_err(), AutofocusError::Cancelled);
        assert_eq!(focuser.position(), 5000);
        assert_eq!(focuser.temp_comp_changes(), vec![false, true]);
        assert_eq!(camera.subsample_changes(), vec![Some(0.5), None]);
        assert_eq!(wheel.changes(), vec!["L".to_string(), "Ha".to_string()]);
        assert_eq!(wheel.current().name, "Ha");
        assert_eq!(guider.stops(), 1);
        assert_eq!(guider.starts(), 1);
        assert!(run.history.ends_with(&[RunState::Aborted, RunState::Restoring, RunState::Done]));
    }

    #[tokio::test]
    async fn test_cancel_during_filter_switch_restores_filter() {
        let focuser = Arc::new(ScriptedFocuser::new(5000).with_temp_comp());
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        let wheel = Arc::new(RecordingFilterWheel::new(&["L", "R", "G", "B", "Ha"], 4));
        let cancel = new_cancellation_token();
        wheel.cancel_while_switching(cancel.clone(), Duration::from_millis(300));

        let devices = AutofocusDevices::new(focuser.clone(), camera.clone()).with_filter_wheel(wheel.clone());
        let engine = AutofocusEngine::new(
            devices,
            AutofocusSettings {
                autofocus_filter: Some("L".to_string()),
                ..settings(FittingMode::Trendlines, 5)
            },
        )
        .unwrap();

        let result = engine.run(&cancel, None).await;

        assert_eq!(result.unwrap_err(), AutofocusError::Cancelled);
        assert_eq!(wheel.changes(), vec!["L".to_string(), "Ha".to_string()]);
        assert_eq!(wheel.current().name, "Ha");
        assert_eq!(focuser.temp_comp_changes(), vec![false, true]);
        assert_eq!(camera.capture_calls(), 0);
    }

    #[tokio::test]
    async fn test_hardware_fault_aborts_and_restores() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        // out to 5500, down to 5400, then the third move fails
        focuser.fail_move(3);

        let devices = AutofocusDevices::new(focuser.clone(), camera);
        let engine = AutofocusEngine::new(devices, settings(FittingMode::Trendlines, 5)).unwrap();

        let cancel = new_cancellation_token();
        let result = engine.run(&cancel, None).await;

        match result {
            Err(AutofocusError::Hardware { operation, message }) => {
                assert_eq!(operation, "focuser move");
                assert_eq!(message, "focuser not responding");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(focuser.position(), 5000);
    }

    #[tokio::test]
    async fn test_exposure_timeout_is_a_hardware_fault() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        camera.hang();

        let mut settings = settings(FittingMode::Trendlines, 5);
        settings.exposure_duration = 0.0;
        settings.timeouts.exposure_margin_secs = 0;
        let engine = AutofocusEngine::new(AutofocusDevices::new(focuser.clone(), camera.clone()), settings).unwrap();

        let cancel = new_cancellation_token();
        let err = engine.run(&cancel, None).await.unwrap_err();

        assert!(matches!(err, AutofocusError::ExposureTimeout { .. }));
        assert!(err.is_hardware_fault());
        assert_eq!(camera.aborts(), 1);
        assert_eq!(focuser.position(), 5000);
    }

    #[tokio::test]
    async fn test_slow_guider_does_not_block_completion() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        let guider = Arc::new(RecordingGuider::slow(Duration::from_secs(30)));
        let devices = AutofocusDevices::new(focuser.clone(), camera).with_guider(guider.clone());

        let mut settings = settings(FittingMode::Trendlines, 5);
        settings.stop_guiding = true;
        settings.timeouts.guider_resume_secs = 0;
        let engine = AutofocusEngine::new(devices, settings).unwrap();

        let cancel = new_cancellation_token();
        let report = engine.run(&cancel, None).await.unwrap();

        assert_eq!(report.final_position, 4800);
        assert_eq!(guider.starts(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_result() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        let sink = Arc::new(CollectingSink::failing());
        let engine = AutofocusEngine::new(
            AutofocusDevices::new(focuser.clone(), camera),
            settings(FittingMode::Trendlines, 5),
        )
        .unwrap()
        .with_report_sink(sink);

        let cancel = new_cancellation_token();
        assert!(engine.run(&cancel, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_contrast_run_uses_gaussian_peak() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::new(focuser.clone(), |x| {
            let d = (x - 5050) as f64;
            10.0 + 40.0 * (-(d * d) / (2.0 * 200.0 * 200.0)).exp()
        }));
        let devices = AutofocusDevices::new(focuser.clone(), camera);
        let engine = AutofocusEngine::new(
            devices,
            AutofocusSettings {
                detection_method: DetectionMethod::ContrastDetection,
                ..settings(FittingMode::Hyperbolic, 5)
            },
        )
        .unwrap();

        let cancel = new_cancellation_token();
        let report = engine.run(&cancel, None).await.unwrap();

        assert!((report.final_position - 5050).abs() <= 1);
        assert!(report.final_measurement.is_none());
        assert!(report.fits.gaussian.is_some());
        assert!(report.fits.hyperbolic.is_none());
        assert_eq!(focuser.position(), report.final_position);
    }

    #[tokio::test]
    async fn test_progress_reported() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::v_curve(focuser.clone(), 4800, 2.0, 0.01));
        let engine = AutofocusEngine::new(
            AutofocusDevices::new(focuser, camera),
            settings(FittingMode::Trendlines, 5),
        )
        .unwrap();

        let seen = Mutex::new(Vec::new());
        let callback: &(dyn Fn(f64, String) + Send + Sync) =
            &|pct: f64, message: String| seen.lock().unwrap().push((pct, message));
        let cancel = new_cancellation_token();
        engine.run(&cancel, Some(callback)).await.unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first().map(|s| s.0), Some(0.0));
        assert_eq!(seen.last().map(|s| s.0), Some(100.0));
        assert!(seen.iter().any(|(_, m)| m.starts_with("Point")));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let focuser = Arc::new(ScriptedFocuser::new(5000));
        let camera = Arc::new(CurveCamera::flat(focuser.clone(), 2.0));
        let mut settings = settings(FittingMode::Trendlines, 5);
        settings.max_attempts = 0;
        assert!(matches!(
            AutofocusEngine::new(AutofocusDevices::new(focuser, camera), settings),
            Err(AutofocusError::InvalidSettings(_))
        ));
    }
}
