//! Scripted fake devices for engine tests

use crate::config::DetectionMethod;
use crate::device_ops::{
    CancellationToken, DeviceResult, ExposureHandle, ExposureParams, FilterInfo, FilterWheel,
    Focuser, Guider, Measurement, MeasurementSource, ReportSink,
};
use crate::report::AutofocusReport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Focuser that moves instantly and records every position it was sent to
pub struct ScriptedFocuser {
    position: Mutex<i32>,
    moves: Mutex<Vec<i32>>,
    temp_comp: AtomicBool,
    temp_comp_changes: Mutex<Vec<bool>>,
    move_attempts: AtomicUsize,
    failing_move: Mutex<Option<usize>>,
    pub temperature: Option<f64>,
}

impl ScriptedFocuser {
    pub fn new(position: i32) -> Self {
        Self {
            position: Mutex::new(position),
            moves: Mutex::new(Vec::new()),
            temp_comp: AtomicBool::new(false),
            temp_comp_changes: Mutex::new(Vec::new()),
            move_attempts: AtomicUsize::new(0),
            failing_move: Mutex::new(None),
            temperature: Some(4.5),
        }
    }

    pub fn with_temp_comp(self) -> Self {
        self.temp_comp.store(true, Ordering::SeqCst);
        self
    }

    pub fn position(&self) -> i32 {
        *self.position.lock().unwrap()
    }

    pub fn moves(&self) -> Vec<i32> {
        self.moves.lock().unwrap().clone()
    }

    pub fn temp_comp_changes(&self) -> Vec<bool> {
        self.temp_comp_changes.lock().unwrap().clone()
    }

    /// The `n`th move request (1-based) fails; later moves succeed again
    pub fn fail_move(&self, n: usize) {
        *self.failing_move.lock().unwrap() = Some(n);
    }

    fn go_to(&self, target: i32) -> DeviceResult<i32> {
        let attempt = self.move_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.failing_move.lock().unwrap() == Some(attempt) {
            return Err("focuser not responding".to_string());
        }
        self.moves.lock().unwrap().push(target);
        *self.position.lock().unwrap() = target;
        Ok(target)
    }
}

#[async_trait]
impl Focuser for ScriptedFocuser {
    async fn get_position(&self) -> DeviceResult<i32> {
        Ok(self.position())
    }

    async fn move_relative(&self, steps: i32) -> DeviceResult<i32> {
        let target = self.position() + steps;
        self.go_to(target)
    }

    async fn move_absolute(&self, position: i32) -> DeviceResult<i32> {
        self.go_to(position)
    }

    async fn get_temperature(&self) -> DeviceResult<Option<f64>> {
        Ok(self.temperature)
    }

    async fn temp_comp_enabled(&self) -> DeviceResult<bool> {
        Ok(self.temp_comp.load(Ordering::SeqCst))
    }

    async fn set_temp_comp(&self, enabled: bool) -> DeviceResult<()> {
        self.temp_comp.store(enabled, Ordering::SeqCst);
        self.temp_comp_changes.lock().unwrap().push(enabled);
        Ok(())
    }
}

type Curve = Box<dyn Fn(i32) -> f64 + Send + Sync>;

/// Camera whose measurement is a function of the focuser position, optionally
/// preceded by a queue of scripted values
pub struct CurveCamera {
    focuser: Arc<ScriptedFocuser>,
    curve: Curve,
    uncertainty: f64,
    script: Mutex<VecDeque<f64>>,
    dropped_images: AtomicU32,
    captures: AtomicU32,
    aborts: AtomicU32,
    next_id: AtomicU64,
    hang: AtomicBool,
    subsample: Mutex<Option<f64>>,
    subsample_changes: Mutex<Vec<Option<f64>>>,
    cancel_after: Mutex<Option<(u32, CancellationToken)>>,
}

impl CurveCamera {
    pub fn new(focuser: Arc<ScriptedFocuser>, curve: impl Fn(i32) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            focuser,
            curve: Box::new(curve),
            uncertainty: 0.05,
            script: Mutex::new(VecDeque::new()),
            dropped_images: AtomicU32::new(0),
            captures: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            hang: AtomicBool::new(false),
            subsample: Mutex::new(None),
            subsample_changes: Mutex::new(Vec::new()),
            cancel_after: Mutex::new(None),
        }
    }

    /// `min + |x - center| * slope`
    pub fn v_curve(focuser: Arc<ScriptedFocuser>, center: i32, min: f64, slope: f64) -> Self {
        Self::new(focuser, move |x| min + (x - center).abs() as f64 * slope)
    }

    pub fn flat(focuser: Arc<ScriptedFocuser>, value: f64) -> Self {
        Self::new(focuser, move |_| value)
    }

    /// Values returned by the next measurements, before falling back to the curve
    pub fn queue_values(&self, values: &[f64]) {
        self.script.lock().unwrap().extend(values.iter().copied());
    }

    /// The next `count` captures return no image
    pub fn drop_images(&self, count: u32) {
        self.dropped_images.store(count, Ordering::SeqCst);
    }

    /// Captures never complete
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Set the token once `captures` exposures have been taken
    pub fn cancel_after(&self, captures: u32, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((captures, token));
    }

    pub fn capture_calls(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn subsample_changes(&self) -> Vec<Option<f64>> {
        self.subsample_changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeasurementSource for CurveCamera {
    async fn capture(&self, _params: &ExposureParams) -> DeviceResult<Option<ExposureHandle>> {
        let taken = self.captures.fetch_add(1, Ordering::SeqCst) + 1;

        let cancel_after = self.cancel_after.lock().unwrap().clone();
        if let Some((after, token)) = cancel_after {
            if taken > after {
                token.store(true, Ordering::SeqCst);
            }
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let dropped = self.dropped_images.load(Ordering::SeqCst);
        if dropped > 0 {
            self.dropped_images.store(dropped - 1, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(Some(ExposureHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }))
    }

    async fn measure(&self, _exposure: &ExposureHandle, _method: DetectionMethod) -> DeviceResult<Measurement> {
        let scripted = self.script.lock().unwrap().pop_front();
        let value = scripted.unwrap_or_else(|| (self.curve)(self.focuser.position()));
        Ok(Measurement {
            value,
            uncertainty: if value == 0.0 { 0.0 } else { self.uncertainty },
            star_count: Some(if value == 0.0 { 0 } else { 40 }),
        })
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subsample(&self) -> DeviceResult<Option<f64>> {
        Ok(*self.subsample.lock().unwrap())
    }

    async fn set_subsample(&self, ratio: Option<f64>) -> DeviceResult<()> {
        *self.subsample.lock().unwrap() = ratio;
        self.subsample_changes.lock().unwrap().push(ratio);
        Ok(())
    }
}

pub struct RecordingFilterWheel {
    current: Mutex<FilterInfo>,
    filters: Vec<FilterInfo>,
    changes: Mutex<Vec<String>>,
    slow_change: Mutex<Option<(CancellationToken, Duration)>>,
}

impl RecordingFilterWheel {
    pub fn new(names: &[&str], current: usize) -> Self {
        let filters: Vec<FilterInfo> = names
            .iter()
            .enumerate()
            .map(|(i, name)| FilterInfo {
                name: name.to_string(),
                position: i as i32,
            })
            .collect();
        Self {
            current: Mutex::new(filters[current].clone()),
            filters,
            changes: Mutex::new(Vec::new()),
            slow_change: Mutex::new(None),
        }
    }

    /// The next change lands on the wheel, sets the token, then takes `delay` to report back
    pub fn cancel_while_switching(&self, token: CancellationToken, delay: Duration) {
        *self.slow_change.lock().unwrap() = Some((token, delay));
    }

    pub fn current(&self) -> FilterInfo {
        self.current.lock().unwrap().clone()
    }

    pub fn changes(&self) -> Vec<String> {
        self.changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl FilterWheel for RecordingFilterWheel {
    async fn current_filter(&self) -> DeviceResult<Option<FilterInfo>> {
        Ok(Some(self.current()))
    }

    async fn filters(&self) -> DeviceResult<Vec<FilterInfo>> {
        Ok(self.filters.clone())
    }

    async fn change_filter(&self, filter: &FilterInfo) -> DeviceResult<FilterInfo> {
        *self.current.lock().unwrap() = filter.clone();
        self.changes.lock().unwrap().push(filter.name.clone());

        let slow = self.slow_change.lock().unwrap().take();
        if let Some((token, delay)) = slow {
            token.store(true, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
        }
        Ok(filter.clone())
    }
}

pub struct RecordingGuider {
    stops: AtomicU32,
    starts: AtomicU32,
    resume_delay: Option<Duration>,
}

impl RecordingGuider {
    pub fn new() -> Self {
        Self {
            stops: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            resume_delay: None,
        }
    }

    /// Guider whose resume takes `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            resume_delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Guider for RecordingGuider {
    async fn stop_guiding(&self) -> DeviceResult<bool> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn start_guiding(&self) -> DeviceResult<bool> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.resume_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(true)
    }
}

#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<AutofocusReport>>,
    fail: bool,
}

impl CollectingSink {
    /// Sink whose every publish fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn reports(&self) -> Vec<AutofocusReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for CollectingSink {
    async fn publish(&self, report: &AutofocusReport) -> DeviceResult<()> {
        if self.fail {
            return Err("disk full".to_string());
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}
