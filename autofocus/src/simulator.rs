//! Simulated autofocus equipment
//!
//! A focuser, camera, filter wheel and guider that behave like a small imaging rig.
//! The camera derives its measurement from the focuser position through a hyperbolic
//! HFR profile or a gaussian contrast profile, with seeded noise so runs are
//! reproducible.

use crate::config::DetectionMethod;
use crate::device_ops::{
    DeviceResult, ExposureHandle, ExposureParams, FilterInfo, FilterWheel, Focuser, Guider,
    Measurement, MeasurementSource,
};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn poisoned<T>(_: T) -> String {
    "simulator state poisoned".to_string()
}

pub struct SimulatedFocuser {
    position: Mutex<i32>,
    max_position: i32,
    temperature: Option<f64>,
    temp_comp: AtomicBool,
    /// Time taken per 1000 steps of travel
    travel_time: Duration,
}

impl SimulatedFocuser {
    pub fn new(position: i32, max_position: i32) -> Self {
        Self {
            position: Mutex::new(position.clamp(0, max_position)),
            max_position,
            temperature: Some(8.0),
            temp_comp: AtomicBool::new(false),
            travel_time: Duration::ZERO,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_travel_time(mut self, per_thousand_steps: Duration) -> Self {
        self.travel_time = per_thousand_steps;
        self
    }

    pub fn position(&self) -> DeviceResult<i32> {
        self.position.lock().map(|p| *p).map_err(poisoned)
    }

    async fn go_to(&self, target: i32) -> DeviceResult<i32> {
        if target < 0 || target > self.max_position {
            return Err(format!(
                "Position {} outside focuser range 0..={}",
                target, self.max_position
            ));
        }
        let distance = (target - self.position()?).unsigned_abs();
        if !self.travel_time.is_zero() && distance > 0 {
            tokio::time::sleep(self.travel_time.mul_f64(distance as f64 / 1000.0)).await;
        }
        *self.position.lock().map_err(poisoned)? = target;
        Ok(target)
    }
}

#[async_trait]
impl Focuser for SimulatedFocuser {
    async fn get_position(&self) -> DeviceResult<i32> {
        self.position()
    }

    async fn move_relative(&self, steps: i32) -> DeviceResult<i32> {
        let target = self.position()?.saturating_add(steps);
        self.go_to(target).await
    }

    async fn move_absolute(&self, position: i32) -> DeviceResult<i32> {
        self.go_to(position).await
    }

    async fn get_temperature(&self) -> DeviceResult<Option<f64>> {
        Ok(self.temperature)
    }

    async fn temp_comp_enabled(&self) -> DeviceResult<bool> {
        Ok(self.temp_comp.load(Ordering::SeqCst))
    }

    async fn set_temp_comp(&self, enabled: bool) -> DeviceResult<()> {
        self.temp_comp.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

/// Optical model of the simulated telescope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedOptics {
    /// Focuser position of perfect focus
    pub best_focus: i32,
    /// HFR in pixels at perfect focus
    pub min_hfr: f64,
    /// Steps from focus at which the HFR has grown by a factor of √2
    pub depth_of_focus: f64,
    /// Stars are lost once the HFR exceeds this
    pub detection_limit_hfr: f64,
    pub stars_at_focus: u32,
    /// Contrast statistic at perfect focus, above the background
    pub peak_contrast: f64,
    pub contrast_background: f64,
    /// Width of the contrast profile in steps
    pub contrast_sigma: f64,
    /// Relative measurement noise
    pub noise: f64,
    /// Fraction of captures that never deliver an image
    pub drop_rate: f64,
}

impl Default for SimulatedOptics {
    fn default() -> Self {
        Self {
            best_focus: 5000,
            min_hfr: 2.0,
            depth_of_focus: 150.0,
            detection_limit_hfr: 12.0,
            stars_at_focus: 60,
            peak_contrast: 100.0,
            contrast_background: 10.0,
            contrast_sigma: 300.0,
            noise: 0.01,
            drop_rate: 0.0,
        }
    }
}

impl SimulatedOptics {
    pub fn hfr_at(&self, position: i32) -> f64 {
        let defocus = (position - self.best_focus) as f64 / self.depth_of_focus;
        self.min_hfr * (1.0 + defocus * defocus).sqrt()
    }

    pub fn contrast_at(&self, position: i32) -> f64 {
        let defocus = (position - self.best_focus) as f64 / self.contrast_sigma;
        self.contrast_background + self.peak_contrast * (-0.5 * defocus * defocus).exp()
    }

    /// Fewer stars rise above the noise as they spread out
    pub fn stars_at(&self, hfr: f64) -> u32 {
        if hfr > self.detection_limit_hfr {
            return 0;
        }
        let ratio = self.min_hfr / hfr;
        (self.stars_at_focus as f64 * ratio * ratio).round().max(1.0) as u32
    }
}

/// Camera whose exposures record the focuser position they were taken at
pub struct SimulatedCamera {
    focuser: Arc<SimulatedFocuser>,
    optics: SimulatedOptics,
    rng: Mutex<StdRng>,
    /// Fraction of the requested exposure time actually spent waiting
    exposure_time_scale: f64,
    pending: Mutex<HashMap<u64, i32>>,
    next_id: AtomicU64,
    subsample: Mutex<Option<f64>>,
}

impl SimulatedCamera {
    pub fn new(focuser: Arc<SimulatedFocuser>, optics: SimulatedOptics, seed: u64) -> Self {
        Self {
            focuser,
            optics,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            exposure_time_scale: 0.0,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            subsample: Mutex::new(None),
        }
    }

    pub fn with_exposure_time_scale(mut self, scale: f64) -> Self {
        self.exposure_time_scale = scale.max(0.0);
        self
    }

    pub fn optics(&self) -> &SimulatedOptics {
        &self.optics
    }

    /// Multiplicative noise factor around 1
    fn jitter(&self) -> DeviceResult<f64> {
        if self.optics.noise <= 0.0 {
            return Ok(1.0);
        }
        let mut rng = self.rng.lock().map_err(poisoned)?;
        Ok(1.0 + rng.gen_range(-self.optics.noise..self.optics.noise))
    }

    fn dropped(&self) -> DeviceResult<bool> {
        if self.optics.drop_rate <= 0.0 {
            return Ok(false);
        }
        let mut rng = self.rng.lock().map_err(poisoned)?;
        Ok(rng.gen::<f64>() < self.optics.drop_rate)
    }
}

#[async_trait]
impl MeasurementSource for SimulatedCamera {
    async fn capture(&self, params: &ExposureParams) -> DeviceResult<Option<ExposureHandle>> {
        if params.duration_secs < 0.0 {
            return Err(format!("Invalid exposure duration {}", params.duration_secs));
        }
        let wait = params.duration_secs * self.exposure_time_scale;
        if wait > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
        if self.dropped()? {
            return Ok(None);
        }

        let position = self.focuser.position()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().map_err(poisoned)?.insert(id, position);
        Ok(Some(ExposureHandle { id }))
    }

    async fn measure(&self, exposure: &ExposureHandle, method: DetectionMethod) -> DeviceResult<Measurement> {
        let position = self
            .pending
            .lock()
            .map_err(poisoned)?
            .remove(&exposure.id)
            .ok_or_else(|| format!("Unknown exposure {}", exposure.id))?;

        let hfr = self.optics.hfr_at(position);
        let stars = self.optics.stars_at(hfr);

        let measurement = match method {
            DetectionMethod::StarHfr if stars == 0 => Measurement {
                value: 0.0,
                uncertainty: 0.0,
                star_count: Some(0),
            },
            DetectionMethod::StarHfr => {
                let value = hfr * self.jitter()?;
                Measurement {
                    value,
                    uncertainty: value * 0.08 / (stars as f64).sqrt(),
                    star_count: Some(stars),
                }
            }
            DetectionMethod::ContrastDetection => {
                let value = self.optics.contrast_at(position) * self.jitter()?;
                Measurement {
                    value,
                    uncertainty: value * 0.02,
                    star_count: None,
                }
            }
        };
        Ok(measurement)
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        tracing::debug!("Simulated exposure aborted");
        Ok(())
    }

    async fn subsample(&self) -> DeviceResult<Option<f64>> {
        self.subsample.lock().map(|s| *s).map_err(poisoned)
    }

    async fn set_subsample(&self, ratio: Option<f64>) -> DeviceResult<()> {
        if let Some(ratio) = ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(format!("Invalid subsample ratio {}", ratio));
            }
        }
        *self.subsample.lock().map_err(poisoned)? = ratio;
        Ok(())
    }
}

pub struct SimulatedFilterWheel {
    filters: Vec<FilterInfo>,
    current: Mutex<usize>,
}

impl SimulatedFilterWheel {
    pub fn new(names: &[&str]) -> Self {
        Self {
            filters: names
                .iter()
                .enumerate()
                .map(|(i, name)| FilterInfo {
                    name: name.to_string(),
                    position: i as i32,
                })
                .collect(),
            current: Mutex::new(0),
        }
    }
}

#[async_trait]
impl FilterWheel for SimulatedFilterWheel {
    async fn current_filter(&self) -> DeviceResult<Option<FilterInfo>> {
        let current = *self.current.lock().map_err(poisoned)?;
        Ok(self.filters.get(current).cloned())
    }

    async fn filters(&self) -> DeviceResult<Vec<FilterInfo>> {
        Ok(self.filters.clone())
    }

    async fn change_filter(&self, filter: &FilterInfo) -> DeviceResult<FilterInfo> {
        let index = self
            .filters
            .iter()
            .position(|f| f.name == filter.name)
            .ok_or_else(|| format!("Filter '{}' not installed", filter.name))?;
        *self.current.lock().map_err(poisoned)? = index;
        Ok(self.filters[index].clone())
    }
}

pub struct SimulatedGuider {
    guiding: AtomicBool,
}

impl SimulatedGuider {
    pub fn new(guiding: bool) -> Self {
        Self {
            guiding: AtomicBool::new(guiding),
        }
    }

    pub fn is_guiding(&self) -> bool {
        self.guiding.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Guider for SimulatedGuider {
    async fn stop_guiding(&self) -> DeviceResult<bool> {
        Ok(self.guiding.swap(false, Ordering::SeqCst))
    }

    async fn start_guiding(&self) -> DeviceResult<bool> {
        self.guiding.store(true, Ordering::SeqCst);
        Ok(true)
    }
}
