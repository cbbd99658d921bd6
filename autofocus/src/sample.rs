//! Focus samples collected during a run

use serde::{Deserialize, Serialize};

/// Smallest uncertainty a sample may carry; zero would give it infinite weight
pub const UNCERTAINTY_FLOOR: f64 = 0.001;

/// Uncertainty assigned to points where nothing was detected
pub const NO_DETECTION_UNCERTAINTY: f64 = 1000.0;

/// One averaged measurement at a focuser position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusSample {
    pub position: i32,
    pub measure: f64,
    pub uncertainty: f64,
}

impl FocusSample {
    pub fn new(position: i32, measure: f64, uncertainty: f64) -> Self {
        let uncertainty = if uncertainty.is_finite() {
            uncertainty.abs().max(UNCERTAINTY_FLOOR)
        } else {
            NO_DETECTION_UNCERTAINTY
        };
        Self {
            position,
            measure,
            uncertainty,
        }
    }

    /// Placeholder for an exposure in which nothing was detected
    pub fn is_placeholder(&self) -> bool {
        self.measure == 0.0
    }

    /// Least-squares weight, 1/σ²
    pub fn weight(&self) -> f64 {
        1.0 / (self.uncertainty * self.uncertainty)
    }
}

/// Samples of one run, always sorted by position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusSampleStore {
    samples: Vec<FocusSample>,
}

impl FocusSampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping position order; equal positions keep insertion order
    pub fn insert(&mut self, sample: FocusSample) {
        let index = self.samples.partition_point(|s| s.position <= sample.position);
        self.samples.insert(index, sample);
    }

    pub fn samples(&self) -> &[FocusSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn leftmost(&self) -> Option<&FocusSample> {
        self.samples.first()
    }

    pub fn rightmost(&self) -> Option<&FocusSample> {
        self.samples.last()
    }

    /// Inclusive range of sampled positions
    pub fn position_range(&self) -> Option<(i32, i32)> {
        match (self.leftmost(), self.rightmost()) {
            (Some(first), Some(last)) => Some((first.position, last.position)),
            _ => None,
        }
    }

    pub fn left_of(&self, x: f64) -> impl Iterator<Item = &FocusSample> {
        self.samples.iter().filter(move |s| (s.position as f64) < x)
    }

    pub fn right_of(&self, x: f64) -> impl Iterator<Item = &FocusSample> {
        self.samples.iter().filter(move |s| (s.position as f64) > x)
    }

    pub fn placeholders_left_of(&self, x: f64) -> usize {
        self.left_of(x).filter(|s| s.is_placeholder()).count()
    }

    pub fn placeholders_right_of(&self, x: f64) -> usize {
        self.right_of(x).filter(|s| s.is_placeholder()).count()
    }
}
