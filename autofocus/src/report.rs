//! Autofocus run report
//!
//! Produced only for accepted runs and handed to a [`ReportSink`]. The JSON sink
//! writes one pretty-printed document per run.

use crate::config::{DetectionMethod, FittingMode};
use crate::device_ops::{DeviceResult, FilterInfo, ReportSink};
use crate::error::{AutofocusError, AutofocusResult};
use crate::fitting::{CurveFits, FitPoint};
use crate::sample::FocusSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutofocusReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub detection_method: DetectionMethod,
    pub fitting_mode: FittingMode,
    /// Focuser position before the run
    pub initial_position: i32,
    /// Measurement at the initial position before any move
    pub baseline: FocusSample,
    pub final_point: FitPoint,
    /// Where the focuser was left
    pub final_position: i32,
    /// Measurement taken at the final position while validating (HFR runs)
    pub final_measurement: Option<FocusSample>,
    pub temperature: Option<f64>,
    pub filter: Option<FilterInfo>,
    pub attempts: u32,
    pub samples: Vec<FocusSample>,
    pub fits: CurveFits,
    pub duration_secs: f64,
}

impl AutofocusReport {
    pub fn to_json(&self) -> AutofocusResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| AutofocusError::Report(e.to_string()))
    }

    pub fn from_json(json: &str) -> AutofocusResult<Self> {
        serde_json::from_str(json).map_err(|e| AutofocusError::Report(e.to_string()))
    }

    /// `autofocus_<timestamp>_<id>.json`
    pub fn file_name(&self) -> String {
        format!(
            "autofocus_{}_{}.json",
            self.timestamp.format("%Y%m%dT%H%M%S"),
            self.id.simple()
        )
    }

    /// Improvement of the final measurement over the baseline, in percent
    pub fn improvement_pct(&self) -> Option<f64> {
        let measured = self.final_measurement?.measure;
        if self.baseline.measure == 0.0 {
            return None;
        }
        Some((self.baseline.measure - measured) / self.baseline.measure * 100.0)
    }
}

/// Writes reports as JSON files into a directory
pub struct JsonReportSink {
    directory: PathBuf,
}

impl JsonReportSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, report: &AutofocusReport) -> PathBuf {
        self.directory.join(report.file_name())
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    async fn publish(&self, report: &AutofocusReport) -> DeviceResult<()> {
        let json = report.to_json().map_err(|e| e.to_string())?;
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| format!("Failed to create {}: {}", self.directory.display(), e))?;
        let path = self.path_for(report);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        tracing::info!("Autofocus report written to {}", path.display());
        Ok(())
    }
}
