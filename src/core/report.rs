/*!
 * Processing report and provenance record
 *
 * Records what a pipeline run did: parameters, each step with its duration
 * and status, grid statistics, recovered tile failures and warnings.
 * Exported as pretty JSON and saved atomically next to the outputs.
 */

use crate::core::tiled_ls::TileFailure;
use crate::types::{GridStats, TerrainError, TerrainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Outcome of one processing step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Warning,
    Error,
}

/// Individual processing step record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStep {
    pub step_number: u32,
    pub step_name: String,
    pub finished_at: DateTime<Utc>,
    pub processing_duration: f64, // seconds
    pub status: StepStatus,
    pub detail: String,
}

/// Provenance record of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub processing_id: String,
    pub processing_timestamp: DateTime<Utc>,
    pub processor_version: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub processing_history: Vec<ProcessingStep>,
    pub statistics: BTreeMap<String, GridStats>,
    pub tile_failures: Vec<TileFailure>,
    pub warnings: Vec<String>,
}

impl ProcessingReport {
    pub fn new(processing_id: impl Into<String>) -> Self {
        Self {
            processing_id: processing_id.into(),
            processing_timestamp: Utc::now(),
            processor_version: env!("CARGO_PKG_VERSION").to_string(),
            parameters: BTreeMap::new(),
            processing_history: Vec::new(),
            statistics: BTreeMap::new(),
            tile_failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Store a parameter struct under `name`
    pub fn set_parameters<T: Serialize>(&mut self, name: &str, parameters: &T) -> TerrainResult<()> {
        let value = serde_json::to_value(parameters)
            .map_err(|e| TerrainError::Serialization(format!("parameter serialization failed: {}", e)))?;
        self.parameters.insert(name.to_string(), value);
        Ok(())
    }

    pub fn record_step(&mut self, step_name: &str, processing_duration: f64, status: StepStatus, detail: impl Into<String>) {
        let step = ProcessingStep {
            step_number: self.processing_history.len() as u32 + 1,
            step_name: step_name.to_string(),
            finished_at: Utc::now(),
            processing_duration,
            status,
            detail: detail.into(),
        };
        log::debug!("Recorded processing step {}: {}", step.step_number, step.step_name);
        self.processing_history.push(step);
    }

    /// Grids without valid cells are skipped
    pub fn add_statistics(&mut self, name: &str, stats: Option<GridStats>) {
        if let Some(stats) = stats {
            self.statistics.insert(name.to_string(), stats);
        }
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn add_tile_failures(&mut self, failures: &[TileFailure]) {
        self.tile_failures.extend_from_slice(failures);
    }

    pub fn total_duration(&self) -> f64 {
        self.processing_history.iter().map(|s| s.processing_duration).sum()
    }

    pub fn export_json(&self) -> TerrainResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TerrainError::Serialization(format!("report serialization failed: {}", e)))
    }

    /// Write JSON to `path` through a temporary file in the same directory
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> TerrainResult<()> {
        let path = path.as_ref();
        let json = self.export_json()?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| TerrainError::Io(e.error))?;

        log::info!("Processing report saved to: {}", path.display());
        Ok(())
    }

    /// Human-readable summary
    pub fn generate_summary(&self) -> String {
        let mut summary = String::new();
        summary.push_str(&format!("Processing ID: {}\n", self.processing_id));
        summary.push_str(&format!(
            "Timestamp: {}\n",
            self.processing_timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        summary.push_str(&format!("Processor Version: {}\n", self.processor_version));

        summary.push_str("Steps:\n");
        for step in &self.processing_history {
            summary.push_str(&format!(
                "  {}. {} ({:?}, {:.2}s) {}\n",
                step.step_number, step.step_name, step.status, step.processing_duration, step.detail
            ));
        }

        if !self.statistics.is_empty() {
            summary.push_str("Statistics:\n");
            for (name, s) in &self.statistics {
                summary.push_str(&format!(
                    "  {}: min {:.3}, max {:.3}, mean {:.3} ({} cells)\n",
                    name, s.min, s.max, s.mean, s.valid_count
                ));
            }
        }

        if !self.tile_failures.is_empty() {
            summary.push_str(&format!("Failed tiles: {}\n", self.tile_failures.len()));
        }
        for warning in &self.warnings {
            summary.push_str(&format!("Warning: {}\n", warning));
        }
        summary
    }
}
