//! Sweep results and the dataset they are collected in.
//!
//! A sweep produces one [`DatasetRow`] per outer step. Rows become visible to
//! readers only once the foreground sweep finalizes them through its
//! [`DatasetWriter`]; background tasks hold an `Arc<Dataset>` and can never see
//! or mutate the row being acquired.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

// =============================================================================
// Readings
// =============================================================================

/// Averaged output of one detector for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    /// Single averaged value.
    Scalar(f64),
    /// Averaged trace along a fast axis.
    Trace(Vec<f64>),
}

impl Reading {
    /// The scalar value, if this is a scalar.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Reading::Scalar(v) => Some(*v),
            Reading::Trace(_) => None,
        }
    }

    /// The trace, if this is a trace.
    pub fn as_trace(&self) -> Option<&[f64]> {
        match self {
            Reading::Scalar(_) => None,
            Reading::Trace(t) => Some(t),
        }
    }

    /// Mean over the trace, or the scalar itself.
    pub fn mean(&self) -> f64 {
        match self {
            Reading::Scalar(v) => *v,
            Reading::Trace(t) if t.is_empty() => f64::NAN,
            Reading::Trace(t) => t.iter().sum::<f64>() / t.len() as f64,
        }
    }
}

/// Result of one detector for one outer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStepResult {
    /// Setpoint of the innermost stepped axis.
    pub setpoint: f64,
    /// Averaged (and converted) value.
    pub average: Reading,
    /// Unconverted buffer, when the detector keeps it.
    pub raw_buffer: Option<Vec<f64>>,
}

/// One finalized step of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    /// Zero-based step index.
    pub index: usize,
    /// Setpoints of all stepped axes, outermost first.
    pub setpoints: Vec<f64>,
    /// Results keyed by detector name.
    pub results: BTreeMap<String, SweepStepResult>,
}

// =============================================================================
// Metadata
// =============================================================================

/// Description of one stepped axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisMetadata {
    /// Instrument id on the registry.
    pub instrument: String,
    /// Axis label.
    pub label: String,
    /// Physical unit.
    pub unit: String,
    /// Setpoints in order.
    pub setpoints: Vec<f64>,
    /// Settle delay per step, seconds.
    pub delay: f64,
}

/// Description of one detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorMetadata {
    /// Detector name.
    pub name: String,
    /// Unit of the converted value.
    pub unit: String,
    /// Setpoints of a fast axis the detector sweeps internally.
    pub fast_axis: Option<AxisMetadata>,
}

/// Structural description of a sweep, recorded before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMetadata {
    /// Unique run id.
    pub run_id: Uuid,
    /// Procedure name ("do1d", "do2d", ...).
    pub kind: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Stepped axes, outermost first.
    pub axes: Vec<AxisMetadata>,
    /// Detectors read on every step.
    pub detectors: Vec<DetectorMetadata>,
    /// Instrument parameter snapshot at start.
    #[serde(default)]
    pub snapshot: serde_json::Value,
}

impl SweepMetadata {
    /// Metadata with a fresh run id and the current time.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind: kind.into(),
            started_at: Utc::now(),
            axes: Vec::new(),
            detectors: Vec::new(),
            snapshot: serde_json::Value::Null,
        }
    }

    /// Total number of outer steps.
    pub fn total_steps(&self) -> usize {
        self.axes.iter().map(|a| a.setpoints.len()).product()
    }
}

// =============================================================================
// Dataset
// =============================================================================

/// Progress published to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatasetProgress {
    /// Finalized rows.
    pub rows: usize,
    /// Writer finished (completed, failed or interrupted).
    pub finished: bool,
}

/// Read side of a sweep's results.
#[derive(Debug)]
pub struct Dataset {
    metadata: SweepMetadata,
    rows: RwLock<Vec<DatasetRow>>,
    progress: watch::Sender<DatasetProgress>,
}

/// Exclusive write side of a [`Dataset`]. Not cloneable.
#[derive(Debug)]
pub struct DatasetWriter {
    dataset: Arc<Dataset>,
}

impl Dataset {
    /// Create a dataset and its single writer.
    pub fn create(metadata: SweepMetadata) -> (Arc<Dataset>, DatasetWriter) {
        let (progress, _) = watch::channel(DatasetProgress::default());
        let dataset = Arc::new(Dataset {
            metadata,
            rows: RwLock::new(Vec::new()),
            progress,
        });
        let writer = DatasetWriter {
            dataset: Arc::clone(&dataset),
        };
        (dataset, writer)
    }

    /// Sweep description.
    pub fn metadata(&self) -> &SweepMetadata {
        &self.metadata
    }

    /// Snapshot of finalized rows.
    pub fn finalized_rows(&self) -> Vec<DatasetRow> {
        self.rows.read().clone()
    }

    /// Number of finalized rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// True before the first row is finalized.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Current progress.
    pub fn progress(&self) -> DatasetProgress {
        *self.progress.borrow()
    }

    /// Follow progress.
    pub fn subscribe(&self) -> watch::Receiver<DatasetProgress> {
        self.progress.subscribe()
    }

    /// Setpoints of the innermost stepped axis, one per finalized row.
    pub fn setpoints(&self) -> Vec<f64> {
        self.rows
            .read()
            .iter()
            .filter_map(|row| row.setpoints.last().copied())
            .collect()
    }

    /// Averaged values of one detector, one per finalized row.
    pub fn readings(&self, detector: &str) -> Vec<Reading> {
        self.rows
            .read()
            .iter()
            .filter_map(|row| row.results.get(detector).map(|r| r.average.clone()))
            .collect()
    }
}

impl DatasetWriter {
    /// The dataset being written.
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Append a completed row and publish it to readers.
    pub fn finalize_row(&mut self, row: DatasetRow) {
        let rows = {
            let mut guard = self.dataset.rows.write();
            guard.push(row);
            guard.len()
        };
        self.dataset.progress.send_modify(|p| p.rows = rows);
    }

    /// Mark the dataset complete.
    pub fn finish(self) {
        self.dataset.progress.send_modify(|p| p.finished = true);
    }
}

impl Drop for DatasetWriter {
    fn drop(&mut self) {
        // Readers must see completion however the writer goes away.
        self.dataset.progress.send_if_modified(|p| {
            let changed = !p.finished;
            p.finished = true;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: usize, value: f64) -> DatasetRow {
        let mut results = BTreeMap::new();
        results.insert(
            "counter".to_string(),
            SweepStepResult {
                setpoint: index as f64,
                average: Reading::Scalar(value),
                raw_buffer: None,
            },
        );
        DatasetRow {
            index,
            setpoints: vec![index as f64],
            results,
        }
    }

    #[test]
    fn test_reading_helpers() {
        assert_eq!(Reading::Scalar(2.0).mean(), 2.0);
        assert_eq!(Reading::Trace(vec![1.0, 3.0]).mean(), 2.0);
        assert!(Reading::Trace(vec![]).mean().is_nan());
        assert_eq!(Reading::Trace(vec![1.0]).as_trace(), Some(&[1.0][..]));
        assert_eq!(Reading::Trace(vec![1.0]).as_scalar(), None);
    }

    #[test]
    fn test_rows_visible_only_after_finalize() {
        let (dataset, mut writer) = Dataset::create(SweepMetadata::new("do1d"));
        assert!(dataset.is_empty());
        writer.finalize_row(row(0, 1.0));
        writer.finalize_row(row(1, 2.0));
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.setpoints(), vec![0.0, 1.0]);
        assert_eq!(
            dataset.readings("counter"),
            vec![Reading::Scalar(1.0), Reading::Scalar(2.0)]
        );
        assert_eq!(dataset.progress().rows, 2);
        assert!(!dataset.progress().finished);
        writer.finish();
        assert!(dataset.progress().finished);
    }

    #[test]
    fn test_dropped_writer_marks_finished() {
        let (dataset, writer) = Dataset::create(SweepMetadata::new("do1d"));
        drop(writer);
        assert!(dataset.progress().finished);
    }

    #[test]
    fn test_total_steps() {
        let mut meta = SweepMetadata::new("do2d");
        for n in [3, 4] {
            meta.axes.push(AxisMetadata {
                instrument: "dac".into(),
                label: "v".into(),
                unit: "V".into(),
                setpoints: vec![0.0; n],
                delay: 0.0,
            });
        }
        assert_eq!(meta.total_steps(), 12);
    }
}
