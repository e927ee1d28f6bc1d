//! Deterministic collaborators: an error sink that records, a fixed jitter.

use std::collections::BTreeMap;
use std::sync::Mutex;

use mesh_lifecycle::spread::JitterSource;
use mesh_lifecycle::ErrorReporter;

/// One captured error.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedError {
    pub message: String,
    pub tags: BTreeMap<String, String>,
    pub extras: BTreeMap<String, serde_json::Value>,
}

/// Collects every captured error.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reported: Mutex<Vec<ReportedError>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> Vec<ReportedError> {
        self.reported
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.reported().len()
    }
}

impl ErrorReporter for RecordingReporter {
    fn capture_error(
        &self,
        err: &anyhow::Error,
        tags: &BTreeMap<String, String>,
        extras: &BTreeMap<String, serde_json::Value>,
    ) {
        self.reported
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ReportedError {
                message: format!("{err:#}"),
                tags: tags.clone(),
                extras: extras.clone(),
            });
    }
}

/// Always draws the same number of minutes, clamped into the requested range.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl JitterSource for FixedJitter {
    fn draw_minutes(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        self.0.clamp(low, high - 1)
    }
}
