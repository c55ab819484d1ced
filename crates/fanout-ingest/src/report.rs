//! Per-artifact outcome record
//!
//! Every run produces exactly one [`RunReport`], whatever the result. It is
//! logged as one structured event and returned to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::coordinator::{BatchResult, Verdict};
use crate::normalizer::Rejection;
use crate::sinks::SinkOutcome;
use crate::source::{ArtifactReference, Disposition};

/// Rejection reasons kept in a report
pub const MAX_REJECTION_SAMPLES: usize = 5;

/// States of one ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Fetching,
    Normalizing,
    Dispatching,
    Deciding,
    Disposing,
    Done,
    Quarantined,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Fetching => "fetching",
            RunState::Normalizing => "normalizing",
            RunState::Dispatching => "dispatching",
            RunState::Deciding => "deciding",
            RunState::Disposing => "disposing",
            RunState::Done => "done",
            RunState::Quarantined => "quarantined",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub artifact_id: String,
    pub fingerprint: Option<String>,
    pub records_total: usize,
    pub records_rejected: usize,
    /// Absent when the run never reached dispatch
    pub verdict: Option<Verdict>,
    pub per_sink: Vec<SinkOutcome>,
    pub attempts: u32,
    pub final_state: RunState,
    pub disposition: Option<Disposition>,
    /// Set when the disposition command itself failed
    pub disposition_error: Option<String>,
    /// Last run-level error, if any
    pub error: Option<String>,
    pub state_trace: Vec<RunState>,
    pub rejection_samples: Vec<Rejection>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Disposition decided but not issued
    #[serde(default)]
    pub dry_run: bool,
}

impl RunReport {
    pub fn new(artifact: &ArtifactReference) -> Self {
        Self {
            artifact_id: artifact.location.clone(),
            fingerprint: artifact.fingerprint.clone(),
            records_total: 0,
            records_rejected: 0,
            verdict: None,
            per_sink: Vec::new(),
            attempts: 0,
            final_state: RunState::Fetching,
            disposition: None,
            disposition_error: None,
            error: None,
            state_trace: Vec::new(),
            rejection_samples: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
            dry_run: false,
        }
    }

    /// Record a state transition
    pub fn enter(&mut self, state: RunState) {
        debug!(artifact = %self.artifact_id, from = %self.final_state, to = %state, "Run state transition");
        self.final_state = state;
        self.state_trace.push(state);
    }

    pub fn record_rejections(&mut self, total: usize, rejections: &[Rejection]) {
        self.records_total = total;
        self.records_rejected = rejections.len();
        self.rejection_samples = rejections.iter().take(MAX_REJECTION_SAMPLES).cloned().collect();
    }

    pub fn record_result(&mut self, result: &BatchResult) {
        self.verdict = Some(result.verdict);
        self.per_sink = result.outcomes.clone();
    }

    pub fn reached(&self, state: RunState) -> bool {
        self.state_trace.contains(&state)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"serialization_error\":\"{}\"}}", e))
    }

    /// Emit the report as one structured event
    ///
    /// `info` when done cleanly, `warn` for partial verdicts or a failed
    /// disposition, `error` for quarantine.
    pub fn log(&self) {
        let outcome = self.to_json();
        let quarantined = self.final_state == RunState::Quarantined;
        let degraded = self.verdict == Some(Verdict::PartiallySucceeded) || self.disposition_error.is_some();

        if quarantined {
            error!(artifact = %self.artifact_id, attempts = self.attempts, %outcome, "Artifact quarantined");
        } else if degraded {
            warn!(artifact = %self.artifact_id, attempts = self.attempts, %outcome, "Artifact processed with failures");
        } else {
            info!(artifact = %self.artifact_id, attempts = self.attempts, %outcome, "Artifact processed");
        }
    }
}
