//! Error taxonomy for the ingestion pipeline
//!
//! Errors are layered by blast radius:
//!
//! - [`ValidationError`]: one raw record; the record is excluded and counted.
//! - [`SinkError`]: one sink's write; recorded in that sink's outcome.
//! - [`RunError`]: the whole run; drives retry and quarantine.
//! - [`SourceError`]: the artifact source collaborator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-record rejection raised by the normalizer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing timestamp field '{field}'")]
    MissingTimestamp { field: String },

    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("malformed row: {0}")]
    MalformedRow(String),
}

/// Per-sink write failure
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SinkError {
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("schema rejection: {0}")]
    SchemaRejection(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),
}

impl SinkError {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Timeout { .. } => "timeout",
            SinkError::BackendUnavailable(_) => "backend_unavailable",
            SinkError::SchemaRejection(_) => "schema_rejection",
            SinkError::AuthFailure(_) => "auth_failure",
        }
    }
}

/// Whole-run failure seen by the ingestion controller
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to fetch artifact {artifact}: {source}")]
    FetchFailure {
        artifact: String,
        #[source]
        source: SourceError,
    },

    #[error("artifact {artifact} produced no valid records ({rejected} rejected)")]
    NoValidRecords { artifact: String, rejected: usize },

    #[error("all {sinks} sinks failed for artifact {artifact}")]
    AllSinksFailed { artifact: String, sinks: usize },

    /// Only raised when archiving on partial delivery is disabled
    #[error("sinks {failed:?} failed for artifact {artifact}")]
    SinksIncomplete { artifact: String, failed: Vec<String> },
}

impl RunError {
    /// Whether another attempt of the whole run could change the result
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RunError::NoValidRecords { .. })
    }
}

/// Failure reported by an artifact source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("transient source error: {0}")]
    Transient(String),

    #[error("disposition of {artifact} failed: {reason}")]
    Disposition { artifact: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_no_valid_records_is_terminal() {
        let err = RunError::NoValidRecords {
            artifact: "incoming/a.csv".to_string(),
            rejected: 3,
        };
        assert!(!err.is_retryable());

        let err = RunError::AllSinksFailed {
            artifact: "incoming/a.csv".to_string(),
            sinks: 4,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sink_error_serializes_with_kind() {
        let json = serde_json::to_value(SinkError::Timeout { after_ms: 250 }).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["detail"]["after_ms"], 250);
    }
}
