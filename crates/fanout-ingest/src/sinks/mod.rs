//! Sink adapters
//!
//! One adapter per backend family. Every adapter maps canonical records into
//! its backend's native shape through a pure projection function and reports
//! the result of a write as a [`SinkOutcome`]; backend errors never escape an
//! adapter as `Err`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SinksConfig;
use crate::error::SinkError;
use crate::record::Batch;

pub mod clickhouse;
pub mod elasticsearch;
pub mod qdrant;
pub mod timescale;

pub use clickhouse::ClickHouseSink;
pub use elasticsearch::ElasticsearchSink;
pub use qdrant::QdrantSink;
pub use timescale::TimescaleSink;

/// Longest backend error body kept in an outcome
const MAX_ERROR_DETAIL: usize = 512;

/// Backend family of a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Timescale,
    ClickHouse,
    Elasticsearch,
    Qdrant,
}

impl SinkKind {
    pub const ALL: [SinkKind; 4] = [
        SinkKind::Timescale,
        SinkKind::ClickHouse,
        SinkKind::Elasticsearch,
        SinkKind::Qdrant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Timescale => "timescale",
            SinkKind::ClickHouse => "clickhouse",
            SinkKind::Elasticsearch => "elasticsearch",
            SinkKind::Qdrant => "qdrant",
        }
    }

    /// Storage family the backend stands for
    pub fn family(&self) -> &'static str {
        match self {
            SinkKind::Timescale => "relational/time-series",
            SinkKind::ClickHouse => "columnar",
            SinkKind::Elasticsearch => "search",
            SinkKind::Qdrant => "vector",
        }
    }

    /// Delivery semantics of the backend under replay
    pub fn idempotency(&self) -> Idempotency {
        match self {
            SinkKind::ClickHouse => Idempotency::Append,
            SinkKind::Timescale | SinkKind::Elasticsearch | SinkKind::Qdrant => Idempotency::Upsert,
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "timescale" | "timescaledb" | "postgres" => Ok(SinkKind::Timescale),
            "clickhouse" => Ok(SinkKind::ClickHouse),
            "elasticsearch" | "es" => Ok(SinkKind::Elasticsearch),
            "qdrant" => Ok(SinkKind::Qdrant),
            _ => Err(format!("Unknown sink: {}", s)),
        }
    }
}

/// Whether repeated delivery of a record can create duplicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Idempotency {
    /// Keyed upsert on the record key
    Upsert,
    /// Best-effort at-least-once append
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkStatus {
    Success,
    Partial,
    Failure,
}

/// Result of one sink's write of one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkOutcome {
    pub sink_name: String,
    pub status: SinkStatus,
    pub written_count: usize,
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SinkError>,
}

impl SinkOutcome {
    pub fn success(sink_name: impl Into<String>, written_count: usize) -> Self {
        Self {
            sink_name: sink_name.into(),
            status: SinkStatus::Success,
            written_count,
            error_detail: None,
            error: None,
        }
    }

    /// Some records accepted; `reason` describes the first rejected one
    pub fn partial(sink_name: impl Into<String>, written_count: usize, reason: impl Into<String>) -> Self {
        let error = SinkError::SchemaRejection(reason.into());
        Self {
            sink_name: sink_name.into(),
            status: SinkStatus::Partial,
            written_count,
            error_detail: Some(error.to_string()),
            error: Some(error),
        }
    }

    pub fn failure(sink_name: impl Into<String>, error: SinkError) -> Self {
        Self {
            sink_name: sink_name.into(),
            status: SinkStatus::Failure,
            written_count: 0,
            error_detail: Some(error.to_string()),
            error: Some(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == SinkStatus::Failure
    }
}

/// Accepted count plus the first backend rejection of a batch write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    pub first_rejection: Option<String>,
}

impl WriteSummary {
    pub fn reject(&mut self, reason: impl Into<String>) {
        if self.first_rejection.is_none() {
            self.first_rejection = Some(reason.into());
        }
    }

    pub fn into_outcome(self, sink_name: &str) -> SinkOutcome {
        match self.first_rejection {
            Some(reason) if self.written == 0 => {
                SinkOutcome::failure(sink_name, SinkError::SchemaRejection(reason))
            },
            Some(reason) => SinkOutcome::partial(sink_name, self.written, reason),
            None => SinkOutcome::success(sink_name, self.written),
        }
    }
}

/// A backend that batches of canonical records are written to
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// Name used in outcomes and logs
    fn name(&self) -> &str;

    fn kind(&self) -> SinkKind;

    fn idempotency(&self) -> Idempotency {
        self.kind().idempotency()
    }

    /// Write the whole batch; every backend error is reported in the outcome
    async fn write(&self, batch: &Batch) -> SinkOutcome;

    /// Create the target table/index/collection when missing
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Build the enabled sink adapters for a shared target name
pub fn build_sinks(config: &SinksConfig, target_name: &str) -> anyhow::Result<Vec<Arc<dyn SinkAdapter>>> {
    let mut sinks: Vec<Arc<dyn SinkAdapter>> = Vec::with_capacity(config.enabled.len());

    for kind in &config.enabled {
        let sink: Arc<dyn SinkAdapter> = match kind {
            SinkKind::Timescale => Arc::new(TimescaleSink::connect_lazy(&config.timescale, target_name)?),
            SinkKind::ClickHouse => Arc::new(ClickHouseSink::new(config.clickhouse.clone(), target_name)?),
            SinkKind::Elasticsearch => {
                Arc::new(ElasticsearchSink::new(config.elasticsearch.clone(), target_name)?)
            },
            SinkKind::Qdrant => Arc::new(QdrantSink::new(config.qdrant.clone(), target_name)?),
        };
        info!(
            sink = sink.name(),
            family = sink.kind().family(),
            idempotency = ?sink.idempotency(),
            "Configured sink"
        );
        sinks.push(sink);
    }

    Ok(sinks)
}

/// Run health checks and schema creation; failures are logged, not fatal
pub async fn prepare_sinks(sinks: &[Arc<dyn SinkAdapter>], ensure_schema: bool) {
    for sink in sinks {
        if let Err(e) = sink.health_check().await {
            warn!(sink = sink.name(), error = %e, "Sink health check failed");
            continue;
        }
        if ensure_schema {
            match sink.ensure_schema().await {
                Ok(()) => info!(sink = sink.name(), "Sink schema ready"),
                Err(e) => warn!(sink = sink.name(), error = %e, "Failed to ensure sink schema"),
            }
        }
    }
}

/// Map an HTTP error status from a backend to a sink error
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> SinkError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body.trim()));
    match status.as_u16() {
        401 | 403 => SinkError::AuthFailure(detail),
        400 | 404 | 409 | 413 | 422 => SinkError::SchemaRejection(detail),
        _ => SinkError::BackendUnavailable(detail),
    }
}

/// Map a transport-level reqwest error to a sink error
pub(crate) fn classify_transport(err: &reqwest::Error) -> SinkError {
    if let Some(status) = err.status() {
        return classify_status(status, &err.to_string());
    }
    if err.is_decode() {
        return SinkError::BackendUnavailable(format!("unreadable response: {}", err));
    }
    SinkError::BackendUnavailable(err.to_string())
}

pub(crate) fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_DETAIL {
        return text.to_string();
    }
    let mut end = MAX_ERROR_DETAIL;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

pub(crate) fn http_client(timeout: std::time::Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(timeout)
        .user_agent(concat!("fanout-ingest/", env!("CARGO_PKG_VERSION")))
        .build()?)
}
