//! Shared fixtures for pipeline integration tests
//!
//! - [`FakeSink`]: scripted sink adapter that records what it was asked to write
//! - [`MemorySource`]: in-memory artifact source with injectable failures

#![allow(dead_code)]

use async_trait::async_trait;
use fanout_ingest::controller::{ControllerConfig, IngestionController};
use fanout_ingest::coordinator::FanOutCoordinator;
use fanout_ingest::error::{SinkError, SourceError};
use fanout_ingest::normalizer::Normalizer;
use fanout_ingest::record::Batch;
use fanout_ingest::sinks::{SinkAdapter, SinkKind, SinkOutcome};
use fanout_ingest::source::{ArtifactLayout, ArtifactReference, ArtifactSource, Disposition};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fanout_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Fake Sinks
// ============================================================================

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(SinkError),
    /// Accept all but the last record
    RejectLast,
    /// Sleep before succeeding
    Delay(Duration),
    /// Fail this many calls, then succeed
    FailTimes(usize, SinkError),
}

pub struct FakeSink {
    name: String,
    kind: SinkKind,
    behavior: Behavior,
    calls: AtomicUsize,
    /// Record keys per completed write
    writes: Mutex<Vec<Vec<String>>>,
}

impl FakeSink {
    pub fn new(kind: SinkKind, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: kind.as_str().to_string(),
            kind,
            behavior,
            calls: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<String>> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SinkAdapter for FakeSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn write(&self, batch: &Batch) -> SinkOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        let outcome = match &self.behavior {
            Behavior::Succeed => SinkOutcome::success(&self.name, batch.len()),
            Behavior::Fail(error) => SinkOutcome::failure(&self.name, error.clone()),
            Behavior::RejectLast => SinkOutcome::partial(&self.name, batch.len() - 1, "last record rejected"),
            Behavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                SinkOutcome::success(&self.name, batch.len())
            },
            Behavior::FailTimes(times, error) if call < *times => SinkOutcome::failure(&self.name, error.clone()),
            Behavior::FailTimes(..) => SinkOutcome::success(&self.name, batch.len()),
        };

        if !outcome.is_failure() {
            self.writes
                .lock()
                .unwrap()
                .push(batch.keyed().map(|(k, _)| k.to_string()).collect());
        }
        outcome
    }
}

/// One fake per backend family, all with the same behavior
pub fn four_sinks(behavior: Behavior) -> Vec<Arc<FakeSink>> {
    SinkKind::ALL
        .iter()
        .map(|kind| FakeSink::new(*kind, behavior.clone()))
        .collect()
}

pub fn as_adapters(sinks: &[Arc<FakeSink>]) -> Vec<Arc<dyn SinkAdapter>> {
    sinks
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn SinkAdapter>)
        .collect()
}

// ============================================================================
// In-memory Artifact Source
// ============================================================================

#[derive(Default)]
pub struct MemorySource {
    layout: ArtifactLayout,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fetch_failures: AtomicU32,
    dispose_failures: AtomicU32,
    fetch_calls: AtomicU32,
    dispositions: Mutex<Vec<(String, Disposition)>>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, location: &str, body: impl Into<Vec<u8>>) -> ArtifactReference {
        let body = body.into();
        let reference = ArtifactReference::new(location, body.len() as u64)
            .with_fingerprint(fanout_common::checksum::sha256_hex(&body));
        self.objects.lock().unwrap().insert(location.to_string(), body);
        reference
    }

    /// Next `n` fetches fail transiently
    pub fn fail_fetches(&self, n: u32) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    /// Next `n` archive/quarantine moves fail
    pub fn fail_dispositions(&self, n: u32) {
        self.dispose_failures.store(n, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn dispositions(&self) -> Vec<(String, Disposition)> {
        self.dispositions.lock().unwrap().clone()
    }

    /// Delete an object behind the pipeline's back
    pub fn remove(&self, location: &str) {
        self.objects.lock().unwrap().remove(location);
    }

    pub fn exists(&self, location: &str) -> bool {
        self.objects.lock().unwrap().contains_key(location)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    async fn list_new(&self, prefix: &str) -> Result<Vec<ArtifactReference>, SourceError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, body)| key.starts_with(prefix) && self.layout.is_candidate(key) && !body.is_empty())
            .map(|(key, body)| {
                ArtifactReference::new(key.clone(), body.len() as u64)
                    .with_fingerprint(fanout_common::checksum::sha256_hex(body))
            })
            .collect())
    }

    async fn fetch(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, SourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fetch_failures) {
            return Err(SourceError::Transient("connection reset".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .get(&artifact.location)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(artifact.location.clone()))
    }

    async fn dispose(&self, artifact: &ArtifactReference, disposition: Disposition) -> Result<(), SourceError> {
        self.dispositions
            .lock()
            .unwrap()
            .push((artifact.location.clone(), disposition));

        let Some(destination) = self.layout.destination(&artifact.location, disposition) else {
            return Ok(());
        };
        if Self::take_failure(&self.dispose_failures) {
            return Err(SourceError::Disposition {
                artifact: artifact.location.clone(),
                reason: "access denied".to_string(),
            });
        }

        let mut objects = self.objects.lock().unwrap();
        let body = objects
            .remove(&artifact.location)
            .ok_or_else(|| SourceError::NotFound(artifact.location.clone()))?;
        objects.insert(destination, body);
        Ok(())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn controller(
    source: Arc<MemorySource>,
    sinks: &[Arc<FakeSink>],
    sink_timeout: Duration,
    config: ControllerConfig,
) -> IngestionController {
    IngestionController::new(
        source,
        Normalizer::default(),
        FanOutCoordinator::new(as_adapters(sinks), sink_timeout),
        config,
    )
}

pub fn fast_retries(max_attempts: u32) -> ControllerConfig {
    ControllerConfig {
        max_attempts,
        retry_backoff: Duration::from_millis(100),
        archive_on_partial: true,
    }
}

/// JSON array of `count` readings; positions in `bad` get an unparseable timestamp
pub fn json_readings(count: usize, bad: &[usize]) -> Vec<u8> {
    let items: Vec<_> = (0..count)
        .map(|i| {
            let timestamp = if bad.contains(&i) {
                "not-a-timestamp".to_string()
            } else {
                format!("2024-01-15T10:{:02}:00Z", i)
            };
            json!({
                "timestamp": timestamp,
                "device_id": format!("device_{:03}", i % 3),
                "temperature": 20.0 + i as f64,
                "location": "zone_a",
                "embedding": [0.1, 0.2, 0.3]
            })
        })
        .collect();
    serde_json::to_vec(&items).unwrap()
}
