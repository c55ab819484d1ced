//! Polling worker
//!
//! Lists new artifacts, runs them through the controller one at a time and
//! sleeps for the poll interval. When a disposition command fails after a
//! successful run, the decision is remembered and re-issued on the next pass
//! instead of reprocessing the artifact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::controller::IngestionController;
use crate::error::SourceError;
use crate::report::RunReport;
use crate::source::{ArtifactReference, ArtifactSource, Disposition};

/// Disposition decided but not yet carried out
#[derive(Debug, Clone)]
struct PendingDisposition {
    fingerprint: Option<String>,
    disposition: Disposition,
}

pub struct IngestionWorker {
    controller: Arc<IngestionController>,
    source: Arc<dyn ArtifactSource>,
    input_prefix: String,
    poll_interval: Duration,
    pending: HashMap<String, PendingDisposition>,
}

impl IngestionWorker {
    pub fn new(controller: Arc<IngestionController>, input_prefix: impl Into<String>, poll_interval: Duration) -> Self {
        let source = Arc::clone(controller.source());
        Self {
            controller,
            source,
            input_prefix: input_prefix.into(),
            poll_interval,
            pending: HashMap::new(),
        }
    }

    /// Number of artifacts with a disposition still to re-issue
    pub fn pending_dispositions(&self) -> usize {
        self.pending.len()
    }

    /// Process every artifact currently listed, sequentially
    pub async fn run_once(&mut self) -> Result<Vec<RunReport>, SourceError> {
        let artifacts = self.source.list_new(&self.input_prefix).await?;
        debug!(count = artifacts.len(), prefix = %self.input_prefix, "Listed artifacts");

        // Moved or deleted out of band since the last pass
        let before = self.pending.len();
        self.pending
            .retain(|location, _| artifacts.iter().any(|a| &a.location == location));
        if self.pending.len() < before {
            debug!(dropped = before - self.pending.len(), "Forgot dispositions of unlisted artifacts");
        }

        let mut reports = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if self.reissue_pending(&artifact).await {
                continue;
            }
            let report = self.controller.run(&artifact).await;
            self.remember(&artifact, &report);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Poll until `shutdown` flips to true or its sender is dropped
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            prefix = %self.input_prefix,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Ingestion worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(reports) if !reports.is_empty() => info!(processed = reports.len(), "Polling pass complete"),
                Ok(_) => debug!("No new artifacts"),
                Err(e) => warn!(error = %e, "Failed to list artifacts"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        info!("Ingestion worker stopped");
    }

    /// Re-issue a remembered disposition; true when the artifact needs no run
    async fn reissue_pending(&mut self, artifact: &ArtifactReference) -> bool {
        let Some(pending) = self.pending.get(&artifact.location).cloned() else {
            return false;
        };

        // Same key, different content: a new artifact
        if pending.fingerprint.is_some() && pending.fingerprint != artifact.fingerprint {
            self.pending.remove(&artifact.location);
            return false;
        }

        match self.source.dispose(artifact, pending.disposition).await {
            Ok(()) => {
                info!(artifact = %artifact.location, disposition = %pending.disposition, "Re-issued disposition");
                self.pending.remove(&artifact.location);
            },
            Err(e) => {
                warn!(artifact = %artifact.location, error = %e, "Disposition still failing");
            },
        }
        true
    }

    fn remember(&mut self, artifact: &ArtifactReference, report: &RunReport) {
        match (report.disposition, &report.disposition_error) {
            (Some(disposition), Some(_)) if disposition != Disposition::LeaveForRetry => {
                self.pending.insert(
                    artifact.location.clone(),
                    PendingDisposition {
                        fingerprint: artifact.fingerprint.clone(),
                        disposition,
                    },
                );
            },
            _ => {
                self.pending.remove(&artifact.location);
            },
        }
    }
}

/// Shutdown channel flipped by Ctrl-C (and SIGTERM on unix)
pub fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = tx.send(true);
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = terminate.recv() => {},
            }
        },
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
