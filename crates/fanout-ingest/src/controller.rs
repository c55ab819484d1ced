//! Ingestion controller
//!
//! Drives one artifact through
//! `Fetching → Normalizing → Dispatching → Deciding → Disposing → Done`,
//! or into `Quarantined`. Retries cover the whole run and are bounded by
//! `max_attempts`; the artifact is left in place between attempts.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::coordinator::{FanOutCoordinator, Verdict};
use crate::error::RunError;
use crate::normalizer::{InputFormat, Normalizer};
use crate::report::{RunReport, RunState};
use crate::source::{ArtifactReference, ArtifactSource, Disposition};

/// Retry and disposition policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one
    pub retry_backoff: Duration,
    /// Archive when some sinks failed; otherwise treat as a failed run
    pub archive_on_partial: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(crate::config::DEFAULT_RETRY_BACKOFF_MS),
            archive_on_partial: true,
        }
    }
}

impl ControllerConfig {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor)
    }
}

pub struct IngestionController {
    source: Arc<dyn ArtifactSource>,
    normalizer: Normalizer,
    coordinator: FanOutCoordinator,
    config: ControllerConfig,
}

impl IngestionController {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        normalizer: Normalizer,
        coordinator: FanOutCoordinator,
        config: ControllerConfig,
    ) -> Self {
        Self {
            source,
            normalizer,
            coordinator,
            config,
        }
    }

    pub fn source(&self) -> &Arc<dyn ArtifactSource> {
        &self.source
    }

    /// Process one artifact end to end, including its disposition
    pub async fn run(&self, artifact: &ArtifactReference) -> RunReport {
        self.run_with(artifact, true).await
    }

    /// Process one artifact and decide its disposition without issuing it
    pub async fn run_dry(&self, artifact: &ArtifactReference) -> RunReport {
        self.run_with(artifact, false).await
    }

    #[instrument(skip(self, artifact), fields(artifact = %artifact.location))]
    async fn run_with(&self, artifact: &ArtifactReference, dispose: bool) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(artifact);
        report.dry_run = !dispose;
        let max_attempts = self.config.max_attempts.max(1);

        let disposition = loop {
            report.attempts += 1;
            let attempt = report.attempts;

            match self.attempt(artifact, &mut report).await {
                Ok(()) => {
                    report.error = None;
                    break Disposition::Archive;
                },
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.backoff_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Run attempt failed, retrying"
                    );
                    report.error = Some(e.to_string());
                    if dispose {
                        if let Err(de) = self.source.dispose(artifact, Disposition::LeaveForRetry).await {
                            warn!(error = %de, "Failed to leave artifact for retry");
                        }
                    }
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    if e.is_retryable() {
                        warn!(attempts = attempt, error = %e, "Retries exhausted");
                    }
                    report.error = Some(e.to_string());
                    break Disposition::Quarantine;
                },
            }
        };

        report.enter(RunState::Disposing);
        report.disposition = Some(disposition);
        if dispose {
            if let Err(e) = self.source.dispose(artifact, disposition).await {
                report.disposition_error = Some(e.to_string());
            }
        }

        report.enter(match disposition {
            Disposition::Quarantine => RunState::Quarantined,
            _ => RunState::Done,
        });
        report.duration_ms = started.elapsed().as_millis() as u64;
        report.log();
        report
    }

    /// One pass from fetch to verdict
    async fn attempt(&self, artifact: &ArtifactReference, report: &mut RunReport) -> Result<(), RunError> {
        report.verdict = None;
        report.per_sink.clear();
        report.enter(RunState::Fetching);
        let bytes = self
            .source
            .fetch(artifact)
            .await
            .map_err(|source| RunError::FetchFailure {
                artifact: artifact.location.clone(),
                source,
            })?;

        report.enter(RunState::Normalizing);
        let format = InputFormat::detect(&artifact.location, &bytes);
        let normalized = self
            .normalizer
            .normalize_artifact(&artifact.location, &bytes, format);
        report.record_rejections(normalized.records_total, &normalized.rejections);

        if normalized.batch.is_empty() {
            return Err(RunError::NoValidRecords {
                artifact: artifact.location.clone(),
                rejected: normalized.rejected(),
            });
        }
        info!(
            ?format,
            records = normalized.batch.len(),
            rejected = normalized.rejected(),
            "Normalized artifact"
        );

        report.enter(RunState::Dispatching);
        let result = self.coordinator.dispatch(Arc::new(normalized.batch)).await;

        report.enter(RunState::Deciding);
        report.record_result(&result);

        match result.verdict {
            Verdict::AllSucceeded => Ok(()),
            Verdict::PartiallySucceeded => {
                let incomplete: Vec<String> = result
                    .incomplete_sinks()
                    .iter()
                    .map(|o| {
                        format!(
                            "{}: {}",
                            o.sink_name,
                            o.error_detail.as_deref().unwrap_or("incomplete")
                        )
                    })
                    .collect();

                if self.config.archive_on_partial {
                    warn!(sinks = ?incomplete, "Some sinks did not complete; archiving anyway");
                    Ok(())
                } else {
                    Err(RunError::SinksIncomplete {
                        artifact: artifact.location.clone(),
                        failed: result
                            .incomplete_sinks()
                            .iter()
                            .map(|o| o.sink_name.clone())
                            .collect(),
                    })
                }
            },
            Verdict::AllFailed => Err(RunError::AllSinksFailed {
                artifact: artifact.location.clone(),
                sinks: result.outcomes.len(),
            }),
        }
    }
}
