//! Fan-out coordinator
//!
//! Runs every sink against the same read-only batch concurrently. Each write
//! is its own task with its own deadline: a slow sink is cancelled and
//! reported as a timeout without affecting its siblings. No retries here.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, warn};

use crate::error::SinkError;
use crate::record::Batch;
use crate::sinks::{SinkAdapter, SinkOutcome, SinkStatus};

/// Overall classification of a batch across all sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    AllSucceeded,
    PartiallySucceeded,
    AllFailed,
}

impl Verdict {
    /// Every sink `success` is AllSucceeded, every sink `failure` (or no sink
    /// at all) is AllFailed, anything in between is PartiallySucceeded.
    pub fn from_outcomes(outcomes: &[SinkOutcome]) -> Self {
        if outcomes.iter().all(SinkOutcome::is_failure) {
            Verdict::AllFailed
        } else if outcomes.iter().all(|o| o.status == SinkStatus::Success) {
            Verdict::AllSucceeded
        } else {
            Verdict::PartiallySucceeded
        }
    }
}

/// One outcome per sink plus the verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub outcomes: Vec<SinkOutcome>,
    pub verdict: Verdict,
}

impl BatchResult {
    pub fn new(outcomes: Vec<SinkOutcome>) -> Self {
        let verdict = Verdict::from_outcomes(&outcomes);
        Self { outcomes, verdict }
    }

    /// Sinks that did not fully succeed
    pub fn incomplete_sinks(&self) -> Vec<&SinkOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status != SinkStatus::Success)
            .collect()
    }

    pub fn outcome(&self, sink_name: &str) -> Option<&SinkOutcome> {
        self.outcomes.iter().find(|o| o.sink_name == sink_name)
    }
}

pub struct FanOutCoordinator {
    sinks: Vec<Arc<dyn SinkAdapter>>,
    sink_timeout: Duration,
}

impl FanOutCoordinator {
    pub fn new(sinks: Vec<Arc<dyn SinkAdapter>>, sink_timeout: Duration) -> Self {
        Self {
            sinks,
            sink_timeout,
        }
    }

    /// Write the batch to every sink; returns exactly one outcome per sink,
    /// in sink order
    #[instrument(skip_all, fields(artifact = %batch.artifact_id(), records = batch.len()))]
    pub async fn dispatch(&self, batch: Arc<Batch>) -> BatchResult {
        let sink_timeout = self.sink_timeout;
        let after_ms = u64::try_from(sink_timeout.as_millis()).unwrap_or(u64::MAX);

        let writes = self.sinks.iter().map(|sink| {
            let name = sink.name().to_string();
            let sink = Arc::clone(sink);
            let batch = Arc::clone(&batch);

            async move {
                let started = Instant::now();
                let mut handle = tokio::spawn(async move { sink.write(&batch).await });

                let mut outcome = match timeout(sink_timeout, &mut handle).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(join_error)) => SinkOutcome::failure(
                        &name,
                        SinkError::BackendUnavailable(format!("sink task aborted: {}", join_error)),
                    ),
                    Err(_) => {
                        handle.abort();
                        warn!(sink = %name, after_ms, "Sink write timed out");
                        SinkOutcome::failure(&name, SinkError::Timeout { after_ms })
                    },
                };
                outcome.sink_name = name;

                debug!(
                    sink = %outcome.sink_name,
                    status = ?outcome.status,
                    written = outcome.written_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sink write finished"
                );
                outcome
            }
        });

        BatchResult::new(join_all(writes).await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn outcome(status: SinkStatus) -> SinkOutcome {
        match status {
            SinkStatus::Success => SinkOutcome::success("s", 1),
            SinkStatus::Partial => SinkOutcome::partial("s", 1, "row 2"),
            SinkStatus::Failure => SinkOutcome::failure("s", SinkError::BackendUnavailable("down".into())),
        }
    }

    #[test]
    fn test_verdict_table() {
        use SinkStatus::*;
        let cases = [
            (vec![Success, Success, Success, Success], Verdict::AllSucceeded),
            (vec![Success, Success, Success, Failure], Verdict::PartiallySucceeded),
            (vec![Partial, Success], Verdict::PartiallySucceeded),
            (vec![Partial, Partial], Verdict::PartiallySucceeded),
            (vec![Partial, Failure], Verdict::PartiallySucceeded),
            (vec![Failure, Failure], Verdict::AllFailed),
            (vec![], Verdict::AllFailed),
        ];

        for (statuses, expected) in cases {
            let outcomes: Vec<_> = statuses.iter().copied().map(outcome).collect();
            assert_eq!(Verdict::from_outcomes(&outcomes), expected, "{:?}", statuses);
        }
    }

    #[test]
    fn test_incomplete_sinks() {
        let result = BatchResult::new(vec![
            SinkOutcome::success("timescale", 3),
            SinkOutcome::partial("elasticsearch", 2, "doc 3"),
            SinkOutcome::failure("qdrant", SinkError::Timeout { after_ms: 10 }),
        ]);
        let names: Vec<_> = result.incomplete_sinks().iter().map(|o| o.sink_name.as_str()).collect();
        assert_eq!(names, vec!["elasticsearch", "qdrant"]);
        assert_eq!(result.verdict, Verdict::PartiallySucceeded);
    }
}
