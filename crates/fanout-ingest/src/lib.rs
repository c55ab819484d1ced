//! Fanout Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Multi-sink ingestion pipeline: structured records (JSON, JSON lines, CSV)
//! deposited in an object store are normalized into canonical records and
//! written concurrently to four backends.
//!
//! # Components
//!
//! - [`normalizer`]: raw units to [`record::CanonicalRecord`]s
//! - [`sinks`]: one adapter per backend family (time-series, columnar, search, vector)
//! - [`coordinator`]: concurrent fan-out with per-sink timeouts
//! - [`controller`]: run state machine, whole-run retries and disposition
//! - [`source`]: artifact listing, fetching and disposition
//! - [`worker`]: polling loop
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fanout_ingest::controller::{ControllerConfig, IngestionController};
//! use fanout_ingest::coordinator::FanOutCoordinator;
//! use fanout_ingest::normalizer::Normalizer;
//! use fanout_ingest::source::{ArtifactLayout, ArtifactSource, LocalArtifactSource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = Arc::new(LocalArtifactSource::new("./data", ArtifactLayout::default()));
//!     let coordinator = FanOutCoordinator::new(Vec::new(), Duration::from_secs(30));
//!     let controller = IngestionController::new(
//!         source.clone(),
//!         Normalizer::default(),
//!         coordinator,
//!         ControllerConfig::default(),
//!     );
//!
//!     for artifact in source.list_new("incoming/").await? {
//!         let report = controller.run(&artifact).await;
//!         println!("{}", report.to_json());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod normalizer;
pub mod record;
pub mod report;
pub mod schema;
pub mod sinks;
pub mod source;
pub mod worker;

pub use config::Config;
pub use controller::{ControllerConfig, IngestionController};
pub use coordinator::{BatchResult, FanOutCoordinator, Verdict};
pub use error::{RunError, SinkError, SourceError, ValidationError};
pub use record::{Batch, CanonicalRecord, KeyPolicy};
pub use report::{RunReport, RunState};
pub use sinks::{SinkAdapter, SinkOutcome, SinkStatus};
pub use source::{ArtifactReference, ArtifactSource, Disposition};
