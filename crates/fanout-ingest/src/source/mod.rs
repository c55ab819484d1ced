//! Artifact sources
//!
//! The source supplies new input artifacts and carries out the disposition
//! decided for each one. Two implementations: S3-compatible object storage
//! and a local directory tree with the same layout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::SourceConfig;
use crate::error::SourceError;

pub mod config;
pub mod local;
pub mod s3;

pub use local::LocalArtifactSource;
pub use s3::S3ArtifactSource;

/// Identifies one input artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Object key or path relative to the source root
    pub location: String,
    pub size: u64,
    /// Content fingerprint (ETag or SHA-256) when the source provides one
    pub fingerprint: Option<String>,
}

impl ArtifactReference {
    pub fn new(location: impl Into<String>, size: u64) -> Self {
        Self {
            location: location.into(),
            size,
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Last path segment of the location
    pub fn file_name(&self) -> &str {
        self.location
            .rsplit('/')
            .next()
            .unwrap_or(&self.location)
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}

/// What happens to an artifact after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Move under the archive prefix
    Archive,
    /// Move under the quarantine prefix for manual inspection
    Quarantine,
    /// Leave in place so a later attempt picks it up again
    LeaveForRetry,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Archive => "archive",
            Disposition::Quarantine => "quarantine",
            Disposition::LeaveForRetry => "leave_for_retry",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which source implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    S3,
    Local,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s3" | "minio" => Ok(SourceKind::S3),
            "local" | "fs" => Ok(SourceKind::Local),
            _ => Err(format!("Unknown source: {}", s)),
        }
    }
}

/// Prefixes for new, archived and quarantined artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLayout {
    pub input_prefix: String,
    pub archive_prefix: String,
    pub quarantine_prefix: String,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            input_prefix: crate::config::DEFAULT_INPUT_PREFIX.to_string(),
            archive_prefix: crate::config::DEFAULT_ARCHIVE_PREFIX.to_string(),
            quarantine_prefix: crate::config::DEFAULT_QUARANTINE_PREFIX.to_string(),
        }
    }
}

impl ArtifactLayout {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.archive_prefix.is_empty() || self.quarantine_prefix.is_empty() {
            anyhow::bail!("Archive and quarantine prefixes cannot be empty");
        }
        if self.archive_prefix == self.quarantine_prefix {
            anyhow::bail!("Archive and quarantine prefixes must differ");
        }
        if self.input_prefix == self.archive_prefix || self.input_prefix == self.quarantine_prefix {
            anyhow::bail!("Input prefix must differ from the archive and quarantine prefixes");
        }
        Ok(())
    }

    /// Whether a listed key is a new artifact rather than a marker or a
    /// previously disposed artifact
    pub fn is_candidate(&self, key: &str) -> bool {
        key.starts_with(&self.input_prefix)
            && !key.ends_with('/')
            && !key.starts_with(&self.archive_prefix)
            && !key.starts_with(&self.quarantine_prefix)
    }

    /// Target location for a disposition; `None` when the artifact stays put
    pub fn destination(&self, location: &str, disposition: Disposition) -> Option<String> {
        let prefix = match disposition {
            Disposition::Archive => &self.archive_prefix,
            Disposition::Quarantine => &self.quarantine_prefix,
            Disposition::LeaveForRetry => return None,
        };
        let relative = location
            .strip_prefix(self.input_prefix.as_str())
            .unwrap_or(location)
            .trim_start_matches('/');

        if prefix.ends_with('/') {
            Some(format!("{}{}", prefix, relative))
        } else {
            Some(format!("{}/{}", prefix, relative))
        }
    }
}

/// Supplier of input artifacts
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// New artifacts under `prefix`, in a stable order
    async fn list_new(&self, prefix: &str) -> Result<Vec<ArtifactReference>, SourceError>;

    async fn fetch(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, SourceError>;

    async fn dispose(
        &self,
        artifact: &ArtifactReference,
        disposition: Disposition,
    ) -> Result<(), SourceError>;
}

/// Build the configured artifact source
pub async fn build_source(config: &SourceConfig) -> anyhow::Result<Arc<dyn ArtifactSource>> {
    let source: Arc<dyn ArtifactSource> = match config.kind {
        SourceKind::S3 => Arc::new(S3ArtifactSource::new(config.s3.clone(), config.layout.clone()).await?),
        SourceKind::Local => Arc::new(LocalArtifactSource::new(&config.local_root, config.layout.clone())),
    };
    Ok(source)
}
