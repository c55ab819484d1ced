//! Local directory artifact source
//!
//! Same contract as the object store, over a directory tree: locations are
//! `/`-separated paths relative to the root.

use async_trait::async_trait;
use fanout_common::checksum::{sha256_file, verify_fingerprint};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use super::{ArtifactLayout, ArtifactReference, ArtifactSource, Disposition};
use crate::error::SourceError;

#[derive(Debug, Clone)]
pub struct LocalArtifactSource {
    root: PathBuf,
    layout: ArtifactLayout,
}

impl LocalArtifactSource {
    pub fn new(root: impl AsRef<Path>, layout: ArtifactLayout) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            layout,
        }
    }

    fn path_of(&self, location: &str) -> PathBuf {
        location
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn location_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

/// Streamed SHA-256 of a file, off the async runtime
async fn fingerprint(path: PathBuf) -> Result<String, SourceError> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| SourceError::Transient(format!("fingerprint task failed: {}", e)))?
        .map_err(|e| SourceError::Transient(e.to_string()))
}

/// `path` itself when free, else the first free `<stem>-<n>.<ext>` beside it
async fn vacant_path(path: PathBuf) -> std::io::Result<PathBuf> {
    if !tokio::fs::try_exists(&path).await? {
        return Ok(path);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n: u32 = 1;
    loop {
        let candidate = path.with_file_name(format!("{}-{}{}", stem, n, extension));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[async_trait]
impl ArtifactSource for LocalArtifactSource {
    #[instrument(skip(self))]
    async fn list_new(&self, prefix: &str) -> Result<Vec<ArtifactReference>, SourceError> {
        // Walk from the deepest directory fully named by the prefix
        let base = match prefix.rfind('/') {
            Some(idx) => self.path_of(&prefix[..idx]),
            None => self.root.clone(),
        };

        let mut artifacts = Vec::new();
        let mut pending = vec![base];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(SourceError::Io(e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(location) = self.location_of(&path) else {
                    continue;
                };
                if !location.starts_with(prefix) || !self.layout.is_candidate(&location) {
                    continue;
                }
                let size = entry.metadata().await?.len();
                if size == 0 {
                    continue;
                }
                let digest = fingerprint(path).await?;
                artifacts.push(ArtifactReference::new(location, size).with_fingerprint(digest));
            }
        }

        artifacts.sort_by(|a, b| a.location.cmp(&b.location));
        debug!("Listed {} artifacts under {}/{}", artifacts.len(), self.root.display(), prefix);
        Ok(artifacts)
    }

    #[instrument(skip(self), fields(artifact = %artifact.location))]
    async fn fetch(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, SourceError> {
        match tokio::fs::read(self.path_of(&artifact.location)).await {
            Ok(data) => {
                // Rewritten since it was listed: list again rather than process a mix
                if let Some(expected) = &artifact.fingerprint {
                    verify_fingerprint(&data, expected).map_err(|e| {
                        SourceError::Transient(format!("{} changed since listing: {}", artifact.location, e))
                    })?;
                }
                Ok(data)
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SourceError::NotFound(artifact.location.clone())),
            Err(e) => Err(SourceError::Transient(format!(
                "Failed to read {}: {}",
                artifact.location, e
            ))),
        }
    }

    #[instrument(skip(self), fields(artifact = %artifact.location))]
    async fn dispose(
        &self,
        artifact: &ArtifactReference,
        disposition: Disposition,
    ) -> Result<(), SourceError> {
        let Some(destination) = self.layout.destination(&artifact.location, disposition) else {
            debug!("Leaving {} in place", artifact.location);
            return Ok(());
        };

        let disposition_error = |e: std::io::Error| SourceError::Disposition {
            artifact: artifact.location.clone(),
            reason: e.to_string(),
        };

        let from = self.path_of(&artifact.location);
        let to = self.path_of(&destination);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(disposition_error)?;
        }
        // Never overwrite an earlier artifact of the same name
        let to = vacant_path(to).await.map_err(disposition_error)?;
        tokio::fs::rename(&from, &to).await.map_err(disposition_error)?;

        let moved_to = self.location_of(&to).unwrap_or(destination);
        info!("Moved {} to {}", artifact.location, moved_to);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fanout_common::checksum::sha256_hex;
    use tempfile::TempDir;

    async fn write(root: &Path, location: &str, body: &str) {
        let path = root.join(location);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, body).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_empty_and_disposed_files() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "incoming/a.csv", "timestamp\n").await;
        write(dir.path(), "incoming/nested/b.json", "{}").await;
        write(dir.path(), "incoming/empty.csv", "").await;
        write(dir.path(), "processed/old.csv", "timestamp\n").await;

        let source = LocalArtifactSource::new(dir.path(), ArtifactLayout::default());
        let listed = source.list_new("incoming/").await.unwrap();

        let locations: Vec<_> = listed.iter().map(|a| a.location.as_str()).collect();
        assert_eq!(locations, vec!["incoming/a.csv", "incoming/nested/b.json"]);
        assert_eq!(listed[0].size, 10);
        assert_eq!(listed[0].fingerprint.as_deref(), Some(sha256_hex(b"timestamp\n").as_str()));
    }

    #[tokio::test]
    async fn test_missing_prefix_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let source = LocalArtifactSource::new(dir.path(), ArtifactLayout::default());
        assert!(source.list_new("incoming/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_moves_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "incoming/2024/a.csv", "x").await;
        let source = LocalArtifactSource::new(dir.path(), ArtifactLayout::default());
        let artifact = ArtifactReference::new("incoming/2024/a.csv", 1);

        source.dispose(&artifact, Disposition::LeaveForRetry).await.unwrap();
        assert!(dir.path().join("incoming/2024/a.csv").exists());

        source.dispose(&artifact, Disposition::Quarantine).await.unwrap();
        assert!(!dir.path().join("incoming/2024/a.csv").exists());
        assert!(dir.path().join("failed/2024/a.csv").exists());

        let err = source.fetch(&artifact).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dispose_keeps_earlier_artifact_of_same_name() {
        let dir = TempDir::new().unwrap();
        let source = LocalArtifactSource::new(dir.path(), ArtifactLayout::default());
        let artifact = ArtifactReference::new("incoming/a.csv", 5);

        for body in ["first", "second", "third"] {
            write(dir.path(), "incoming/a.csv", body).await;
            source.dispose(&artifact, Disposition::Archive).await.unwrap();
        }

        let read = |location: &str| std::fs::read_to_string(dir.path().join(location)).unwrap();
        assert_eq!(read("processed/a.csv"), "first");
        assert_eq!(read("processed/a-1.csv"), "second");
        assert_eq!(read("processed/a-2.csv"), "third");
        assert!(!dir.path().join("incoming/a.csv").exists());
    }

    #[tokio::test]
    async fn test_fetch_rejects_content_changed_since_listing() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "incoming/a.csv", "timestamp\n").await;
        let source = LocalArtifactSource::new(dir.path(), ArtifactLayout::default());
        let listed = source.list_new("incoming/").await.unwrap().remove(0);

        assert_eq!(source.fetch(&listed).await.unwrap(), b"timestamp\n");

        write(dir.path(), "incoming/a.csv", "timestamp,value\n").await;
        let err = source.fetch(&listed).await.unwrap_err();
        assert!(matches!(err, SourceError::Transient(_)));
    }
}
