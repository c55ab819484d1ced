//! S3-compatible artifact source

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    Client,
};
use tracing::{debug, info, instrument};

use super::config::StorageConfig;
use super::{ArtifactLayout, ArtifactReference, ArtifactSource, Disposition};
use crate::error::SourceError;

/// Artifacts stored as objects in one bucket
#[derive(Clone)]
pub struct S3ArtifactSource {
    client: Client,
    bucket: String,
    layout: ArtifactLayout,
}

impl S3ArtifactSource {
    pub async fn new(config: StorageConfig, layout: ArtifactLayout) -> anyhow::Result<Self> {
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            bucket = %config.bucket,
            "Initializing S3 artifact source"
        );

        let mut s3_config_builder = match config.static_credentials() {
            Some((access_key, secret_key)) => aws_sdk_s3::Config::builder()
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "fanout-source",
                ))
                .region(Region::new(config.region.clone()))
                .behavior_version_latest(),
            None => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Artifact source initialized for bucket: {}", config.bucket);

        Ok(Self::from_client(client, config.bucket, layout))
    }

    pub fn from_client(client: Client, bucket: impl Into<String>, layout: ArtifactLayout) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            layout,
        }
    }

    async fn move_object(&self, source_key: &str, dest_key: &str) -> Result<(), SourceError> {
        let disposition_error = |reason: String| SourceError::Disposition {
            artifact: source_key.to_string(),
            reason,
        };

        let copy_source = format!("{}/{}", self.bucket, source_key);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(dest_key)
            .send()
            .await
            .map_err(|e| disposition_error(format!("copy failed: {}", DisplayErrorContext(&e))))?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(source_key)
            .send()
            .await
            .map_err(|e| disposition_error(format!("delete failed: {}", DisplayErrorContext(&e))))?;

        info!(
            "Moved s3://{}/{} to s3://{}/{}",
            self.bucket, source_key, self.bucket, dest_key
        );
        Ok(())
    }
}

#[async_trait]
impl ArtifactSource for S3ArtifactSource {
    #[instrument(skip(self))]
    async fn list_new(&self, prefix: &str) -> Result<Vec<ArtifactReference>, SourceError> {
        let mut artifacts = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| {
                SourceError::Transient(format!("Failed to list S3 objects: {}", DisplayErrorContext(&e)))
            })?;

            for object in response.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let size = object.size().unwrap_or(0).max(0) as u64;
                if size == 0 || !self.layout.is_candidate(key) {
                    continue;
                }
                let mut artifact = ArtifactReference::new(key, size);
                if let Some(etag) = object.e_tag() {
                    artifact = artifact.with_fingerprint(etag.trim_matches('"'));
                }
                artifacts.push(artifact);
            }

            match (response.is_truncated(), response.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        artifacts.sort_by(|a, b| a.location.cmp(&b.location));
        debug!("Listed {} artifacts under s3://{}/{}", artifacts.len(), self.bucket, prefix);
        Ok(artifacts)
    }

    #[instrument(skip(self), fields(artifact = %artifact.location))]
    async fn fetch(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, SourceError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&artifact.location)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    SourceError::NotFound(artifact.location.clone())
                } else {
                    SourceError::Transient(format!(
                        "Failed to download {}: {}",
                        artifact.location,
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| SourceError::Transient(format!("Failed to read S3 response body: {}", e)))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, artifact.location);
        Ok(data)
    }

    #[instrument(skip(self), fields(artifact = %artifact.location))]
    async fn dispose(
        &self,
        artifact: &ArtifactReference,
        disposition: Disposition,
    ) -> Result<(), SourceError> {
        match self.layout.destination(&artifact.location, disposition) {
            Some(dest_key) => self.move_object(&artifact.location, &dest_key).await,
            None => {
                debug!("Leaving s3://{}/{} in place", self.bucket, artifact.location);
                Ok(())
            },
        }
    }
}
