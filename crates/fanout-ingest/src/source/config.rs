//! Object storage settings for the S3 artifact source

use serde::{Deserialize, Serialize};

use crate::config::{env_optional, env_parse, env_string};

/// S3-compatible object storage settings for the artifact source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials; the default AWS provider chain is used when unset
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    /// Read `S3_*` variables, falling back to the standard `AWS_*` key pair
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: env_optional("S3_ENDPOINT"),
            region: env_string("S3_REGION", "us-east-1"),
            bucket: env_string("S3_BUCKET", "fanout-artifacts"),
            access_key: env_optional("S3_ACCESS_KEY").or_else(|| env_optional("AWS_ACCESS_KEY_ID")),
            secret_key: env_optional("S3_SECRET_KEY").or_else(|| env_optional("AWS_SECRET_ACCESS_KEY")),
            path_style: env_parse("S3_PATH_STYLE", false)?,
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    /// Static key pair, if both halves are configured
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}
