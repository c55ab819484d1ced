//! Configuration management
//!
//! Everything is read from the environment (after loading an optional `.env`)
//! and validated once at startup.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::normalizer::FieldMapping;
use crate::record::KeyPolicy;
use crate::sinks::SinkKind;
use crate::source::config::StorageConfig;
use crate::source::{ArtifactLayout, SourceKind};

// ============================================================================
// Pipeline Defaults
// ============================================================================

/// Default table / index / collection name shared by every sink.
pub const DEFAULT_TARGET_NAME: &str = "metrics";

/// Default prefix polled for new artifacts.
pub const DEFAULT_INPUT_PREFIX: &str = "incoming/";

/// Default prefix processed artifacts are archived under.
pub const DEFAULT_ARCHIVE_PREFIX: &str = "processed/";

/// Default prefix quarantined artifacts are moved under.
pub const DEFAULT_QUARANTINE_PREFIX: &str = "failed/";

/// Default root directory of the local artifact source.
pub const DEFAULT_LOCAL_ROOT: &str = "./data";

/// Default polling interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default maximum number of whole-run attempts per artifact.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base backoff between attempts in milliseconds (doubles each attempt).
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Default per-sink write timeout in seconds.
pub const DEFAULT_SINK_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Sink Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/fanout";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_CLICKHOUSE_URL: &str = "http://localhost:8123";
pub const DEFAULT_CLICKHOUSE_USER: &str = "default";
pub const DEFAULT_CLICKHOUSE_DATABASE: &str = "default";

/// Default share of malformed rows ClickHouse may skip in one insert.
pub const DEFAULT_CLICKHOUSE_MAX_ERROR_RATIO: f64 = 0.1;

pub const DEFAULT_ES_URL: &str = "http://localhost:9200";

pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";

/// Default dimensionality of vectors stored in Qdrant.
pub const DEFAULT_QDRANT_VECTOR_SIZE: usize = 384;

/// Longest identifier accepted as a target name (PostgreSQL limit).
const MAX_IDENTIFIER_LEN: usize = 63;

/// Full application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub mapping: FieldMapping,
    pub key_policy: KeyPolicy,
    pub source: SourceConfig,
    pub sinks: SinksConfig,
}

/// Run and retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub target_name: String,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub sink_timeout_secs: u64,
    pub archive_on_partial: bool,
    pub ensure_schema: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_name: DEFAULT_TARGET_NAME.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            sink_timeout_secs: DEFAULT_SINK_TIMEOUT_SECS,
            archive_on_partial: true,
            ensure_schema: true,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            archive_on_partial: self.archive_on_partial,
        }
    }
}

/// Where artifacts come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub layout: ArtifactLayout,
    pub local_root: PathBuf,
    pub s3: StorageConfig,
}

/// Enabled sinks and their connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinksConfig {
    pub enabled: Vec<SinkKind>,
    pub timescale: TimescaleConfig,
    pub clickhouse: ClickHouseConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub qdrant: QdrantConfig,
}

/// Relational / time-series sink connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimescaleConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for TimescaleConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Columnar sink connection (ClickHouse HTTP interface)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: String,
    pub max_error_ratio: f64,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CLICKHOUSE_URL.to_string(),
            user: DEFAULT_CLICKHOUSE_USER.to_string(),
            password: None,
            database: DEFAULT_CLICKHOUSE_DATABASE.to_string(),
            max_error_ratio: DEFAULT_CLICKHOUSE_MAX_ERROR_RATIO,
        }
    }
}

/// Search sink connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ES_URL.to_string(),
            user: None,
            password: None,
        }
    }
}

/// Vector sink connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub vector_size: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_QDRANT_URL.to_string(),
            api_key: None,
            vector_size: DEFAULT_QDRANT_VECTOR_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from the environment without validating it
    pub fn from_env() -> anyhow::Result<Self> {
        let pipeline = PipelineConfig {
            target_name: env_string("FANOUT_TARGET_NAME", DEFAULT_TARGET_NAME),
            poll_interval_secs: env_parse("FANOUT_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            max_attempts: env_parse("FANOUT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            retry_backoff_ms: env_parse("FANOUT_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?,
            sink_timeout_secs: env_parse("FANOUT_SINK_TIMEOUT_SECS", DEFAULT_SINK_TIMEOUT_SECS)?,
            archive_on_partial: env_parse("FANOUT_ARCHIVE_ON_PARTIAL", true)?,
            ensure_schema: env_parse("FANOUT_ENSURE_SCHEMA", true)?,
        };

        let defaults = FieldMapping::default();
        let mapping = FieldMapping {
            timestamp_field: env_string("FANOUT_TIMESTAMP_FIELD", &defaults.timestamp_field),
            source_field: env_string("FANOUT_SOURCE_FIELD", &defaults.source_field),
            vector_field: env_string("FANOUT_VECTOR_FIELD", &defaults.vector_field),
            dimension_fields: env_list("FANOUT_DIMENSION_FIELDS").into_iter().collect(),
            measure_fields: env_list("FANOUT_MEASURE_FIELDS").into_iter().collect(),
            ..defaults
        };

        let key_policy = KeyPolicy {
            dimensions: env_list("FANOUT_KEY_DIMENSIONS"),
        };

        let source = SourceConfig {
            kind: env_parse("FANOUT_SOURCE", SourceKind::S3)?,
            layout: ArtifactLayout {
                input_prefix: env_string("FANOUT_INPUT_PREFIX", DEFAULT_INPUT_PREFIX),
                archive_prefix: env_string("FANOUT_ARCHIVE_PREFIX", DEFAULT_ARCHIVE_PREFIX),
                quarantine_prefix: env_string("FANOUT_QUARANTINE_PREFIX", DEFAULT_QUARANTINE_PREFIX),
            },
            local_root: PathBuf::from(env_string("FANOUT_LOCAL_ROOT", DEFAULT_LOCAL_ROOT)),
            s3: StorageConfig::from_env()?,
        };

        let enabled = match env::var("FANOUT_ENABLED_SINKS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<SinkKind>().map_err(anyhow::Error::msg))
                .collect::<anyhow::Result<Vec<_>>>()
                .context("Invalid FANOUT_ENABLED_SINKS")?,
            _ => SinkKind::ALL.to_vec(),
        };

        let sinks = SinksConfig {
            enabled,
            timescale: TimescaleConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS)?,
                connect_timeout_secs: env_parse(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            clickhouse: ClickHouseConfig {
                url: env_string("CLICKHOUSE_URL", DEFAULT_CLICKHOUSE_URL),
                user: env_string("CLICKHOUSE_USER", DEFAULT_CLICKHOUSE_USER),
                password: env_optional("CLICKHOUSE_PASSWORD"),
                database: env_string("CLICKHOUSE_DATABASE", DEFAULT_CLICKHOUSE_DATABASE),
                max_error_ratio: env_parse("CLICKHOUSE_MAX_ERROR_RATIO", DEFAULT_CLICKHOUSE_MAX_ERROR_RATIO)?,
            },
            elasticsearch: ElasticsearchConfig {
                url: env_string("ES_URL", DEFAULT_ES_URL),
                user: env_optional("ES_USER"),
                password: env_optional("ES_PASSWORD"),
            },
            qdrant: QdrantConfig {
                url: env_string("QDRANT_URL", DEFAULT_QDRANT_URL),
                api_key: env_optional("QDRANT_API_KEY"),
                vector_size: env_parse("QDRANT_VECTOR_SIZE", DEFAULT_QDRANT_VECTOR_SIZE)?,
            },
        };

        Ok(Config {
            pipeline,
            mapping,
            key_policy,
            source,
            sinks,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_identifier(&self.pipeline.target_name)
            .context("Invalid FANOUT_TARGET_NAME")?;

        if self.pipeline.max_attempts == 0 {
            anyhow::bail!("FANOUT_MAX_ATTEMPTS must be greater than 0");
        }

        if self.pipeline.sink_timeout_secs == 0 {
            anyhow::bail!("FANOUT_SINK_TIMEOUT_SECS must be greater than 0");
        }

        if self.pipeline.poll_interval_secs == 0 {
            anyhow::bail!("FANOUT_POLL_INTERVAL_SECS must be greater than 0");
        }

        if self.sinks.enabled.is_empty() {
            anyhow::bail!("At least one sink must be enabled");
        }

        let unique: BTreeSet<_> = self.sinks.enabled.iter().collect();
        if unique.len() != self.sinks.enabled.len() {
            anyhow::bail!("FANOUT_ENABLED_SINKS lists a sink more than once");
        }

        if self.mapping.timestamp_field.trim().is_empty() {
            anyhow::bail!("FANOUT_TIMESTAMP_FIELD cannot be empty");
        }

        if let Some(both) = self
            .mapping
            .dimension_fields
            .intersection(&self.mapping.measure_fields)
            .next()
        {
            anyhow::bail!("Field '{}' is listed both as a dimension and a measure", both);
        }

        self.source.layout.validate()?;

        if self.source.kind == SourceKind::S3 && self.source.s3.bucket.is_empty() {
            anyhow::bail!("S3_BUCKET cannot be empty");
        }

        for kind in &self.sinks.enabled {
            match kind {
                SinkKind::Timescale => {
                    if self.sinks.timescale.url.is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if self.sinks.timescale.max_connections == 0 {
                        anyhow::bail!("DATABASE_MAX_CONNECTIONS must be greater than 0");
                    }
                },
                SinkKind::ClickHouse => {
                    validate_identifier(&self.sinks.clickhouse.database)
                        .context("Invalid CLICKHOUSE_DATABASE")?;
                    let ratio = self.sinks.clickhouse.max_error_ratio;
                    if !(0.0..=1.0).contains(&ratio) {
                        anyhow::bail!("CLICKHOUSE_MAX_ERROR_RATIO must be between 0 and 1, got {}", ratio);
                    }
                },
                SinkKind::Elasticsearch => {
                    if self.sinks.elasticsearch.url.is_empty() {
                        anyhow::bail!("ES_URL cannot be empty");
                    }
                },
                SinkKind::Qdrant => {
                    if self.sinks.qdrant.vector_size == 0 {
                        anyhow::bail!("QDRANT_VECTOR_SIZE must be greater than 0");
                    }
                },
            }
        }

        Ok(())
    }
}

/// Check that a name is safe to splice into SQL and URLs
pub fn validate_identifier(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        anyhow::bail!(
            "'{}' is not a valid identifier (letters, digits and '_', at most {} characters)",
            name,
            MAX_IDENTIFIER_LEN
        );
    }
    Ok(())
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn env_string(name: &str, default: &str) -> String {
    env_optional(name).unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", raw, name, e)),
        None => Ok(default),
    }
}

fn env_list(name: &str) -> Vec<String> {
    env_optional(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "FANOUT_TARGET_NAME",
        "FANOUT_MAX_ATTEMPTS",
        "FANOUT_ENABLED_SINKS",
        "FANOUT_KEY_DIMENSIONS",
        "FANOUT_MEASURE_FIELDS",
        "FANOUT_SOURCE",
        "FANOUT_ARCHIVE_ON_PARTIAL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_are_valid() {
        clear_env();
        let config = Config::from_env().unwrap();

        assert_eq!(config.pipeline.target_name, DEFAULT_TARGET_NAME);
        assert_eq!(config.pipeline.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.sinks.enabled, SinkKind::ALL.to_vec());
        assert!(config.pipeline.archive_on_partial);
        assert!(config.key_policy.dimensions.is_empty());
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("FANOUT_TARGET_NAME", "sensor_readings");
        env::set_var("FANOUT_ENABLED_SINKS", "timescale, qdrant");
        env::set_var("FANOUT_KEY_DIMENSIONS", "metric_name");
        env::set_var("FANOUT_MEASURE_FIELDS", "temperature,humidity");
        env::set_var("FANOUT_SOURCE", "local");
        env::set_var("FANOUT_ARCHIVE_ON_PARTIAL", "false");

        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.pipeline.target_name, "sensor_readings");
        assert_eq!(config.sinks.enabled, vec![SinkKind::Timescale, SinkKind::Qdrant]);
        assert_eq!(config.key_policy.dimensions, vec!["metric_name".to_string()]);
        assert!(config.mapping.measure_fields.contains("humidity"));
        assert_eq!(config.source.kind, SourceKind::Local);
        assert!(!config.pipeline.archive_on_partial);
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_are_reported() {
        clear_env();
        env::set_var("FANOUT_MAX_ATTEMPTS", "many");
        let err = Config::from_env().unwrap_err();
        clear_env();
        assert!(err.to_string().contains("FANOUT_MAX_ATTEMPTS"));
    }

    #[test]
    #[serial]
    fn test_validate_rejects_bad_settings() {
        clear_env();
        let mut config = Config::from_env().unwrap();
        config.pipeline.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_env().unwrap();
        config.sinks.enabled.clear();
        assert!(config.validate().is_err());

        let mut config = Config::from_env().unwrap();
        config.pipeline.target_name = "metrics; DROP TABLE x".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("metrics").is_ok());
        assert!(validate_identifier("_sensor_2024").is_ok());
        assert!(validate_identifier("2metrics").is_err());
        assert!(validate_identifier("my-metrics").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }
}
