//! Canonical record and batch types
//!
//! A [`CanonicalRecord`] is built once by the normalizer and never mutated
//! afterwards. A [`Batch`] owns the records of one artifact together with
//! their idempotency keys, and is shared read-only by every sink.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Why a field value was kept as null
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAnnotation {
    pub field: String,
    pub raw: String,
    pub reason: String,
}

/// Normalized, typed representation of one input row or object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    timestamp: DateTime<Utc>,
    source_identifier: String,
    dimensions: BTreeMap<String, Option<String>>,
    measures: BTreeMap<String, Option<f64>>,
    vector: Option<Vec<f32>>,
    annotations: Vec<FieldAnnotation>,
}

impl CanonicalRecord {
    /// Start building a record; the timestamp is the only required field
    pub fn builder(timestamp: DateTime<Utc>) -> RecordBuilder {
        RecordBuilder {
            record: CanonicalRecord {
                timestamp,
                source_identifier: String::new(),
                dimensions: BTreeMap::new(),
                measures: BTreeMap::new(),
                vector: None,
                annotations: Vec::new(),
            },
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source_identifier(&self) -> &str {
        &self.source_identifier
    }

    pub fn dimensions(&self) -> &BTreeMap<String, Option<String>> {
        &self.dimensions
    }

    pub fn measures(&self) -> &BTreeMap<String, Option<f64>> {
        &self.measures
    }

    pub fn vector(&self) -> Option<&[f32]> {
        self.vector.as_deref()
    }

    pub fn annotations(&self) -> &[FieldAnnotation] {
        &self.annotations
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).and_then(|v| v.as_deref())
    }

    pub fn measure(&self, name: &str) -> Option<f64> {
        self.measures.get(name).copied().flatten()
    }

    /// Deterministic idempotency key
    ///
    /// SHA-256 over the timestamp (RFC 3339, microseconds, `Z`), the source
    /// identifier and, in order, each `name=value` of `key_dimensions`.
    pub fn record_key(&self, key_dimensions: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            self.timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .as_bytes(),
        );
        hasher.update([0x1f]);
        hasher.update(self.source_identifier.as_bytes());

        for name in key_dimensions {
            hasher.update([0x1f]);
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            if let Some(value) = self.dimension(name) {
                hasher.update(value.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }
}

/// Builder used by the normalizer and tests
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: CanonicalRecord,
}

impl RecordBuilder {
    pub fn source_identifier(mut self, source: impl Into<String>) -> Self {
        self.record.source_identifier = source.into();
        self
    }

    pub fn dimension(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.record.dimensions.insert(name.into(), value);
        self
    }

    pub fn measure(mut self, name: impl Into<String>, value: Option<f64>) -> Self {
        self.record.measures.insert(name.into(), value);
        self
    }

    pub fn vector(mut self, vector: Vec<f32>) -> Self {
        self.record.vector = Some(vector);
        self
    }

    pub fn annotate(mut self, annotation: FieldAnnotation) -> Self {
        self.record.annotations.push(annotation);
        self
    }

    pub fn build(self) -> CanonicalRecord {
        self.record
    }
}

/// Which dimensions, besides timestamp and source, identify a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub dimensions: Vec<String>,
}

/// Ordered records of one artifact plus their idempotency keys
#[derive(Debug, Clone)]
pub struct Batch {
    artifact_id: String,
    records: Vec<CanonicalRecord>,
    keys: Vec<String>,
}

impl Batch {
    pub fn new(
        artifact_id: impl Into<String>,
        records: Vec<CanonicalRecord>,
        policy: &KeyPolicy,
    ) -> Self {
        let keys = records
            .iter()
            .map(|r| r.record_key(&policy.dimensions))
            .collect();
        Self {
            artifact_id: artifact_id.into(),
            records,
            keys,
        }
    }

    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records paired with their idempotency key, in artifact order
    pub fn keyed(&self) -> impl Iterator<Item = (&str, &CanonicalRecord)> {
        self.keys.iter().map(String::as_str).zip(self.records.iter())
    }
}
