//! Vector sink (Qdrant REST API)
//!
//! Point ids are UUIDv5 of the record key, so re-delivery overwrites the same
//! point. Records without a vector have nothing to store here and are skipped.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{classify_status, classify_transport, http_client, SinkAdapter, SinkKind, SinkOutcome, WriteSummary};
use crate::config::QdrantConfig;
use crate::error::SinkError;
use crate::record::{Batch, CanonicalRecord};

/// Deterministic point id for a record key
pub fn point_id(record_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_key.as_bytes())
}

/// Projection: measures and annotations are dropped
///
/// `None` when the record has no vector.
pub fn project(record_key: &str, record: &CanonicalRecord) -> Option<Value> {
    let vector = record.vector()?;
    Some(json!({
        "id": point_id(record_key).to_string(),
        "vector": vector,
        "payload": {
            "record_key": record_key,
            "timestamp": record.timestamp().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "source_identifier": record.source_identifier(),
            "dimensions": record.dimensions(),
        }
    }))
}

pub struct QdrantSink {
    client: Client,
    config: QdrantConfig,
    collection: String,
}

impl QdrantSink {
    pub fn new(config: QdrantConfig, collection: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(10))?,
            config,
            collection: collection.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    /// Points to upsert, with local rejection of wrong-sized vectors
    fn points(&self, batch: &Batch) -> (Vec<Value>, WriteSummary) {
        let mut points = Vec::new();
        let mut summary = WriteSummary::default();

        for (key, record) in batch.keyed() {
            if let Some(vector) = record.vector() {
                if vector.len() != self.config.vector_size {
                    summary.reject(format!(
                        "record {}: vector has {} dimensions, collection expects {}",
                        key,
                        vector.len(),
                        self.config.vector_size
                    ));
                    continue;
                }
            }
            if let Some(point) = project(key, record) {
                points.push(point);
            }
        }
        (points, summary)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, SinkError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &response.text().await.unwrap_or_default()));
        }
        Ok(response)
    }
}

#[async_trait]
impl SinkAdapter for QdrantSink {
    fn name(&self) -> &str {
        SinkKind::Qdrant.as_str()
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Qdrant
    }

    async fn write(&self, batch: &Batch) -> SinkOutcome {
        let (points, mut summary) = self.points(batch);
        if points.is_empty() {
            return summary.into_outcome(self.name());
        }

        let request = self
            .client
            .put(self.url(&format!("collections/{}/points", self.collection)))
            .query(&[("wait", "true")])
            .json(&json!({ "points": points }));

        match self.send(request).await {
            Ok(_) => {
                debug!(collection = %self.collection, points = points.len(), "Upserted points");
                summary.written = points.len();
                summary.into_outcome(self.name())
            },
            Err(error) => SinkOutcome::failure(self.name(), error),
        }
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let path = format!("collections/{}", self.collection);
        let response = self
            .authorize(self.client.get(self.url(&path)))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        match response.status() {
            status if status.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {},
            status => return Err(classify_status(status, &response.text().await.unwrap_or_default())),
        }

        let body = json!({
            "vectors": { "size": self.config.vector_size, "distance": "Cosine" }
        });
        self.send(self.client.put(self.url(&path)).json(&body)).await?;
        info!(collection = %self.collection, size = self.config.vector_size, "Qdrant collection created");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        self.send(self.client.get(self.url("healthz"))).await.map(|_| ())
    }
}
