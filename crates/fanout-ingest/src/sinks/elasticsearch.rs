//! Full-text search sink (Elasticsearch `_bulk` API)

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::{classify_status, classify_transport, http_client, SinkAdapter, SinkKind, SinkOutcome, WriteSummary};
use crate::config::ElasticsearchConfig;
use crate::error::SinkError;
use crate::record::{Batch, CanonicalRecord};

/// Projection: the vector is dropped; annotations become `validation_issues`
pub fn project(record: &CanonicalRecord) -> Value {
    json!({
        "@timestamp": record.timestamp().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        "source_identifier": record.source_identifier(),
        "dimensions": record.dimensions(),
        "measures": record.measures(),
        "validation_issues": record.annotations(),
    })
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<std::collections::HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl BulkItem {
    fn reason(&self) -> String {
        let id = self.id.as_deref().unwrap_or("?");
        match &self.error {
            Some(error) => format!(
                "document {}: {}: {}",
                id,
                error["type"].as_str().unwrap_or("error"),
                error["reason"].as_str().unwrap_or("unknown reason")
            ),
            None => format!("document {}: status {}", id, self.status),
        }
    }
}

/// Document per record, `_id` = record key
pub struct ElasticsearchSink {
    client: Client,
    config: ElasticsearchConfig,
    index: String,
}

impl ElasticsearchSink {
    pub fn new(config: ElasticsearchConfig, target_name: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(10))?,
            config,
            // Index names must be lowercase
            index: target_name.to_lowercase(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.user {
            Some(user) => request.basic_auth(user, self.config.password.as_ref()),
            None => request,
        }
    }

    fn bulk_body(&self, batch: &Batch) -> String {
        let mut body = String::new();
        for (key, record) in batch.keyed() {
            let action = json!({ "index": { "_index": self.index, "_id": key } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&project(record).to_string());
            body.push('\n');
        }
        body
    }

    async fn bulk(&self, batch: &Batch) -> Result<WriteSummary, SinkError> {
        let request = self
            .client
            .post(self.url("_bulk"))
            .header("Content-Type", "application/x-ndjson")
            .body(self.bulk_body(batch));

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &response.text().await.unwrap_or_default()));
        }

        let parsed: BulkResponse = response.json().await.map_err(|e| classify_transport(&e))?;

        let mut summary = WriteSummary::default();
        if !parsed.errors {
            summary.written = batch.len();
            return Ok(summary);
        }

        for item in parsed.items.iter().flat_map(|entry| entry.values()) {
            if (200..300).contains(&item.status) {
                summary.written += 1;
            } else {
                summary.reject(item.reason());
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl SinkAdapter for ElasticsearchSink {
    fn name(&self) -> &str {
        SinkKind::Elasticsearch.as_str()
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Elasticsearch
    }

    async fn write(&self, batch: &Batch) -> SinkOutcome {
        if batch.is_empty() {
            return SinkOutcome::success(self.name(), 0);
        }

        match self.bulk(batch).await {
            Ok(summary) => {
                debug!(index = %self.index, written = summary.written, "Bulk indexed documents");
                summary.into_outcome(self.name())
            },
            Err(error) => SinkOutcome::failure(self.name(), error),
        }
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let response = self
            .authorize(self.client.head(self.url(&self.index)))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        match response.status() {
            status if status.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {},
            status => return Err(classify_status(status, "")),
        }

        let mapping = json!({
            "mappings": {
                "dynamic_templates": [
                    { "dimensions_as_keywords": {
                        "path_match": "dimensions.*",
                        "mapping": { "type": "keyword" }
                    }},
                    { "measures_as_doubles": {
                        "path_match": "measures.*",
                        "mapping": { "type": "double" }
                    }}
                ],
                "properties": {
                    "@timestamp": { "type": "date" },
                    "source_identifier": { "type": "keyword" },
                    "validation_issues": { "type": "object", "enabled": false }
                }
            }
        });

        let response = self
            .authorize(self.client.put(self.url(&self.index)).json(&mapping))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        // Created concurrently by another worker
        if status.is_success() || body.contains("resource_already_exists_exception") {
            info!(index = %self.index, "Elasticsearch index ready");
            return Ok(());
        }
        Err(classify_status(status, &body))
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        let response = self
            .authorize(self.client.get(self.url("_cluster/health")))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &response.text().await.unwrap_or_default()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::{FieldAnnotation, KeyPolicy};
    use chrono::{TimeZone, Utc};

    fn batch() -> Batch {
        let record = CanonicalRecord::builder(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap())
            .source_identifier("device_001")
            .measure("pressure", None)
            .annotate(FieldAnnotation {
                field: "pressure".to_string(),
                raw: "n/a".to_string(),
                reason: "not a number".to_string(),
            })
            .vector(vec![0.5])
            .build();
        Batch::new("incoming/a.json", vec![record], &KeyPolicy::default())
    }

    #[test]
    fn test_bulk_body_pairs_action_and_document() {
        let sink = ElasticsearchSink::new(ElasticsearchConfig::default(), "Metrics").unwrap();
        let batch = batch();
        let body = sink.bulk_body(&batch);
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        let (key, _) = batch.keyed().next().unwrap();
        assert_eq!(lines[0]["index"]["_index"], "metrics");
        assert_eq!(lines[0]["index"]["_id"], key);
        assert_eq!(lines[1]["@timestamp"], "2024-01-15T10:00:00.000000Z");
        assert!(lines[1]["measures"]["pressure"].is_null());
        assert_eq!(lines[1]["validation_issues"][0]["raw"], "n/a");
        assert!(lines[1].get("vector").is_none());
        assert!(body.ends_with('\n'));
    }
}
