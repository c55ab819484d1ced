//! Columnar sink over the ClickHouse HTTP interface
//!
//! Rows are appended with `INSERT ... FORMAT JSONEachRow`. Malformed rows are
//! skipped server-side up to `input_format_allow_errors_ratio`; the accepted
//! count comes back in the `X-ClickHouse-Summary` header. There is no keyed
//! dedup, so a retried batch may be appended twice.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::{classify_status, classify_transport, http_client, truncate, SinkAdapter, SinkKind, SinkOutcome, WriteSummary};
use crate::config::ClickHouseConfig;
use crate::error::SinkError;
use crate::record::{Batch, CanonicalRecord};

const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";
const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Exception codes meaning the credentials were refused
const AUTH_EXCEPTION_CODES: &[&str] = &["192", "193", "194", "195", "516"];

/// Exception codes meaning the data or target schema was refused
const SCHEMA_EXCEPTION_CODES: &[&str] = &["16", "26", "27", "53", "60", "62", "81", "117"];

/// Projection: vector and annotations are dropped, null map entries omitted
pub fn project(record_key: &str, record: &CanonicalRecord) -> Value {
    let dimensions: Map<String, Value> = record
        .dimensions()
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), Value::String(v.clone()))))
        .collect();
    let measures: Map<String, Value> = record
        .measures()
        .iter()
        .filter_map(|(k, v)| v.map(|v| (k.clone(), Value::from(v))))
        .collect();

    json!({
        "time": record.timestamp().format(TIMESTAMP_FORMAT).to_string(),
        "record_key": record_key,
        "source_identifier": record.source_identifier(),
        "dimensions": dimensions,
        "measures": measures,
    })
}

pub struct ClickHouseSink {
    client: Client,
    config: ClickHouseConfig,
    table: String,
}

impl ClickHouseSink {
    pub fn new(config: ClickHouseConfig, table: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(10))?,
            config,
            table: table.into(),
        })
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.config.database, self.table)
    }

    fn request(&self, query: &str) -> RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/", self.config.url.trim_end_matches('/')))
            .query(&[("query", query)])
            .header("X-ClickHouse-User", &self.config.user);
        if let Some(password) = &self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        request
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, SinkError> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Err(classify_exception(status, code.as_deref(), &body))
    }
}

fn classify_exception(status: reqwest::StatusCode, code: Option<&str>, body: &str) -> SinkError {
    match code {
        Some(code) if AUTH_EXCEPTION_CODES.contains(&code) => SinkError::AuthFailure(truncate(body.trim())),
        Some(code) if SCHEMA_EXCEPTION_CODES.contains(&code) => {
            SinkError::SchemaRejection(truncate(body.trim()))
        },
        _ => classify_status(status, body),
    }
}

/// `written_rows` from the summary header; values are JSON strings
fn written_rows(summary: &str) -> Option<usize> {
    let summary: Value = serde_json::from_str(summary).ok()?;
    match &summary["written_rows"] {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        _ => None,
    }
}

#[async_trait]
impl SinkAdapter for ClickHouseSink {
    fn name(&self) -> &str {
        SinkKind::ClickHouse.as_str()
    }

    fn kind(&self) -> SinkKind {
        SinkKind::ClickHouse
    }

    async fn write(&self, batch: &Batch) -> SinkOutcome {
        if batch.is_empty() {
            return SinkOutcome::success(self.name(), 0);
        }

        let mut body = String::new();
        for (key, record) in batch.keyed() {
            body.push_str(&project(key, record).to_string());
            body.push('\n');
        }

        let query = format!("INSERT INTO {} FORMAT JSONEachRow", self.qualified_table());
        let request = self
            .request(&query)
            .query(&[
                ("input_format_allow_errors_ratio", self.config.max_error_ratio.to_string()),
                ("date_time_input_format", "best_effort".to_string()),
            ])
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        let response = match self.execute(request).await {
            Ok(response) => response,
            Err(error) => return SinkOutcome::failure(self.name(), error),
        };

        let written = response
            .headers()
            .get(SUMMARY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(written_rows)
            .unwrap_or(batch.len())
            .min(batch.len());

        debug!(table = %self.qualified_table(), written, "Inserted rows");

        let mut summary = WriteSummary {
            written,
            first_rejection: None,
        };
        if written < batch.len() {
            summary.reject(format!(
                "{} of {} rows skipped by the server as malformed",
                batch.len() - written,
                batch.len()
            ));
        }
        summary.into_outcome(self.name())
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                time DateTime64(6, 'UTC'), \
                record_key String, \
                source_identifier String, \
                dimensions Map(String, String), \
                measures Map(String, Float64)\
             ) ENGINE = MergeTree ORDER BY (source_identifier, time)",
            self.qualified_table()
        );
        self.execute(self.request(&ddl)).await?;
        info!(table = %self.qualified_table(), "ClickHouse table ready");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        let response = self
            .client
            .get(format!("{}/ping", self.config.url.trim_end_matches('/')))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(classify_status(status, &response.text().await.unwrap_or_default()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_projection_shape() {
        let record = CanonicalRecord::builder(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap())
            .source_identifier("device_001")
            .dimension("zone", Some("a".to_string()))
            .dimension("floor", None)
            .measure("temperature", Some(21.5))
            .measure("pressure", None)
            .vector(vec![1.0])
            .build();

        let row = project("k1", &record);

        assert_eq!(row["time"], "2024-01-15 10:00:00.000000");
        assert_eq!(row["record_key"], "k1");
        assert_eq!(row["dimensions"], json!({ "zone": "a" }));
        assert_eq!(row["measures"], json!({ "temperature": 21.5 }));
        assert!(row.get("vector").is_none());
    }

    #[test]
    fn test_written_rows_from_summary() {
        let header = r#"{"read_rows":"0","read_bytes":"0","written_rows":"8","written_bytes":"512"}"#;
        assert_eq!(written_rows(header), Some(8));
        assert_eq!(written_rows("not json"), None);
    }

    #[test]
    fn test_exception_codes() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_exception(StatusCode::INTERNAL_SERVER_ERROR, Some("516"), "auth"),
            SinkError::AuthFailure(_)
        ));
        assert!(matches!(
            classify_exception(StatusCode::NOT_FOUND, Some("60"), "Table default.metrics doesn't exist"),
            SinkError::SchemaRejection(_)
        ));
        assert!(matches!(
            classify_exception(StatusCode::SERVICE_UNAVAILABLE, None, ""),
            SinkError::BackendUnavailable(_)
        ));
    }
}
