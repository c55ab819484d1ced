//! Relational / time-series sink (PostgreSQL, hypertable when TimescaleDB is present)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SinkAdapter, SinkKind, SinkOutcome, WriteSummary};
use crate::config::TimescaleConfig;
use crate::error::SinkError;
use crate::record::{Batch, CanonicalRecord};

/// Rows per INSERT statement (5 binds each, well below the 65535 limit)
const ROWS_PER_STATEMENT: usize = 1000;

/// One table row as written by this sink
#[derive(Debug, Clone, PartialEq)]
pub struct TimescaleRow {
    pub time: DateTime<Utc>,
    pub record_key: String,
    pub source_identifier: String,
    pub dimensions: Value,
    pub measures: Value,
}

/// Projection: vector and annotations are not stored
pub fn project(record_key: &str, record: &CanonicalRecord) -> TimescaleRow {
    let dimensions: Map<String, Value> = record
        .dimensions()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().map(Value::String).unwrap_or(Value::Null)))
        .collect();
    let measures: Map<String, Value> = record
        .measures()
        .iter()
        .map(|(k, v)| (k.clone(), v.map(Value::from).unwrap_or(Value::Null)))
        .collect();

    TimescaleRow {
        time: record.timestamp(),
        record_key: record_key.to_string(),
        source_identifier: record.source_identifier().to_string(),
        dimensions: Value::Object(dimensions),
        measures: Value::Object(measures),
    }
}

/// Keyed upsert into a PostgreSQL table
pub struct TimescaleSink {
    pool: PgPool,
    table: String,
}

impl TimescaleSink {
    /// `table` must already be a validated identifier
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Create a pool that connects on first use
    pub fn connect_lazy(config: &TimescaleConfig, table: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy(&config.url)?;
        Ok(Self::new(pool, table))
    }

    fn insert_prefix(&self) -> String {
        format!(
            "INSERT INTO {} (time, record_key, source_identifier, dimensions, measures) ",
            self.table
        )
    }

    fn conflict_clause() -> &'static str {
        " ON CONFLICT (time, record_key) DO UPDATE SET \
         source_identifier = EXCLUDED.source_identifier, \
         dimensions = EXCLUDED.dimensions, \
         measures = EXCLUDED.measures"
    }

    /// All rows in one transaction; returns the number of rows upserted
    async fn write_bulk(&self, rows: &[TimescaleRow]) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut upserted = 0;

        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(self.insert_prefix());
            query_builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.time)
                    .push_bind(&row.record_key)
                    .push_bind(&row.source_identifier)
                    .push_bind(&row.dimensions)
                    .push_bind(&row.measures);
            });
            query_builder.push(Self::conflict_clause());

            upserted += query_builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(upserted)
    }

    /// Row by row, to isolate the rows the database rejects
    async fn write_each(&self, rows: &[TimescaleRow]) -> Result<WriteSummary, SinkError> {
        let mut summary = WriteSummary::default();
        let sql = format!(
            "{}VALUES ($1, $2, $3, $4, $5){}",
            self.insert_prefix(),
            Self::conflict_clause()
        );

        for row in rows {
            let result = sqlx::query(&sql)
                .bind(row.time)
                .bind(&row.record_key)
                .bind(&row.source_identifier)
                .bind(&row.dimensions)
                .bind(&row.measures)
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => summary.written += 1,
                Err(e) => match classify(&e) {
                    SinkError::SchemaRejection(reason) => {
                        summary.reject(format!("record {}: {}", row.record_key, reason))
                    },
                    // Connection lost mid-way: what was written stays written
                    other if summary.written == 0 => return Err(other),
                    other => {
                        summary.reject(other.to_string());
                        break;
                    },
                },
            }
        }

        Ok(summary)
    }
}

/// Collapse rows sharing a primary key, last one wins
///
/// PostgreSQL refuses to update the same row twice in one statement.
fn dedupe(rows: Vec<TimescaleRow>) -> Vec<TimescaleRow> {
    let mut positions: HashMap<(DateTime<Utc>, String), usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<TimescaleRow> = Vec::with_capacity(rows.len());

    for row in rows {
        let key = (row.time, row.record_key.clone());
        match positions.get(&key) {
            Some(&idx) => unique[idx] = row,
            None => {
                positions.insert(key, unique.len());
                unique.push(row);
            },
        }
    }
    unique
}

/// Map a database error to a sink error by SQLSTATE class
pub(crate) fn classify(err: &sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let detail = format!("{} (SQLSTATE {})", db.message(), code);
            match code.get(..2) {
                Some("28") => SinkError::AuthFailure(detail),
                Some("22") | Some("23") | Some("42") => SinkError::SchemaRejection(detail),
                _ => SinkError::BackendUnavailable(detail),
            }
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Encode(_) | sqlx::Error::TypeNotFound { .. } => {
            SinkError::SchemaRejection(err.to_string())
        },
        _ => SinkError::BackendUnavailable(err.to_string()),
    }
}

#[async_trait]
impl SinkAdapter for TimescaleSink {
    fn name(&self) -> &str {
        SinkKind::Timescale.as_str()
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Timescale
    }

    async fn write(&self, batch: &Batch) -> SinkOutcome {
        let rows = dedupe(batch.keyed().map(|(key, record)| project(key, record)).collect());
        if rows.is_empty() {
            return SinkOutcome::success(self.name(), 0);
        }

        match self.write_bulk(&rows).await {
            Ok(upserted) => {
                debug!(table = %self.table, rows = upserted, collapsed = batch.len() - rows.len(), "Upserted rows");
                SinkOutcome::success(self.name(), upserted as usize)
            },
            Err(e) => match classify(&e) {
                SinkError::SchemaRejection(reason) => {
                    warn!(table = %self.table, %reason, "Bulk upsert rejected, retrying row by row");
                    match self.write_each(&rows).await {
                        Ok(summary) => summary.into_outcome(self.name()),
                        Err(error) => SinkOutcome::failure(self.name(), error),
                    }
                },
                error => SinkOutcome::failure(self.name(), error),
            },
        }
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                time TIMESTAMPTZ NOT NULL,
                record_key TEXT NOT NULL,
                source_identifier TEXT NOT NULL DEFAULT '',
                dimensions JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                measures JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                PRIMARY KEY (time, record_key)
            )
            "#,
            self.table
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(&e))?;

        let has_timescale: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| classify(&e))?;

        if has_timescale {
            sqlx::query("SELECT create_hypertable($1, 'time', if_not_exists => TRUE, migrate_data => TRUE)")
                .bind(&self.table)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(&e))?;
            info!(table = %self.table, "Hypertable ready");
        } else {
            info!(table = %self.table, "Table ready (timescaledb extension not installed)");
        }

        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| classify(&e))
    }
}
