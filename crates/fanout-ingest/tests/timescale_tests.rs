//! Time-series sink against a real PostgreSQL
//!
//! Needs Docker. Run with `cargo test -p fanout-ingest --test timescale_tests -- --ignored`.

mod common;

use anyhow::Result;
use common::{init_tracing, json_readings};
use fanout_ingest::normalizer::{InputFormat, Normalizer};
use fanout_ingest::record::Batch;
use fanout_ingest::sinks::{SinkAdapter, SinkStatus, TimescaleSink};
use sqlx::postgres::PgPoolOptions;
use serde_json::json;
use sqlx::PgPool;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, PgPool)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
    Ok((container, pool))
}

fn batch(body: &[u8]) -> Batch {
    Normalizer::default()
        .normalize_artifact("incoming/readings.json", body, InputFormat::Json)
        .batch
}

async fn row_count(pool: &PgPool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM metrics").fetch_one(pool).await?)
}

#[tokio::test]
#[ignore]
async fn test_replayed_batch_is_upserted() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let sink = TimescaleSink::new(pool.clone(), "metrics");

    sink.health_check().await?;
    sink.ensure_schema().await?;
    // Second call is a no-op
    sink.ensure_schema().await?;

    let batch = batch(&json_readings(6, &[1]));
    let first = sink.write(&batch).await;
    assert_eq!(first.status, SinkStatus::Success);
    assert_eq!(first.written_count, 5);

    let replay = sink.write(&batch).await;
    assert_eq!(replay.status, SinkStatus::Success);
    assert_eq!(row_count(&pool).await?, 5);

    let temperature: Option<f64> = sqlx::query_scalar(
        "SELECT (measures->>'temperature')::float8 FROM metrics WHERE source_identifier = 'device_000' ORDER BY time LIMIT 1",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(temperature, Some(20.0));

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_missing_table_is_schema_rejection() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let sink = TimescaleSink::new(pool, "metrics");

    let outcome = sink.write(&batch(&json_readings(2, &[]))).await;

    assert_eq!(outcome.status, SinkStatus::Failure);
    assert!(matches!(
        outcome.error,
        Some(fanout_ingest::error::SinkError::SchemaRejection(_))
    ));
    Ok(())
}

/// Four readings from one device; the one at `bad` carries a NUL byte,
/// which PostgreSQL refuses inside JSONB
fn readings_with_nul_dimension(bad: usize) -> Vec<u8> {
    let items: Vec<_> = (0..4)
        .map(|i| {
            let location = if i == bad { "zone\u{0000}a" } else { "zone_a" };
            json!({
                "timestamp": format!("2024-01-15T10:{:02}:00Z", i),
                "device_id": "device_000",
                "temperature": 20.0 + i as f64,
                "location": location,
            })
        })
        .collect();
    serde_json::to_vec(&items).unwrap()
}

#[tokio::test]
#[ignore]
async fn test_rejected_row_falls_back_to_partial() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let sink = TimescaleSink::new(pool.clone(), "metrics");
    sink.ensure_schema().await?;

    let outcome = sink.write(&batch(&readings_with_nul_dimension(2))).await;

    assert_eq!(outcome.status, SinkStatus::Partial);
    assert_eq!(outcome.written_count, 3);
    assert!(outcome.error_detail.unwrap().contains("22P05"));
    assert!(matches!(
        outcome.error,
        Some(fanout_ingest::error::SinkError::SchemaRejection(_))
    ));
    assert_eq!(row_count(&pool).await?, 3);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_duplicate_keys_count_once() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;
    let sink = TimescaleSink::new(pool.clone(), "metrics");
    sink.ensure_schema().await?;

    let reading = json!({
        "timestamp": "2024-01-15T10:00:00Z",
        "device_id": "device_000",
        "temperature": 21.0,
    });
    let body = serde_json::to_vec(&json!([reading, reading, reading]))?;
    let batch = batch(&body);
    assert_eq!(batch.len(), 3);

    let outcome = sink.write(&batch).await;

    assert_eq!(outcome.status, SinkStatus::Success);
    assert_eq!(outcome.written_count, 1);
    assert_eq!(row_count(&pool).await?, 1);
    Ok(())
}
