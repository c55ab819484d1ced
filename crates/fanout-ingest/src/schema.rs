//! Canonical schema contract
//!
//! Operator-facing description of the canonical record and of which sinks
//! store or drop each field. Must stay in line with the sink projections.

use serde::Serialize;
use std::fmt::Write;

use crate::sinks::{Idempotency, SinkKind};

#[derive(Debug, Clone, Serialize)]
pub struct FieldContract {
    pub field: &'static str,
    pub field_type: &'static str,
    pub required: bool,
    pub consumed_by: &'static [SinkKind],
    pub notes: &'static str,
}

impl FieldContract {
    pub fn is_consumed_by(&self, sink: SinkKind) -> bool {
        self.consumed_by.contains(&sink)
    }
}

const ALL_SINKS: &[SinkKind] = &SinkKind::ALL;

pub const CANONICAL_FIELDS: &[FieldContract] = &[
    FieldContract {
        field: "timestamp",
        field_type: "UTC instant",
        required: true,
        consumed_by: ALL_SINKS,
        notes: "records without a parseable timestamp are rejected",
    },
    FieldContract {
        field: "source_identifier",
        field_type: "string",
        required: false,
        consumed_by: ALL_SINKS,
        notes: "empty when absent",
    },
    FieldContract {
        field: "record_key",
        field_type: "hex SHA-256",
        required: true,
        consumed_by: ALL_SINKS,
        notes: "derived from timestamp, source_identifier and key dimensions",
    },
    FieldContract {
        field: "dimensions",
        field_type: "map<string, string | null>",
        required: false,
        consumed_by: ALL_SINKS,
        notes: "null entries are omitted by clickhouse",
    },
    FieldContract {
        field: "measures",
        field_type: "map<string, float64 | null>",
        required: false,
        consumed_by: &[SinkKind::Timescale, SinkKind::ClickHouse, SinkKind::Elasticsearch],
        notes: "unparseable values are null plus an annotation",
    },
    FieldContract {
        field: "vector",
        field_type: "array<float32>",
        required: false,
        consumed_by: &[SinkKind::Qdrant],
        notes: "length must equal QDRANT_VECTOR_SIZE",
    },
    FieldContract {
        field: "annotations",
        field_type: "array<{field, raw, reason}>",
        required: false,
        consumed_by: &[SinkKind::Elasticsearch],
        notes: "indexed as validation_issues",
    },
];

/// Plain-text table of the contract for the given sinks
pub fn render_table(sinks: &[SinkKind]) -> String {
    let mut out = String::new();

    let _ = write!(out, "{:<18} {:<28} {:<9}", "FIELD", "TYPE", "REQUIRED");
    for sink in sinks {
        let _ = write!(out, " {:<14}", sink.as_str().to_uppercase());
    }
    out.push('\n');

    for field in CANONICAL_FIELDS {
        let _ = write!(
            out,
            "{:<18} {:<28} {:<9}",
            field.field,
            field.field_type,
            if field.required { "yes" } else { "no" }
        );
        for sink in sinks {
            let cell = if field.is_consumed_by(*sink) { "stored" } else { "dropped" };
            let _ = write!(out, " {:<14}", cell);
        }
        out.push('\n');
    }

    out.push('\n');
    for sink in sinks {
        let semantics = match sink.idempotency() {
            Idempotency::Upsert => "keyed upsert on record_key",
            Idempotency::Append => "append, at-least-once (retries may duplicate)",
        };
        let _ = writeln!(out, "{:<14} {:<24} {}", sink.as_str(), sink.family(), semantics);
    }

    out
}
