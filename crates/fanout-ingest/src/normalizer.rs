//! Schema normalizer
//!
//! Turns raw input units (JSON objects or CSV rows) into [`CanonicalRecord`]s.
//! Pure: no I/O, no clocks. A record without a parseable timestamp is
//! rejected; any other unparseable value is kept as null and annotated.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::ValidationError;
use crate::record::{Batch, CanonicalRecord, FieldAnnotation, KeyPolicy};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Naive layouts interpreted as UTC
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Offset-carrying layouts that are not RFC 3339
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%dT%H:%M:%S%.f%z"];

/// Epoch values at or above this magnitude are read as milliseconds
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Artifact encodings understood by the normalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// One object, or an array of objects
    Json,
    /// One object per line
    JsonLines,
    /// Header line followed by rows
    Csv,
}

impl InputFormat {
    /// Format implied by the artifact's file extension
    pub fn from_location(location: &str) -> Option<Self> {
        let lower = location.to_ascii_lowercase();
        if lower.ends_with(".csv") {
            Some(InputFormat::Csv)
        } else if lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
            Some(InputFormat::JsonLines)
        } else if lower.ends_with(".json") {
            Some(InputFormat::Json)
        } else {
            None
        }
    }

    /// Guess the format from content
    pub fn sniff(bytes: &[u8]) -> Self {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'[') => InputFormat::Json,
            Some(b'{') if serde_json::from_slice::<Value>(bytes).is_ok() => InputFormat::Json,
            Some(b'{') => InputFormat::JsonLines,
            _ => InputFormat::Csv,
        }
    }

    pub fn detect(location: &str, bytes: &[u8]) -> Self {
        Self::from_location(location).unwrap_or_else(|| Self::sniff(bytes))
    }
}

/// How input field names map onto canonical fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub timestamp_field: String,
    pub source_field: String,
    pub vector_field: String,
    /// Fields always treated as dimensions
    pub dimension_fields: BTreeSet<String>,
    /// Fields always treated as measures
    pub measure_fields: BTreeSet<String>,
    /// Long-format pair: the value becomes a measure named after the name field
    pub metric_name_field: String,
    pub metric_value_field: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            timestamp_field: "timestamp".to_string(),
            source_field: "device_id".to_string(),
            vector_field: "embedding".to_string(),
            dimension_fields: BTreeSet::new(),
            measure_fields: BTreeSet::new(),
            metric_name_field: "metric_name".to_string(),
            metric_value_field: "metric_value".to_string(),
        }
    }
}

impl FieldMapping {
    fn is_reserved(&self, name: &str) -> bool {
        name == self.timestamp_field
            || name == self.source_field
            || name == self.vector_field
            || name == self.metric_name_field
            || name == self.metric_value_field
    }

    fn is_classified(&self, name: &str) -> bool {
        self.dimension_fields.contains(name) || self.measure_fields.contains(name)
    }
}

/// One raw input unit, borrowed from the parsed artifact
#[derive(Debug, Clone, Copy)]
pub enum RawUnit<'a> {
    Json(&'a Value),
    Row {
        headers: &'a StringRecord,
        row: &'a StringRecord,
    },
}

#[derive(Debug, Clone, Copy)]
enum RawValue<'a> {
    Json(&'a Value),
    Text(&'a str),
}

impl<'a> RawValue<'a> {
    fn is_null(self) -> bool {
        match self {
            RawValue::Json(Value::Null) => true,
            RawValue::Json(Value::String(s)) => s.trim().is_empty(),
            RawValue::Json(_) => false,
            RawValue::Text(s) => s.trim().is_empty(),
        }
    }

    fn is_numeric(self) -> bool {
        match self {
            RawValue::Json(Value::Number(n)) => n.as_f64().is_some_and(f64::is_finite),
            RawValue::Json(Value::String(s)) => parse_number(s).is_some(),
            RawValue::Text(s) => parse_number(s).is_some(),
            RawValue::Json(_) => false,
        }
    }

    fn as_text(self) -> Option<String> {
        match self {
            RawValue::Json(Value::Null) => None,
            RawValue::Json(Value::String(s)) => non_empty(s),
            RawValue::Json(other) => Some(other.to_string()),
            RawValue::Text(s) => non_empty(s),
        }
    }
}

impl<'a> RawUnit<'a> {
    fn fields(&self) -> Result<Vec<(&'a str, RawValue<'a>)>, ValidationError> {
        match *self {
            RawUnit::Json(Value::Object(map)) => Ok(map
                .iter()
                .map(|(k, v)| (k.as_str(), RawValue::Json(v)))
                .collect()),
            RawUnit::Json(_) => Err(ValidationError::NotAnObject),
            RawUnit::Row { headers, row } => {
                if headers.len() != row.len() {
                    return Err(ValidationError::MalformedRow(format!(
                        "expected {} fields, found {}",
                        headers.len(),
                        row.len()
                    )));
                }
                Ok(headers
                    .iter()
                    .zip(row.iter())
                    .map(|(k, v)| (k, RawValue::Text(v)))
                    .collect())
            },
        }
    }
}

/// A raw unit excluded from the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// 1-based line, row or array position in the artifact
    pub position: usize,
    pub reason: String,
}

/// Result of normalizing a whole artifact
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub batch: Batch,
    pub records_total: usize,
    pub rejections: Vec<Rejection>,
}

impl NormalizedBatch {
    pub fn rejected(&self) -> usize {
        self.rejections.len()
    }
}

/// Maps raw units onto canonical records
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    mapping: FieldMapping,
    key_policy: KeyPolicy,
}

impl Normalizer {
    pub fn new(mapping: FieldMapping, key_policy: KeyPolicy) -> Self {
        Self {
            mapping,
            key_policy,
        }
    }

    /// Normalize a single raw unit
    ///
    /// Fields not explicitly classified are inferred per value: numbers and
    /// numeric-looking strings become measures, everything else a dimension.
    pub fn normalize(&self, unit: RawUnit<'_>) -> Result<CanonicalRecord, ValidationError> {
        let fields = unit.fields()?;
        let mapping = &self.mapping;
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(field, _)| *field == name)
                .map(|(_, value)| *value)
        };

        let timestamp = match lookup(&mapping.timestamp_field) {
            Some(value) if !value.is_null() => parse_timestamp_value(value)?,
            _ => {
                return Err(ValidationError::MissingTimestamp {
                    field: mapping.timestamp_field.clone(),
                })
            },
        };

        let mut builder = CanonicalRecord::builder(timestamp);

        if let Some(source) = lookup(&mapping.source_field).and_then(RawValue::as_text) {
            builder = builder.source_identifier(source);
        }

        if let Some(raw) = lookup(&mapping.vector_field).filter(|v| !v.is_null()) {
            match parse_vector(raw) {
                Ok(vector) => builder = builder.vector(vector),
                Err(reason) => builder = builder.annotate(annotation(&mapping.vector_field, raw, reason)),
            }
        }

        let metric_name = lookup(&mapping.metric_name_field).and_then(RawValue::as_text);
        if let Some(name) = lookup(&mapping.metric_name_field) {
            builder = builder.dimension(mapping.metric_name_field.clone(), name.as_text());
        }
        if let Some(value) = lookup(&mapping.metric_value_field) {
            let measure_name = metric_name.unwrap_or_else(|| mapping.metric_value_field.clone());
            let (number, note) = coerce_measure(&measure_name, value);
            builder = builder.measure(measure_name, number);
            if let Some(note) = note {
                builder = builder.annotate(note);
            }
        }

        for (name, value) in fields.iter().copied() {
            if mapping.is_reserved(name) {
                continue;
            }

            let is_measure = if mapping.measure_fields.contains(name) {
                true
            } else if mapping.dimension_fields.contains(name) {
                false
            } else {
                value.is_numeric()
            };

            if is_measure {
                let (number, note) = coerce_measure(name, value);
                builder = builder.measure(name, number);
                if let Some(note) = note {
                    builder = builder.annotate(note);
                }
            } else {
                builder = builder.dimension(name, value.as_text());
            }
        }

        Ok(builder.build())
    }

    /// Normalize every unit of an artifact into a batch plus rejections
    ///
    /// Unclassified fields are inferred per column: a field is a measure when
    /// every non-null value across the artifact is numeric.
    pub fn normalize_artifact(
        &self,
        artifact_id: &str,
        bytes: &[u8],
        format: InputFormat,
    ) -> NormalizedBatch {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let mut rejections = Vec::new();
        let mut json_units: Vec<(usize, Value)> = Vec::new();
        let mut csv_rows: Vec<(usize, StringRecord)> = Vec::new();
        let mut headers = StringRecord::new();

        match format {
            InputFormat::Json => match serde_json::from_slice::<Value>(bytes) {
                Ok(Value::Array(items)) => {
                    json_units.extend(items.into_iter().enumerate().map(|(i, v)| (i + 1, v)))
                },
                Ok(value) => json_units.push((1, value)),
                Err(e) => rejections.push(Rejection {
                    position: e.line(),
                    reason: ValidationError::MalformedRow(e.to_string()).to_string(),
                }),
            },
            InputFormat::JsonLines => {
                for (index, line) in String::from_utf8_lossy(bytes).lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => json_units.push((index + 1, value)),
                        Err(e) => rejections.push(Rejection {
                            position: index + 1,
                            reason: ValidationError::MalformedRow(e.to_string()).to_string(),
                        }),
                    }
                }
            },
            InputFormat::Csv => {
                let mut reader = csv::ReaderBuilder::new()
                    .trim(csv::Trim::All)
                    .from_reader(bytes);
                match reader.headers() {
                    Ok(h) => headers = h.clone(),
                    Err(e) => rejections.push(Rejection {
                        position: 1,
                        reason: ValidationError::MalformedRow(e.to_string()).to_string(),
                    }),
                }
                if rejections.is_empty() {
                    for (index, result) in reader.records().enumerate() {
                        let fallback = index + 2;
                        match result {
                            Ok(row) => {
                                let position = row
                                    .position()
                                    .map(|p| p.line() as usize)
                                    .unwrap_or(fallback);
                                csv_rows.push((position, row));
                            },
                            Err(e) => rejections.push(Rejection {
                                position: e
                                    .position()
                                    .map(|p| p.line() as usize)
                                    .unwrap_or(fallback),
                                reason: ValidationError::MalformedRow(e.to_string()).to_string(),
                            }),
                        }
                    }
                }
            },
        }

        let units: Vec<(usize, RawUnit<'_>)> = json_units
            .iter()
            .map(|(position, value)| (*position, RawUnit::Json(value)))
            .chain(csv_rows.iter().map(|(position, row)| {
                (
                    *position,
                    RawUnit::Row {
                        headers: &headers,
                        row,
                    },
                )
            }))
            .collect();

        let normalizer = self.with_inferred_columns(&units);
        let mut records = Vec::with_capacity(units.len());

        for (position, unit) in &units {
            match normalizer.normalize(*unit) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!(artifact = %artifact_id, position, error = %e, "Rejected record");
                    rejections.push(Rejection {
                        position: *position,
                        reason: e.to_string(),
                    });
                },
            }
        }

        rejections.sort_by_key(|r| r.position);
        let records_total = records.len() + rejections.len();

        NormalizedBatch {
            batch: Batch::new(artifact_id, records, &self.key_policy),
            records_total,
            rejections,
        }
    }

    /// Copy of this normalizer with every unclassified column pinned to a kind
    ///
    /// A column is a measure when most of its non-empty values are numeric;
    /// its stray non-numeric cells are then coerced to null and annotated.
    fn with_inferred_columns(&self, units: &[(usize, RawUnit<'_>)]) -> Normalizer {
        // (numeric, non-numeric) counts over non-empty values
        let mut tally: BTreeMap<String, (usize, usize)> = BTreeMap::new();

        for (_, unit) in units {
            let Ok(fields) = unit.fields() else {
                continue;
            };
            for (name, value) in fields {
                if self.mapping.is_reserved(name) || self.mapping.is_classified(name) {
                    continue;
                }
                let (numeric, other) = tally.entry(name.to_string()).or_default();
                if value.is_null() {
                    continue;
                }
                if value.is_numeric() {
                    *numeric += 1;
                } else {
                    *other += 1;
                }
            }
        }

        let mut mapping = self.mapping.clone();
        for (name, (numeric, other)) in tally {
            if numeric > other {
                mapping.measure_fields.insert(name);
            } else {
                mapping.dimension_fields.insert(name);
            }
        }

        Normalizer {
            mapping,
            key_policy: self.key_policy.clone(),
        }
    }
}

/// Parse the timestamp forms accepted in input
///
/// RFC 3339, naive ISO-like date-times (read as UTC), bare dates, and epoch
/// seconds or milliseconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    if let Ok(epoch) = raw.parse::<f64>() {
        return epoch_to_datetime(epoch);
    }

    Err("unrecognised timestamp format".to_string())
}

fn epoch_to_datetime(value: f64) -> Result<DateTime<Utc>, String> {
    if !value.is_finite() {
        return Err("epoch value is not finite".to_string());
    }
    let seconds = if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        value / 1000.0
    } else {
        value
    };
    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e9).round() as u32).min(999_999_999);

    DateTime::from_timestamp(whole as i64, nanos).ok_or_else(|| "epoch value out of range".to_string())
}

fn parse_timestamp_value(value: RawValue<'_>) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |value: String, reason: String| ValidationError::InvalidTimestamp { value, reason };

    match value {
        RawValue::Text(s) => parse_timestamp(s).map_err(|reason| invalid(s.to_string(), reason)),
        RawValue::Json(Value::String(s)) => parse_timestamp(s).map_err(|reason| invalid(s.clone(), reason)),
        RawValue::Json(Value::Number(n)) => match n.as_f64() {
            Some(epoch) => epoch_to_datetime(epoch).map_err(|reason| invalid(n.to_string(), reason)),
            None => Err(invalid(n.to_string(), "not representable".to_string())),
        },
        RawValue::Json(other) => Err(invalid(
            other.to_string(),
            "expected a string or number".to_string(),
        )),
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn annotation(field: &str, raw: RawValue<'_>, reason: impl Into<String>) -> FieldAnnotation {
    let raw = match raw {
        RawValue::Json(Value::String(s)) => s.clone(),
        RawValue::Json(v) => v.to_string(),
        RawValue::Text(s) => s.to_string(),
    };
    FieldAnnotation {
        field: field.to_string(),
        raw,
        reason: reason.into(),
    }
}

/// Parse a measure; unparseable values become null plus an annotation
fn coerce_measure(name: &str, value: RawValue<'_>) -> (Option<f64>, Option<FieldAnnotation>) {
    if value.is_null() {
        return (None, None);
    }
    let parsed = match value {
        RawValue::Json(Value::Number(n)) => n.as_f64().filter(|n| n.is_finite()),
        RawValue::Json(Value::String(s)) => parse_number(s),
        RawValue::Text(s) => parse_number(s),
        RawValue::Json(_) => None,
    };
    match parsed {
        Some(number) => (Some(number), None),
        None => (None, Some(annotation(name, value, "not a number"))),
    }
}

fn parse_vector(value: RawValue<'_>) -> Result<Vec<f32>, String> {
    let items: Vec<f64> = match value {
        RawValue::Json(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| format!("non-numeric element {}", v)))
            .collect::<Result<_, _>>()?,
        RawValue::Json(Value::String(s)) => parse_vector_text(s)?,
        RawValue::Text(s) => parse_vector_text(s)?,
        RawValue::Json(other) => return Err(format!("expected an array, found {}", other)),
    };

    if items.is_empty() {
        return Err("empty vector".to_string());
    }
    if items.iter().any(|v| !v.is_finite()) {
        return Err("vector contains non-finite values".to_string());
    }
    Ok(items.into_iter().map(|v| v as f32).collect())
}

fn parse_vector_text(raw: &str) -> Result<Vec<f64>, String> {
    serde_json::from_str(raw.trim()).map_err(|e| format!("not a numeric array: {}", e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::default()
    }

    #[test]
    fn test_json_object_to_canonical() {
        let value = json!({
            "timestamp": "2024-01-15T10:00:00Z",
            "device_id": "device_001",
            "temperature": 23.5,
            "humidity": "48.2",
            "location": "zone_a",
            "embedding": [0.1, 0.2, 0.3]
        });

        let record = normalizer().normalize(RawUnit::Json(&value)).unwrap();

        assert_eq!(record.timestamp(), Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap());
        assert_eq!(record.source_identifier(), "device_001");
        assert_eq!(record.measure("temperature"), Some(23.5));
        assert_eq!(record.measure("humidity"), Some(48.2));
        assert_eq!(record.dimension("location"), Some("zone_a"));
        assert_eq!(record.vector(), Some(&[0.1f32, 0.2, 0.3][..]));
        assert!(record.annotations().is_empty());
    }

    #[test]
    fn test_csv_row_maps_to_same_fields() {
        let headers = StringRecord::from(vec!["timestamp", "device_id", "temperature", "location"]);
        let row = StringRecord::from(vec!["2024-01-15T10:00:00Z", "device_001", "23.5", "zone_a"]);
        let value = json!({
            "timestamp": "2024-01-15T10:00:00Z",
            "device_id": "device_001",
            "temperature": 23.5,
            "location": "zone_a"
        });

        let from_csv = normalizer()
            .normalize(RawUnit::Row {
                headers: &headers,
                row: &row,
            })
            .unwrap();
        let from_json = normalizer().normalize(RawUnit::Json(&value)).unwrap();

        assert_eq!(from_csv, from_json);
    }

    #[test]
    fn test_missing_timestamp_is_rejected() {
        let value = json!({ "device_id": "device_001", "temperature": 1.0 });
        let err = normalizer().normalize(RawUnit::Json(&value)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingTimestamp { .. }));

        let value = json!({ "timestamp": null });
        let err = normalizer().normalize(RawUnit::Json(&value)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingTimestamp { .. }));
    }

    #[test]
    fn test_invalid_timestamp_is_rejected() {
        for bad in [json!("yesterday"), json!(true), json!("2024-13-45T99:00:00Z")] {
            let value = json!({ "timestamp": bad, "device_id": "d" });
            let err = normalizer().normalize(RawUnit::Json(&value)).unwrap_err();
            assert!(
                matches!(err, ValidationError::InvalidTimestamp { .. }),
                "unexpected {:?}",
                err
            );
        }
    }

    #[test]
    fn test_unparseable_measure_is_null_and_annotated() {
        let mut mapping = FieldMapping::default();
        mapping.measure_fields.insert("pressure".to_string());
        let normalizer = Normalizer::new(mapping, KeyPolicy::default());

        let value = json!({
            "timestamp": "2024-01-15T10:00:00Z",
            "pressure": "n/a"
        });
        let record = normalizer.normalize(RawUnit::Json(&value)).unwrap();

        assert!(record.measures().contains_key("pressure"));
        assert_eq!(record.measure("pressure"), None);
        assert_eq!(record.annotations().len(), 1);
        assert_eq!(record.annotations()[0].field, "pressure");
        assert_eq!(record.annotations()[0].raw, "n/a");
    }

    #[test]
    fn test_long_format_metric_pair() {
        let value = json!({
            "timestamp": "2024-01-15T10:00:00Z",
            "device_id": "device_002",
            "metric_name": "humidity",
            "metric_value": 51.25,
            "zone": "testing"
        });
        let record = normalizer().normalize(RawUnit::Json(&value)).unwrap();

        assert_eq!(record.measure("humidity"), Some(51.25));
        assert_eq!(record.dimension("metric_name"), Some("humidity"));
        assert_eq!(record.dimension("zone"), Some("testing"));
        assert!(!record.measures().contains_key("metric_value"));
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        for raw in [
            "2024-01-15T10:00:00Z",
            "2024-01-15T12:00:00+02:00",
            "2024-01-15 10:00:00",
            "2024-01-15T10:00:00",
            "2024-01-15T10:00:00.000",
            "1705312800",
            "1705312800000",
        ] {
            assert_eq!(parse_timestamp(raw).unwrap(), expected, "input {}", raw);
        }
        assert_eq!(
            parse_timestamp("2024-01-15").unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("not a time").is_err());
    }

    #[test]
    fn test_vector_text_and_bad_vector() {
        let headers = StringRecord::from(vec!["timestamp", "embedding"]);
        let row = StringRecord::from(vec!["2024-01-15T10:00:00Z", "[1.0, 2.0]"]);
        let record = normalizer()
            .normalize(RawUnit::Row {
                headers: &headers,
                row: &row,
            })
            .unwrap();
        assert_eq!(record.vector(), Some(&[1.0f32, 2.0][..]));

        let value = json!({ "timestamp": "2024-01-15T10:00:00Z", "embedding": ["a"] });
        let record = normalizer().normalize(RawUnit::Json(&value)).unwrap();
        assert!(record.vector().is_none());
        assert_eq!(record.annotations()[0].field, "embedding");
    }

    #[test]
    fn test_artifact_with_two_bad_timestamps() {
        let mut items = Vec::new();
        for i in 0..10 {
            let ts = if i == 3 || i == 7 {
                "garbage".to_string()
            } else {
                format!("2024-01-15T10:{:02}:00Z", i)
            };
            items.push(json!({ "timestamp": ts, "device_id": "device_001", "temperature": i }));
        }
        let bytes = serde_json::to_vec(&items).unwrap();

        let normalized = normalizer().normalize_artifact("incoming/a.json", &bytes, InputFormat::Json);

        assert_eq!(normalized.batch.len(), 8);
        assert_eq!(normalized.rejected(), 2);
        assert_eq!(normalized.records_total, 10);
        assert_eq!(normalized.rejections[0].position, 4);
        assert_eq!(normalized.rejections[1].position, 8);
    }

    #[test]
    fn test_csv_columns_inferred_across_rows() {
        let csv = "timestamp,device_id,metric_value,reading,site\n\
                   2024-01-15T10:00:00Z,device_001,1.5,,001\n\
                   2024-01-15T10:01:00Z,device_001,2.5,7.25,north\n";

        let normalized = normalizer().normalize_artifact("incoming/a.csv", csv.as_bytes(), InputFormat::Csv);
        assert_eq!(normalized.batch.len(), 2);

        let first = &normalized.batch.records()[0];
        // Empty cell of a numeric column is a null measure, not a dimension
        assert!(first.measures().contains_key("reading"));
        assert_eq!(first.measure("reading"), None);
        assert!(first.annotations().is_empty());
        // No numeric majority: dimension everywhere
        assert_eq!(first.dimension("site"), Some("001"));
        assert_eq!(normalized.batch.records()[1].measure("reading"), Some(7.25));
    }

    #[test]
    fn test_csv_stray_text_in_numeric_column_is_null_and_annotated() {
        let csv = "timestamp,device_id,temperature,location\n\
                   2024-01-15T10:00:00Z,device_001,23.5,zone_a\n\
                   2024-01-15T10:01:00Z,device_001,n/a,zone_a\n\
                   2024-01-15T10:02:00Z,device_001,24.0,zone_a\n";

        let normalized = normalizer().normalize_artifact("incoming/a.csv", csv.as_bytes(), InputFormat::Csv);
        assert_eq!(normalized.batch.len(), 3);
        assert_eq!(normalized.rejected(), 0);

        let records = normalized.batch.records();
        assert_eq!(records[0].measure("temperature"), Some(23.5));
        assert!(records[0].annotations().is_empty());

        assert!(records[1].measures().contains_key("temperature"));
        assert_eq!(records[1].measure("temperature"), None);
        assert_eq!(records[1].dimension("temperature"), None);
        assert_eq!(records[1].annotations().len(), 1);
        assert_eq!(records[1].annotations()[0].field, "temperature");
        assert_eq!(records[1].annotations()[0].raw, "n/a");

        assert_eq!(records[2].measure("temperature"), Some(24.0));
        assert_eq!(records[2].dimension("location"), Some("zone_a"));
    }

    #[test]
    fn test_csv_ragged_row_is_rejected() {
        let csv = "timestamp,device_id\n2024-01-15T10:00:00Z,device_001\n2024-01-15T10:01:00Z\n";
        let normalized = normalizer().normalize_artifact("incoming/a.csv", csv.as_bytes(), InputFormat::Csv);

        assert_eq!(normalized.batch.len(), 1);
        assert_eq!(normalized.rejected(), 1);
        assert_eq!(normalized.records_total, 2);
    }

    #[test]
    fn test_json_lines_with_bad_line() {
        let body = "{\"timestamp\":\"2024-01-15T10:00:00Z\"}\n\n{not json}\n{\"timestamp\":1705312800}\n";
        let normalized = normalizer().normalize_artifact("x.ndjson", body.as_bytes(), InputFormat::JsonLines);

        assert_eq!(normalized.batch.len(), 2);
        assert_eq!(normalized.rejections, vec![Rejection {
            position: 3,
            reason: normalized.rejections[0].reason.clone(),
        }]);
    }

    #[test]
    fn test_malformed_json_document_rejects_everything() {
        let normalized = normalizer().normalize_artifact("x.json", b"[{\"timestamp\":", InputFormat::Json);
        assert!(normalized.batch.is_empty());
        assert_eq!(normalized.rejected(), 1);
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(InputFormat::from_location("in/A.CSV"), Some(InputFormat::Csv));
        assert_eq!(InputFormat::from_location("in/a.ndjson"), Some(InputFormat::JsonLines));
        assert_eq!(InputFormat::from_location("in/a"), None);
        assert_eq!(InputFormat::sniff(b"  [{}]"), InputFormat::Json);
        assert_eq!(InputFormat::sniff(b"{\"a\":1}\n{\"a\":2}\n"), InputFormat::JsonLines);
        assert_eq!(InputFormat::sniff(b"{\n  \"a\": 1\n}"), InputFormat::Json);
        assert_eq!(InputFormat::sniff(b"timestamp,a\n"), InputFormat::Csv);
    }
}
