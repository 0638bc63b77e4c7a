//! Flat row shapes for the ClickHouse `traces`, `metrics` and `logs` tables
//!
//! Every row carries `timestamp` (`YYYY-MM-DD HH:MM:SS`, UTC) and
//! `timestamp_ns`, both computed from one nanosecond value.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::events::{truncate, Attributes, LogRecord, MetricRecord, MetricType, MAX_STRING_LEN};
use crate::otlp::{
    flatten_key_values, unix_nanos, Resource, Span, STATUS_CODE_ERROR, STATUS_CODE_OK,
};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// String attribute map as stored in the `attributes` column
pub type FlatAttributes = BTreeMap<String, String>;

/// Both timestamp columns for one instant
pub fn timestamp_columns(nanos: u64) -> (String, u64) {
    let secs = i64::try_from(nanos / 1_000_000_000).unwrap_or(i64::MAX);
    // Always < 1e9
    let subsec = (nanos % 1_000_000_000) as u32;
    let at = DateTime::<Utc>::from_timestamp(secs, subsec).unwrap_or_default();
    (at.format(TIMESTAMP_FORMAT).to_string(), nanos)
}

pub fn flatten_attributes(attributes: &Attributes) -> FlatAttributes {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), truncate(&v.to_string(), MAX_STRING_LEN)))
        .collect()
}

/// Service and host columns shared by all three tables
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceColumns {
    pub service_name: String,
    pub project_name: String,
    pub project_version: String,
    pub environment: String,
    pub hostname: String,
    pub os_type: String,
    pub os_version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub cloud_provider: String,
    pub cloud_region: String,
}

impl ResourceColumns {
    pub fn from_attributes(resource: &FlatAttributes) -> Self {
        let get = |key: &str| resource.get(key).cloned().unwrap_or_default();
        let service_name = resource
            .get("service.name")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            project_name: resource
                .get("project.name")
                .cloned()
                .unwrap_or_else(|| get("service.name")),
            project_version: resource
                .get("project.version")
                .cloned()
                .unwrap_or_else(|| get("service.version")),
            environment: resource
                .get("deployment.environment")
                .cloned()
                .unwrap_or_else(|| "production".to_string()),
            hostname: get("host.name"),
            os_type: get("os.type"),
            os_version: get("os.version"),
            runtime_name: get("process.runtime.name"),
            runtime_version: get("process.runtime.version"),
            cloud_provider: get("cloud.provider"),
            cloud_region: get("cloud.region"),
            service_name,
        }
    }
}

fn identity_column(key: &str, attributes: &FlatAttributes, resource: &FlatAttributes) -> String {
    attributes
        .get(key)
        .or_else(|| resource.get(key))
        .cloned()
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRow {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub timestamp: String,
    pub timestamp_ns: u64,
    pub duration_ms: u64,
    pub span_name: String,
    pub span_kind: String,
    pub status_code: String,
    pub status_message: String,
    #[serde(flatten)]
    pub resource: ResourceColumns,
    pub attributes: FlatAttributes,
    pub user_id: String,
    pub session_id: String,
}

/// Map one OTLP span, with the resource it was reported under, to a row
pub fn transform_to_row(resource: &Resource, span: &Span) -> TraceRow {
    let resource_attrs = flatten_key_values(&resource.attributes);
    let attributes = flatten_key_values(&span.attributes);

    let start = match span.start_time_unix_nano {
        0 => unix_nanos(Utc::now()),
        ns => ns,
    };
    let (timestamp, timestamp_ns) = timestamp_columns(start);

    let duration_ms = if span.end_time_unix_nano > span.start_time_unix_nano {
        (span.end_time_unix_nano - span.start_time_unix_nano) / 1_000_000
    } else {
        0
    };

    let status_code = match span.status.code {
        STATUS_CODE_OK => "OK".to_string(),
        _ if !span.status.message.is_empty() => span.status.message.clone(),
        STATUS_CODE_ERROR => "ERROR".to_string(),
        _ => "OK".to_string(),
    };

    let span_kind = span
        .kind
        .strip_prefix("SPAN_KIND_")
        .unwrap_or(&span.kind)
        .to_string();

    TraceRow {
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        parent_span_id: span.parent_span_id.clone(),
        timestamp,
        timestamp_ns,
        duration_ms,
        span_name: if span.name.is_empty() {
            "unknown".to_string()
        } else {
            span.name.clone()
        },
        span_kind: if span_kind.is_empty() {
            "INTERNAL".to_string()
        } else {
            span_kind
        },
        status_code,
        status_message: span.status.message.clone(),
        resource: ResourceColumns::from_attributes(&resource_attrs),
        user_id: identity_column("user.id", &attributes, &resource_attrs),
        session_id: identity_column("session.id", &attributes, &resource_attrs),
        attributes,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub id: String,
    pub timestamp: String,
    pub timestamp_ns: u64,
    pub metric_name: String,
    pub metric_type: String,
    pub unit: String,
    pub value_int: Option<i64>,
    pub value_double: f64,
    pub is_monotonic: bool,
    pub aggregation_temporality: String,
    pub histogram_count: Option<u64>,
    pub histogram_sum: Option<f64>,
    pub histogram_min: Option<f64>,
    pub histogram_max: Option<f64>,
    pub histogram_bucket_counts: Vec<u64>,
    pub histogram_explicit_bounds: Vec<f64>,
    #[serde(flatten)]
    pub resource: ResourceColumns,
    pub attributes: FlatAttributes,
    pub user_id: String,
    pub session_id: String,
}

/// Schema enum value for a metric type; counters are stored as sums
pub fn normalize_metric_type(metric_type: &MetricType) -> &'static str {
    match metric_type {
        MetricType::Gauge => "GAUGE",
        MetricType::Counter | MetricType::Sum => "SUM",
        MetricType::Histogram => "HISTOGRAM",
        MetricType::Other(name) => {
            warn!("unknown metric type '{}', storing as GAUGE", name);
            "GAUGE"
        }
    }
}

fn integral(value: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63
    if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

pub fn build_metric_row(record: &MetricRecord) -> Result<MetricRow, DeliveryError> {
    let (name, value) = record.validate()?;
    let (timestamp, timestamp_ns) =
        timestamp_columns(unix_nanos(record.timestamp.unwrap_or_else(Utc::now)));

    let metric_type = normalize_metric_type(&record.metric_type);
    let is_histogram = metric_type == "HISTOGRAM";
    let is_monotonic = metric_type == "SUM";
    let aggregation_temporality = if metric_type == "GAUGE" {
        "UNSPECIFIED"
    } else {
        "CUMULATIVE"
    };

    let attributes = flatten_attributes(&record.attributes);
    let resource_attrs = flatten_attributes(&record.resource_attributes);

    Ok(MetricRow {
        id: Uuid::new_v4().to_string(),
        timestamp,
        timestamp_ns,
        metric_name: name.to_string(),
        metric_type: metric_type.to_string(),
        unit: record.unit.clone(),
        value_int: integral(value),
        value_double: value,
        is_monotonic,
        aggregation_temporality: aggregation_temporality.to_string(),
        histogram_count: is_histogram.then_some(1),
        histogram_sum: is_histogram.then_some(value),
        histogram_min: is_histogram.then_some(value),
        histogram_max: is_histogram.then_some(value),
        histogram_bucket_counts: if is_histogram { vec![1] } else { Vec::new() },
        histogram_explicit_bounds: Vec::new(),
        resource: ResourceColumns::from_attributes(&resource_attrs),
        user_id: identity_column("user.id", &attributes, &resource_attrs),
        session_id: identity_column("session.id", &attributes, &resource_attrs),
        attributes,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRow {
    pub id: String,
    pub timestamp: String,
    pub timestamp_ns: u64,
    pub severity_text: String,
    pub severity_number: i32,
    pub body: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(flatten)]
    pub resource: ResourceColumns,
    pub attributes: FlatAttributes,
    pub user_id: String,
    pub session_id: String,
    pub exception_type: String,
    pub exception_message: String,
    pub exception_stacktrace: String,
    pub is_exception: bool,
}

pub fn build_log_row(record: &LogRecord) -> LogRow {
    let (timestamp, timestamp_ns) =
        timestamp_columns(unix_nanos(record.timestamp.unwrap_or_else(Utc::now)));
    let attributes = flatten_attributes(&record.attributes);
    let resource_attrs = flatten_attributes(&record.resource_attributes);
    let exception = record.exception.clone().unwrap_or_default();

    LogRow {
        id: Uuid::new_v4().to_string(),
        timestamp,
        timestamp_ns,
        severity_text: record.severity.as_str().to_string(),
        severity_number: record.severity.severity_number(),
        body: record.message.clone(),
        trace_id: record.effective_trace_id().unwrap_or_default().to_string(),
        span_id: record.effective_span_id().unwrap_or_default().to_string(),
        resource: ResourceColumns::from_attributes(&resource_attrs),
        user_id: identity_column("user.id", &attributes, &resource_attrs),
        session_id: identity_column("session.id", &attributes, &resource_attrs),
        attributes,
        is_exception: record.exception.is_some(),
        exception_type: exception.exception_type,
        exception_message: truncate(&exception.message, MAX_STRING_LEN),
        exception_stacktrace: exception.stacktrace,
    }
}
