//! OTLP/JSON wire model
//!
//! Only the subset of the OpenTelemetry protocol this crate emits and
//! consumes: traces, metrics (gauge, sum, histogram) and logs, encoded the
//! way OTLP/HTTP collectors expect JSON (camelCase keys, externally tagged
//! attribute values).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::events::{
    truncate, AttributeValue, Attributes, LogRecord, MetricRecord, MetricType, MAX_STRING_LEN,
};

pub const SPAN_KIND_INTERNAL: &str = "SPAN_KIND_INTERNAL";
pub const STATUS_CODE_UNSET: i32 = 0;
pub const STATUS_CODE_OK: i32 = 1;
pub const STATUS_CODE_ERROR: i32 = 2;
/// `AGGREGATION_TEMPORALITY_CUMULATIVE`
pub const TEMPORALITY_CUMULATIVE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    StringValue(String),
    BoolValue(bool),
    #[serde(deserialize_with = "int_from_number_or_string")]
    IntValue(i64),
    DoubleValue(f64),
}

/// OTLP/JSON allows 64-bit integers to arrive as decimal strings
fn int_from_number_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl AnyValue {
    /// Flat string form used by row-oriented storage
    pub fn to_flat_string(&self) -> String {
        match self {
            AnyValue::StringValue(s) => s.clone(),
            AnyValue::BoolValue(b) => b.to_string(),
            AnyValue::IntValue(i) => i.to_string(),
            AnyValue::DoubleValue(d) => d.to_string(),
        }
    }
}

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => AnyValue::StringValue(truncate(s, MAX_STRING_LEN)),
            AttributeValue::Bool(b) => AnyValue::BoolValue(*b),
            AttributeValue::Int(i) => AnyValue::IntValue(*i),
            AttributeValue::Double(d) => AnyValue::DoubleValue(*d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            key: key.into(),
            value: AnyValue::from(&value.into()),
        }
    }
}

/// Encode an attribute map as an OTLP key/value list
pub fn to_key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: AnyValue::from(value),
        })
        .collect()
}

/// Flatten an OTLP key/value list into a string map. Later duplicates win.
pub fn flatten_key_values(attributes: &[KeyValue]) -> BTreeMap<String, String> {
    attributes
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.to_flat_string()))
        .collect()
}

/// Nanoseconds since the Unix epoch, clamped to zero for pre-epoch instants
pub fn unix_nanos(at: DateTime<Utc>) -> u64 {
    at.timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationScope {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracesData {
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSpans {
    pub resource: Resource,
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSpans {
    pub scope: InstrumentationScope,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_span_id: String,
    pub name: String,
    pub kind: String,
    #[serde(with = "u64_number_or_string")]
    pub start_time_unix_nano: u64,
    #[serde(with = "u64_number_or_string")]
    pub end_time_unix_nano: u64,
    pub attributes: Vec<KeyValue>,
    pub status: Status,
}

impl Default for Span {
    fn default() -> Self {
        Self {
            trace_id: String::new(),
            span_id: String::new(),
            parent_span_id: String::new(),
            name: String::new(),
            kind: SPAN_KIND_INTERNAL.to_string(),
            start_time_unix_nano: 0,
            end_time_unix_nano: 0,
            attributes: Vec::new(),
            status: Status::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: STATUS_CODE_OK,
            message: String::new(),
        }
    }
}

/// Timestamps are written as JSON numbers but accepted as strings too
mod u64_number_or_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => Ok(v),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A single span described with native types, for callers that don't
/// assemble OTLP envelopes themselves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanRecord {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub resource_attributes: Attributes,
    pub status: Status,
    pub scope: InstrumentationScope,
}

impl SpanRecord {
    fn into_otlp(self) -> (Resource, InstrumentationScope, Span) {
        let start = self.start.unwrap_or_else(Utc::now);
        let end = self.end.unwrap_or(start);
        let span = Span {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id.unwrap_or_default(),
            name: self.name,
            start_time_unix_nano: unix_nanos(start),
            end_time_unix_nano: unix_nanos(end),
            attributes: to_key_values(&self.attributes),
            status: self.status,
            ..Span::default()
        };
        let resource = Resource {
            attributes: to_key_values(&self.resource_attributes),
        };
        (resource, self.scope, span)
    }
}

/// What `send_trace` accepts: a ready OTLP envelope or a native span
#[derive(Debug, Clone, PartialEq)]
pub enum TracePayload {
    Otlp(TracesData),
    Span(SpanRecord),
}

impl TracePayload {
    pub fn into_traces_data(self) -> TracesData {
        match self {
            TracePayload::Otlp(data) => data,
            TracePayload::Span(record) => {
                let (resource, scope, span) = record.into_otlp();
                TracesData {
                    resource_spans: vec![ResourceSpans {
                        resource,
                        scope_spans: vec![ScopeSpans {
                            scope,
                            spans: vec![span],
                        }],
                    }],
                }
            }
        }
    }

    /// Number of spans carried
    pub fn span_count(&self) -> usize {
        match self {
            TracePayload::Otlp(data) => data.spans().count(),
            TracePayload::Span(_) => 1,
        }
    }
}

impl From<TracesData> for TracePayload {
    fn from(data: TracesData) -> Self {
        TracePayload::Otlp(data)
    }
}

impl From<SpanRecord> for TracePayload {
    fn from(record: SpanRecord) -> Self {
        TracePayload::Span(record)
    }
}

impl TracesData {
    /// Every span paired with the resource it was reported under
    pub fn spans(&self) -> impl Iterator<Item = (&Resource, &Span)> {
        self.resource_spans.iter().flat_map(|rs| {
            rs.scope_spans
                .iter()
                .flat_map(move |ss| ss.spans.iter().map(move |span| (&rs.resource, span)))
        })
    }

    /// Fold several envelopes into one, keeping each resource group intact
    pub fn merge(parts: impl IntoIterator<Item = TracesData>) -> TracesData {
        TracesData {
            resource_spans: parts.into_iter().flat_map(|p| p.resource_spans).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsData {
    pub resource_metrics: Vec<ResourceMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceMetrics {
    pub resource: Resource,
    pub scope_metrics: Vec<ScopeMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeMetrics {
    pub scope: InstrumentationScope,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(flatten)]
    pub data: MetricData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricData {
    Gauge(Gauge),
    Sum(Sum),
    Histogram(Histogram),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gauge {
    pub data_points: Vec<NumberDataPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sum {
    pub data_points: Vec<NumberDataPoint>,
    pub aggregation_temporality: i32,
    pub is_monotonic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Histogram {
    pub data_points: Vec<HistogramDataPoint>,
    pub aggregation_temporality: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberDataPoint {
    pub attributes: Vec<KeyValue>,
    #[serde(with = "u64_number_or_string")]
    pub time_unix_nano: u64,
    pub as_double: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramDataPoint {
    pub attributes: Vec<KeyValue>,
    #[serde(with = "u64_number_or_string")]
    pub time_unix_nano: u64,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub bucket_counts: Vec<u64>,
    pub explicit_bounds: Vec<f64>,
}

impl MetricsData {
    /// Wrap one validated metric observation in an envelope.
    ///
    /// Callers validate first; an absent name or value is encoded as empty/zero.
    pub fn from_record(record: &MetricRecord, scope: InstrumentationScope) -> Self {
        let name = record.metric_name.clone().unwrap_or_default();
        let value = record.value.unwrap_or_default();
        let time_unix_nano = unix_nanos(record.timestamp.unwrap_or_else(Utc::now));
        let attributes = to_key_values(&record.attributes);

        let number = || NumberDataPoint {
            attributes: attributes.clone(),
            time_unix_nano,
            as_double: value,
        };

        let data = match record.metric_type {
            MetricType::Counter | MetricType::Sum => MetricData::Sum(Sum {
                data_points: vec![number()],
                aggregation_temporality: TEMPORALITY_CUMULATIVE,
                is_monotonic: true,
            }),
            MetricType::Histogram => MetricData::Histogram(Histogram {
                data_points: vec![HistogramDataPoint {
                    attributes: attributes.clone(),
                    time_unix_nano,
                    count: 1,
                    sum: value,
                    min: value,
                    max: value,
                    bucket_counts: vec![1],
                    explicit_bounds: Vec::new(),
                }],
                aggregation_temporality: TEMPORALITY_CUMULATIVE,
            }),
            MetricType::Gauge | MetricType::Other(_) => MetricData::Gauge(Gauge {
                data_points: vec![number()],
            }),
        };

        MetricsData {
            resource_metrics: vec![ResourceMetrics {
                resource: Resource {
                    attributes: to_key_values(&record.resource_attributes),
                },
                scope_metrics: vec![ScopeMetrics {
                    scope,
                    metrics: vec![Metric {
                        name,
                        unit: record.unit.clone(),
                        data,
                    }],
                }],
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogsData {
    pub resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLogs {
    pub resource: Resource,
    pub scope_logs: Vec<ScopeLogs>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeLogs {
    pub scope: InstrumentationScope,
    pub log_records: Vec<OtlpLogRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpLogRecord {
    #[serde(with = "u64_number_or_string")]
    pub time_unix_nano: u64,
    #[serde(with = "u64_number_or_string")]
    pub observed_time_unix_nano: u64,
    pub severity_number: i32,
    pub severity_text: String,
    pub body: AnyValue,
    pub attributes: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub span_id: String,
}

impl LogsData {
    /// Wrap one log record in an envelope. Exception details become
    /// `exception.*` attributes.
    pub fn from_record(record: &LogRecord, scope: InstrumentationScope) -> Self {
        let observed = Utc::now();
        let time_unix_nano = unix_nanos(record.timestamp.unwrap_or(observed));

        let mut attributes = record.attributes.clone();
        if let Some(exception) = &record.exception {
            attributes.insert("exception.type".into(), exception.exception_type.clone().into());
            attributes.insert("exception.message".into(), exception.message.clone().into());
            if !exception.stacktrace.is_empty() {
                attributes.insert(
                    "exception.stacktrace".into(),
                    exception.stacktrace.clone().into(),
                );
            }
        }

        let log = OtlpLogRecord {
            time_unix_nano,
            observed_time_unix_nano: unix_nanos(observed),
            severity_number: record.severity.severity_number(),
            severity_text: record.severity.as_str().to_string(),
            body: AnyValue::StringValue(record.message.clone()),
            attributes: to_key_values(&attributes),
            trace_id: record.effective_trace_id().unwrap_or_default().to_string(),
            span_id: record.effective_span_id().unwrap_or_default().to_string(),
        };

        LogsData {
            resource_logs: vec![ResourceLogs {
                resource: Resource {
                    attributes: to_key_values(&record.resource_attributes),
                },
                scope_logs: vec![ScopeLogs {
                    scope,
                    log_records: vec![log],
                }],
            }],
        }
    }
}
