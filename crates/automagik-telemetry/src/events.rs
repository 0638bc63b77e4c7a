//! Telemetry event data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::DeliveryError;

/// Longest string value (attribute or error message) we put on the wire
pub const MAX_STRING_LEN: usize = 500;

/// Attribute map attached to events, metrics and logs
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Double(d) => write!(f, "{}", d),
            AttributeValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(value.into())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Int(value.into())
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

/// Build an attribute map from key/value pairs
///
/// ```
/// use automagik_telemetry::events::attributes;
///
/// let attrs = attributes([("feature_name", "list_contacts")]);
/// assert_eq!(attrs["feature_name"].as_str(), Some("list_contacts"));
/// ```
pub fn attributes<I, K, V>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<AttributeValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Truncate a string to at most `max` characters (not bytes)
pub fn truncate(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// Kind of metric being recorded.
///
/// `Other` keeps whatever name an untyped caller supplied; storage backends
/// decide how to map it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetricType {
    #[default]
    Gauge,
    Counter,
    Sum,
    Histogram,
    Other(String),
}

impl MetricType {
    pub fn as_str(&self) -> &str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::Sum => "sum",
            MetricType::Histogram => "histogram",
            MetricType::Other(name) => name,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MetricType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "gauge" => MetricType::Gauge,
            "counter" => MetricType::Counter,
            "sum" => MetricType::Sum,
            "histogram" => MetricType::Histogram,
            _ => MetricType::Other(s.to_string()),
        }
    }
}

impl From<String> for MetricType {
    fn from(s: String) -> Self {
        MetricType::from(s.as_str())
    }
}

impl From<MetricType> for String {
    fn from(t: MetricType) -> Self {
        t.as_str().to_string()
    }
}

/// Log severity, numbered the way OTLP numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogSeverity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Trace => "TRACE",
            LogSeverity::Debug => "DEBUG",
            LogSeverity::Info => "INFO",
            LogSeverity::Warn => "WARN",
            LogSeverity::Error => "ERROR",
            LogSeverity::Fatal => "FATAL",
        }
    }

    /// OTLP `SeverityNumber` of the first slot in this severity's range
    pub fn severity_number(&self) -> i32 {
        match self {
            LogSeverity::Trace => 1,
            LogSeverity::Debug => 5,
            LogSeverity::Info => 9,
            LogSeverity::Warn => 13,
            LogSeverity::Error => 17,
            LogSeverity::Fatal => 21,
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for LogSeverity {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => LogSeverity::Trace,
            "DEBUG" => LogSeverity::Debug,
            "INFO" | "INFORMATION" => LogSeverity::Info,
            "WARN" | "WARNING" => LogSeverity::Warn,
            "ERROR" | "ERR" => LogSeverity::Error,
            "FATAL" | "CRITICAL" => LogSeverity::Fatal,
            _ => LogSeverity::Info, // Default fallback
        }
    }
}

impl From<String> for LogSeverity {
    fn from(s: String) -> Self {
        LogSeverity::from(s.as_str())
    }
}

impl From<LogSeverity> for String {
    fn from(s: LogSeverity) -> Self {
        s.as_str().to_string()
    }
}

/// A metric observation handed to a backend.
///
/// Every field is optional so that both structured payloads (deserialized
/// from a JSON object) and legacy positional call sites map onto the same
/// type; [`MetricRecord::validate`] enforces the name/value requirement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricRecord {
    #[serde(alias = "name")]
    pub metric_name: Option<String>,
    pub value: Option<f64>,
    #[serde(alias = "type")]
    pub metric_type: MetricType,
    pub unit: String,
    pub attributes: Attributes,
    pub resource_attributes: Attributes,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            metric_name: Some(name.into()),
            value: Some(value),
            ..Self::default()
        }
    }

    /// Positional form used by older call sites, where either part may be missing
    pub fn from_fields(name: Option<&str>, value: Option<f64>) -> Self {
        Self {
            metric_name: name.map(str::to_string),
            value,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, metric_type: impl Into<MetricType>) -> Self {
        self.metric_type = metric_type.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_resource_attributes(mut self, attributes: Attributes) -> Self {
        self.resource_attributes.extend(attributes);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Return the name and value, or a validation error when either is absent
    pub fn validate(&self) -> Result<(&str, f64), DeliveryError> {
        let name = match self.metric_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(DeliveryError::validation("metric", "metric name is required")),
        };
        match self.value {
            Some(value) if value.is_finite() => Ok((name, value)),
            Some(value) => Err(DeliveryError::validation(
                "metric",
                format!("metric value must be finite (got {value})"),
            )),
            None => Err(DeliveryError::validation("metric", "metric value is required")),
        }
    }
}

/// Exception details carried by a log record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionInfo {
    #[serde(alias = "type")]
    pub exception_type: String,
    pub message: String,
    pub stacktrace: String,
}

/// A log line handed to a backend. The message may be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRecord {
    #[serde(alias = "body")]
    pub message: String,
    #[serde(alias = "level")]
    pub severity: LogSeverity,
    pub attributes: Attributes,
    pub resource_attributes: Attributes,
    pub timestamp: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub exception: Option<ExceptionInfo>,
}

impl LogRecord {
    pub fn new(message: impl Into<String>, severity: LogSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
            ..Self::default()
        }
    }

    /// Positional form used by older call sites: just a message at INFO
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(message, LogSeverity::Info)
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_resource_attributes(mut self, attributes: Attributes) -> Self {
        self.resource_attributes.extend(attributes);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_trace_context(
        mut self,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
    ) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    /// Trace id passed explicitly, or carried in the `trace_id` attribute
    pub fn effective_trace_id(&self) -> Option<&str> {
        self.trace_id
            .as_deref()
            .or_else(|| self.attributes.get("trace_id").and_then(AttributeValue::as_str))
    }

    /// Span id passed explicitly, or carried in the `span_id` attribute
    pub fn effective_span_id(&self) -> Option<&str> {
        self.span_id
            .as_deref()
            .or_else(|| self.attributes.get("span_id").and_then(AttributeValue::as_str))
    }
}

/// Non-identifying facts about the host, attached to every payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub is_docker: bool,
}

impl SystemInfo {
    pub fn detect() -> Self {
        Self {
            os: get_os_string(),
            os_version: sysinfo::System::os_version().unwrap_or_else(|| "unknown".to_string()),
            arch: get_arch_string(),
            is_docker: std::path::Path::new("/.dockerenv").exists(),
        }
    }
}

/// Get OS string
fn get_os_string() -> String {
    if cfg!(target_os = "linux") {
        "linux".to_string()
    } else if cfg!(target_os = "macos") {
        "macos".to_string()
    } else if cfg!(target_os = "windows") {
        "windows".to_string()
    } else {
        "unknown".to_string()
    }
}

/// Get architecture string
fn get_arch_string() -> String {
    if cfg!(target_arch = "x86_64") {
        "x64".to_string()
    } else if cfg!(target_arch = "aarch64") {
        "arm64".to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metric_type_from_str() {
        assert_eq!(MetricType::from("GAUGE"), MetricType::Gauge);
        assert_eq!(MetricType::from("counter"), MetricType::Counter);
        assert_eq!(MetricType::from("Histogram"), MetricType::Histogram);
        assert_eq!(
            MetricType::from("summary"),
            MetricType::Other("summary".to_string())
        );
    }

    #[test]
    fn test_log_severity_from_str() {
        assert_eq!(LogSeverity::from("INFO"), LogSeverity::Info);
        assert_eq!(LogSeverity::from("warning"), LogSeverity::Warn);
        assert_eq!(LogSeverity::from("critical"), LogSeverity::Fatal);
        assert_eq!(LogSeverity::from("unknown"), LogSeverity::Info);
        assert_eq!(LogSeverity::Error.severity_number(), 17);
    }

    #[test]
    fn test_metric_record_from_json_object() {
        let record: MetricRecord = serde_json::from_value(json!({
            "metric_name": "test_metric",
            "value": 42.5,
            "metric_type": "gauge",
            "unit": "ms",
            "attributes": {"key": "value", "count": 3, "ok": true},
        }))
        .unwrap();

        assert_eq!(record.metric_name.as_deref(), Some("test_metric"));
        assert_eq!(record.metric_type, MetricType::Gauge);
        assert_eq!(record.attributes["count"], AttributeValue::Int(3));
        assert_eq!(record.attributes["ok"], AttributeValue::Bool(true));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_metric_record_validation() {
        assert!(MetricRecord::from_fields(None, Some(10.0)).validate().is_err());
        assert!(MetricRecord::from_fields(Some("m"), None).validate().is_err());
        assert!(MetricRecord::from_fields(Some(""), Some(1.0)).validate().is_err());
        assert!(MetricRecord::new("m", f64::NAN).validate().is_err());

        let record = MetricRecord::from_fields(Some("m"), Some(1.5));
        assert_eq!(record.validate().unwrap(), ("m", 1.5));
    }

    #[test]
    fn test_log_record_trace_context_from_attributes() {
        let record = LogRecord::from_message("hello").with_attributes(attributes([
            ("trace_id", "abc"),
            ("span_id", "def"),
        ]));
        assert_eq!(record.effective_trace_id(), Some("abc"));
        assert_eq!(record.effective_span_id(), Some("def"));

        let explicit = record.with_trace_context("t1", "s1");
        assert_eq!(explicit.effective_trace_id(), Some("t1"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 500), "short");
        assert_eq!(truncate(&"x".repeat(1000), MAX_STRING_LEN).len(), 500);
    }
}
