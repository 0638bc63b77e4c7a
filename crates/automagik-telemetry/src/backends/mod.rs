//! Storage backends
//!
//! A backend receives traces, metrics and logs and gets them somewhere:
//! an OTLP collector, a ClickHouse table, or stderr. The client only talks
//! to the [`TelemetryBackend`] trait, so adding a destination never touches
//! the client.

pub mod clickhouse;
pub mod debug;
pub mod otlp;
pub mod schema;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::config::ResolvedConfig;
use crate::error::{ConfigError, DeliveryResult};
use crate::events::{LogRecord, MetricRecord};
use crate::otlp::{InstrumentationScope, TracePayload};

pub use clickhouse::{ClickHouseBackend, ClickHouseSettings};
pub use debug::DebugBackend;
pub use otlp::OtlpBackend;

/// Capability contract every destination implements.
///
/// Operations report failure through [`DeliveryResult`]; they never panic on
/// bad input or network trouble.
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Short name for logs and status output
    fn name(&self) -> &'static str;

    /// Deliver (or enqueue) spans
    async fn send_trace(&self, payload: TracePayload) -> DeliveryResult;

    /// Deliver (or enqueue) one metric; a missing name or value is rejected
    /// before any I/O
    async fn send_metric(&self, record: MetricRecord) -> DeliveryResult;

    /// Deliver (or enqueue) one log record; an empty message is fine
    async fn send_log(&self, record: LogRecord) -> DeliveryResult;

    /// Drain anything buffered. Safe to call with nothing pending.
    async fn flush(&self) -> DeliveryResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Otlp,
    Clickhouse,
    Debug,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "otlp" => Ok(BackendKind::Otlp),
            "clickhouse" => Ok(BackendKind::Clickhouse),
            "debug" => Ok(BackendKind::Debug),
            _ => Err(ConfigError::UnknownBackend(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Otlp => "otlp",
            BackendKind::Clickhouse => "clickhouse",
            BackendKind::Debug => "debug",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the backend a resolved configuration asks for
pub fn from_config(config: &ResolvedConfig) -> Result<Arc<dyn TelemetryBackend>, ConfigError> {
    let backend: Arc<dyn TelemetryBackend> = match config.backend {
        BackendKind::Otlp => Arc::new(OtlpBackend::from_config(config)?),
        BackendKind::Clickhouse => Arc::new(ClickHouseBackend::from_config(config)?),
        BackendKind::Debug => Arc::new(DebugBackend::stderr(InstrumentationScope::new(
            format!("{}.telemetry", config.project_name),
            config.version.clone(),
        ))),
    };
    Ok(backend)
}
