//! Backend that prints payloads instead of sending them

use async_trait::async_trait;
use serde::Serialize;
use std::io::{self, Write};
use tokio::sync::Mutex;

use super::TelemetryBackend;
use crate::error::{DeliveryError, DeliveryResult};
use crate::events::{LogRecord, MetricRecord};
use crate::otlp::{InstrumentationScope, LogsData, MetricsData, TracePayload};

/// Writes every payload as pretty JSON, in the OTLP shape a collector would
/// receive, to stderr (or any writer)
pub struct DebugBackend {
    out: Mutex<Box<dyn Write + Send>>,
    scope: InstrumentationScope,
}

impl DebugBackend {
    pub fn new(out: Box<dyn Write + Send>, scope: InstrumentationScope) -> Self {
        Self {
            out: Mutex::new(out),
            scope,
        }
    }

    pub fn stderr(scope: InstrumentationScope) -> Self {
        Self::new(Box::new(io::stderr()), scope)
    }

    async fn print<T: Serialize>(&self, signal: &str, payload: &T) -> DeliveryResult {
        let json = serde_json::to_string_pretty(payload)?;
        let mut out = self.out.lock().await;
        write_payload(&mut **out, signal, &json).map_err(DeliveryError::Output)
    }
}

fn write_payload(out: &mut dyn Write, signal: &str, json: &str) -> io::Result<()> {
    writeln!(out, "📊 Telemetry {} (DEBUG MODE - not sent):", signal)?;
    writeln!(out, "{}", json)?;
    out.flush()
}

#[async_trait]
impl TelemetryBackend for DebugBackend {
    fn name(&self) -> &'static str {
        "debug"
    }

    async fn send_trace(&self, payload: TracePayload) -> DeliveryResult {
        self.print("traces", &payload.into_traces_data()).await
    }

    async fn send_metric(&self, record: MetricRecord) -> DeliveryResult {
        record.validate()?;
        let data = MetricsData::from_record(&record, self.scope.clone());
        self.print("metrics", &data).await
    }

    async fn send_log(&self, record: LogRecord) -> DeliveryResult {
        let data = LogsData::from_record(&record, self.scope.clone());
        self.print("logs", &data).await
    }

    async fn flush(&self) -> DeliveryResult {
        self.out.lock().await.flush().map_err(DeliveryError::Output)
    }
}
