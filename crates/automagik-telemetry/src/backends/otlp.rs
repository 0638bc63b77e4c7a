//! OTLP/HTTP JSON backend
//!
//! No buffering: every call is one POST to the signal's endpoint, with the
//! transport's compression and retry policy applied.

use async_trait::async_trait;
use reqwest::Url;

use super::TelemetryBackend;
use crate::config::{OtlpEndpoints, ResolvedConfig};
use crate::error::{ConfigError, DeliveryResult};
use crate::events::{LogRecord, MetricRecord};
use crate::otlp::{InstrumentationScope, LogsData, MetricsData, TracePayload};
use crate::transport::{HttpTransport, OutgoingRequest};

pub struct OtlpBackend {
    endpoints: OtlpEndpoints,
    transport: HttpTransport,
    scope: InstrumentationScope,
}

impl OtlpBackend {
    pub fn new(
        endpoints: OtlpEndpoints,
        transport: HttpTransport,
        scope: InstrumentationScope,
    ) -> Self {
        Self {
            endpoints,
            transport,
            scope,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(
            config.timeout,
            config.retry,
            config.compression,
            config.verbose,
        )?;
        Ok(Self::new(
            config.endpoints.clone(),
            transport,
            InstrumentationScope::new(
                format!("{}.telemetry", config.project_name),
                config.version.clone(),
            ),
        ))
    }

    pub fn endpoints(&self) -> &OtlpEndpoints {
        &self.endpoints
    }

    async fn post_json<T: serde::Serialize>(
        &self,
        url: &Url,
        payload: &T,
        signal: &'static str,
    ) -> DeliveryResult {
        let body = serde_json::to_vec(payload)?;
        self.transport
            .post(OutgoingRequest::json(url.clone(), body, signal))
            .await
    }
}

#[async_trait]
impl TelemetryBackend for OtlpBackend {
    fn name(&self) -> &'static str {
        "otlp"
    }

    async fn send_trace(&self, payload: TracePayload) -> DeliveryResult {
        let data = payload.into_traces_data();
        self.post_json(&self.endpoints.traces, &data, "traces").await
    }

    async fn send_metric(&self, record: MetricRecord) -> DeliveryResult {
        record.validate()?;
        let data = MetricsData::from_record(&record, self.scope.clone());
        self.post_json(&self.endpoints.metrics, &data, "metrics").await
    }

    async fn send_log(&self, record: LogRecord) -> DeliveryResult {
        let data = LogsData::from_record(&record, self.scope.clone());
        self.post_json(&self.endpoints.logs, &data, "logs").await
    }

    async fn flush(&self) -> DeliveryResult {
        // Nothing is buffered
        Ok(())
    }
}
