//! Direct ClickHouse insertion over the HTTP interface
//!
//! Rows are buffered per table and written with
//! `INSERT INTO <db>.<table> FORMAT JSONEachRow`. A table's buffer is sent as
//! soon as it reaches `batch_size`; [`TelemetryBackend::flush`] sends all three.
//! A buffer is emptied before it is sent, so rows from a failed insert are
//! dropped rather than retried forever.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Url;
use serde::Serialize;
use std::mem;
use tokio::sync::Mutex;
use tracing::debug;

use super::schema::{
    build_log_row, build_metric_row, transform_to_row, LogRow, MetricRow, TraceRow,
};
use super::TelemetryBackend;
use crate::config::{ClickHouseConfig, ResolvedConfig};
use crate::error::{ConfigError, DeliveryError, DeliveryResult};
use crate::events::{LogRecord, MetricRecord};
use crate::otlp::TracePayload;
use crate::transport::{HttpTransport, OutgoingRequest};

const NDJSON: &str = "application/x-ndjson";

/// Where and how to insert
#[derive(Debug, Clone)]
pub struct ClickHouseSettings {
    pub endpoint: Url,
    pub database: String,
    pub traces_table: String,
    pub metrics_table: String,
    pub logs_table: String,
    pub username: String,
    pub password: String,
    pub batch_size: usize,
}

impl ClickHouseSettings {
    pub fn from_config(
        config: &ClickHouseConfig,
        batch_size: usize,
    ) -> Result<Self, ConfigError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|_| ConfigError::InvalidUrl {
            field: "clickhouse.endpoint",
            value: config.endpoint.clone(),
        })?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        Ok(Self {
            endpoint,
            database: config.database.clone(),
            traces_table: config.traces_table.clone(),
            metrics_table: config.metrics_table.clone(),
            logs_table: config.logs_table.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            batch_size,
        })
    }

    /// `{endpoint}/?query=INSERT INTO db.table FORMAT JSONEachRow`
    pub fn insert_url(&self, table: &str) -> Url {
        let mut url = self.endpoint.clone();
        let path = format!("{}/", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut().clear().append_pair(
            "query",
            &format!("INSERT INTO {}.{} FORMAT JSONEachRow", self.database, table),
        );
        url
    }

    /// Basic auth header, when a username is configured
    pub fn authorization(&self) -> Option<String> {
        if self.username.is_empty() {
            return None;
        }
        let credentials = format!("{}:{}", self.username, self.password);
        Some(format!("Basic {}", BASE64.encode(credentials)))
    }
}

#[derive(Debug, Default)]
struct Batches {
    traces: Vec<TraceRow>,
    metrics: Vec<MetricRow>,
    logs: Vec<LogRow>,
}

pub struct ClickHouseBackend {
    settings: ClickHouseSettings,
    transport: HttpTransport,
    batches: Mutex<Batches>,
}

impl ClickHouseBackend {
    pub fn new(settings: ClickHouseSettings, transport: HttpTransport) -> Self {
        Self {
            settings,
            transport,
            batches: Mutex::new(Batches::default()),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, ConfigError> {
        let settings = ClickHouseSettings::from_config(&config.clickhouse, config.batch_size)?;
        let transport = HttpTransport::new(
            config.timeout,
            config.retry,
            config.compression,
            config.verbose,
        )?;
        Ok(Self::new(settings, transport))
    }

    pub fn settings(&self) -> &ClickHouseSettings {
        &self.settings
    }

    /// Rows waiting in the (traces, metrics, logs) buffers
    pub async fn pending(&self) -> (usize, usize, usize) {
        let batches = self.batches.lock().await;
        (batches.traces.len(), batches.metrics.len(), batches.logs.len())
    }

    async fn insert_rows<T: Serialize>(
        &self,
        rows: &[T],
        table: &str,
        signal: &'static str,
    ) -> DeliveryResult {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                body.push(b'\n');
            }
            serde_json::to_writer(&mut body, row)?;
        }

        let request = OutgoingRequest {
            url: self.settings.insert_url(table),
            body,
            content_type: NDJSON,
            authorization: self.settings.authorization(),
            signal,
        };
        self.transport.post(request).await?;
        debug!("inserted {} rows into {}.{}", rows.len(), self.settings.database, table);
        Ok(())
    }

    /// Insert every full chunk, attempting all of them
    async fn insert_chunks<T: Serialize>(
        &self,
        chunks: Vec<Vec<T>>,
        table: &str,
        signal: &'static str,
    ) -> DeliveryResult {
        let mut outcome = Ok(());
        for chunk in chunks {
            let result = self.insert_rows(&chunk, table, signal).await;
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }
}

/// Append rows, splitting off a chunk each time the buffer fills up
fn append<T>(
    buffer: &mut Vec<T>,
    rows: impl IntoIterator<Item = T>,
    batch_size: usize,
) -> Vec<Vec<T>> {
    let mut full = Vec::new();
    for row in rows {
        buffer.push(row);
        if buffer.len() >= batch_size {
            full.push(mem::take(buffer));
        }
    }
    full
}

#[async_trait]
impl TelemetryBackend for ClickHouseBackend {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn send_trace(&self, payload: TracePayload) -> DeliveryResult {
        let data = payload.into_traces_data();
        let rows: Vec<TraceRow> = data
            .spans()
            .map(|(resource, span)| transform_to_row(resource, span))
            .collect();

        let full = {
            let mut batches = self.batches.lock().await;
            append(&mut batches.traces, rows, self.settings.batch_size)
        };
        self.insert_chunks(full, &self.settings.traces_table, "traces").await
    }

    async fn send_metric(&self, record: MetricRecord) -> DeliveryResult {
        let row = build_metric_row(&record)?;
        let full = {
            let mut batches = self.batches.lock().await;
            append(&mut batches.metrics, [row], self.settings.batch_size)
        };
        self.insert_chunks(full, &self.settings.metrics_table, "metrics").await
    }

    async fn send_log(&self, record: LogRecord) -> DeliveryResult {
        let row = build_log_row(&record);
        let full = {
            let mut batches = self.batches.lock().await;
            append(&mut batches.logs, [row], self.settings.batch_size)
        };
        self.insert_chunks(full, &self.settings.logs_table, "logs").await
    }

    async fn flush(&self) -> DeliveryResult {
        let Batches {
            traces,
            metrics,
            logs,
        } = mem::take(&mut *self.batches.lock().await);

        let results: [Result<(), DeliveryError>; 3] = [
            self.insert_rows(&traces, &self.settings.traces_table, "traces").await,
            self.insert_rows(&metrics, &self.settings.metrics_table, "metrics").await,
            self.insert_rows(&logs, &self.settings.logs_table, "logs").await,
        ];
        results.into_iter().collect()
    }
}
