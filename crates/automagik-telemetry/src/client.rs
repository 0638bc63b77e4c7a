//! Main telemetry client
//!
//! [`TelemetryClient`] is the façade host applications call. It owns the
//! enabled gate, stamps identifiers and system metadata onto every payload,
//! optionally queues payloads and hands them to the configured backend.
//! Delivery failures are logged at debug level and never surface to the
//! caller.

use serde::Serialize;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::backends::{self, TelemetryBackend};
use crate::config::{EnabledSource, ResolvedConfig, TelemetryConfig, ENV_ENABLED};
use crate::error::{ConfigError, DeliveryResult};
use crate::events::{
    truncate, AttributeValue, Attributes, LogRecord, LogSeverity, MetricRecord, MetricType,
    SystemInfo, MAX_STRING_LEN,
};
use crate::identity;
use crate::otlp::{InstrumentationScope, SpanRecord, Status, TracePayload, TracesData};

/// Event name used by [`TelemetryClient::track_error`]
pub const ERROR_EVENT_NAME: &str = "automagik.error";

const SDK_NAME: &str = "automagik-telemetry";

/// Main telemetry client. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TelemetryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ResolvedConfig,
    backend: Arc<dyn TelemetryBackend>,
    enabled: AtomicBool,
    toggled: AtomicBool,
    user_id: String,
    session_id: String,
    resource_attributes: Attributes,
    system_attributes: Attributes,
    scope: InstrumentationScope,
    queue: Mutex<PendingQueue>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Payloads waiting for the next flush
#[derive(Default)]
struct PendingQueue {
    spans: Vec<TracesData>,
    metrics: Vec<MetricRecord>,
    logs: Vec<LogRecord>,
    shutdown: bool,
}

impl PendingQueue {
    fn len(&self) -> usize {
        self.spans.len() + self.metrics.len() + self.logs.len()
    }

    fn take(&mut self) -> PendingBatch {
        PendingBatch {
            spans: std::mem::take(&mut self.spans),
            metrics: std::mem::take(&mut self.metrics),
            logs: std::mem::take(&mut self.logs),
        }
    }

    fn push(&mut self, item: Pending) {
        match item {
            Pending::Span(data) => self.spans.push(data),
            Pending::Metric(record) => self.metrics.push(record),
            Pending::Log(record) => self.logs.push(record),
        }
    }
}

#[derive(Default)]
struct PendingBatch {
    spans: Vec<TracesData>,
    metrics: Vec<MetricRecord>,
    logs: Vec<LogRecord>,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.metrics.is_empty() && self.logs.is_empty()
    }
}

enum Pending {
    Span(TracesData),
    Metric(MetricRecord),
    Log(LogRecord),
}

impl From<Pending> for PendingBatch {
    fn from(item: Pending) -> Self {
        let mut queue = PendingQueue::default();
        queue.push(item);
        queue.take()
    }
}

/// Read-only snapshot returned by [`TelemetryClient::get_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryStatus {
    pub enabled: bool,
    pub enabled_source: EnabledSource,
    pub user_id: String,
    pub session_id: String,
    pub project_name: String,
    pub project_version: String,
    pub organization: String,
    pub backend: String,
    pub endpoint: String,
    pub verbose: bool,
    pub opt_out_file_exists: bool,
    /// Raw value of `AUTOMAGIK_TELEMETRY_ENABLED`, if set
    pub env_var: Option<String>,
}

impl TelemetryClient {
    /// Create a client from host-supplied configuration.
    ///
    /// Fails only on invalid configuration. Must be called inside a tokio
    /// runtime for the background flush timer to start.
    pub fn new(config: TelemetryConfig) -> Result<Self, ConfigError> {
        let resolved = config.resolve()?;
        let backend = backends::from_config(&resolved)?;
        Ok(Self::with_backend(resolved, backend))
    }

    /// Create a client around an already-built backend
    pub fn with_backend(config: ResolvedConfig, backend: Arc<dyn TelemetryBackend>) -> Self {
        let home = config.home_dir.clone();
        let user_id = identity::get_or_create_user_id(home.as_deref());
        let session_id = identity::generate_session_id();
        let system = SystemInfo::detect();

        let resource_attributes =
            build_resource_attributes(&config, &system, &user_id, &session_id);
        let system_attributes = build_system_attributes(&config, &system);
        let scope = InstrumentationScope::new(
            format!("{}.telemetry", config.project_name),
            config.version.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let enabled = config.enabled;
        let batching = config.batch_size > 1;
        let flush_interval = config.flush_interval;

        let inner = Arc::new(ClientInner {
            config,
            backend,
            enabled: AtomicBool::new(enabled),
            toggled: AtomicBool::new(false),
            user_id,
            session_id,
            resource_attributes,
            system_attributes,
            scope,
            queue: Mutex::new(PendingQueue::default()),
            shutdown_tx,
            flush_task: std::sync::Mutex::new(None),
        });

        if batching && !flush_interval.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let task = handle.spawn(run_flush_timer(
                        Arc::downgrade(&inner),
                        flush_interval,
                        shutdown_rx,
                    ));
                    if let Ok(mut slot) = inner.flush_task.lock() {
                        *slot = Some(task);
                    }
                }
                Err(_) => debug!("no tokio runtime, background flush disabled"),
            }
        }

        Self { inner }
    }

    /// Track a named event with attributes
    pub async fn track_event(&self, name: &str, attributes: Attributes) {
        if !self.is_enabled() {
            return;
        }
        if self.inner.config.verbose {
            info!(event = name, "tracking telemetry event");
        }

        let mut span_attributes = self.inner.system_attributes.clone();
        span_attributes.extend(attributes);

        let now = chrono::Utc::now();
        let record = SpanRecord {
            name: name.to_string(),
            trace_id: identity::generate_trace_id(),
            span_id: identity::generate_span_id(),
            parent_span_id: None,
            start: Some(now),
            end: Some(now),
            attributes: span_attributes,
            resource_attributes: self.inner.resource_attributes.clone(),
            status: Status::ok(),
            scope: self.inner.scope.clone(),
        };

        let data = TracePayload::Span(record).into_traces_data();
        self.inner.submit(Pending::Span(data)).await;
    }

    /// Track an error: its short type name and a truncated message
    pub async fn track_error<E>(&self, error: &E, context: Attributes)
    where
        E: Error + ?Sized,
    {
        if !self.is_enabled() {
            return;
        }

        let mut attributes = context;
        attributes.insert("error_type".into(), error_type_name(error).into());
        attributes.insert(
            "error_message".into(),
            truncate(&error.to_string(), MAX_STRING_LEN).into(),
        );
        self.track_event(ERROR_EVENT_NAME, attributes).await;
    }

    /// Track a numeric metric
    pub async fn track_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        attributes: Attributes,
    ) {
        let record = MetricRecord::new(name, value)
            .with_type(metric_type)
            .with_attributes(attributes);
        self.track_metric_record(record).await;
    }

    /// Track a fully specified metric record
    pub async fn track_metric_record(&self, record: MetricRecord) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = record.validate() {
            debug!("dropping metric: {}", e);
            return;
        }

        let mut record = record;
        self.inner.decorate(&mut record.attributes, &mut record.resource_attributes);
        if record.timestamp.is_none() {
            record.timestamp = Some(chrono::Utc::now());
        }

        self.inner.submit(Pending::Metric(record)).await;
    }

    /// Track a log line. `trace_id`/`span_id` attributes correlate it with
    /// an existing trace; otherwise fresh ids are generated.
    pub async fn track_log(&self, message: &str, severity: LogSeverity, attributes: Attributes) {
        let record = LogRecord::new(message, severity).with_attributes(attributes);
        self.track_log_record(record).await;
    }

    /// Track a fully specified log record
    pub async fn track_log_record(&self, record: LogRecord) {
        if !self.is_enabled() {
            return;
        }

        let mut record = record;
        if record.effective_trace_id().is_none() {
            record.trace_id = Some(identity::generate_trace_id());
        }
        if record.effective_span_id().is_none() {
            record.span_id = Some(identity::generate_span_id());
        }
        self.inner.decorate(&mut record.attributes, &mut record.resource_attributes);
        if record.timestamp.is_none() {
            record.timestamp = Some(chrono::Utc::now());
        }

        self.inner.submit(Pending::Log(record)).await;
    }

    /// Send everything queued, then flush the backend. Returns false if any
    /// delivery failed.
    pub async fn flush(&self) -> bool {
        self.inner.flush().await
    }

    /// Stop the background timer and flush one last time. Safe to call
    /// more than once.
    pub async fn shutdown(&self) -> bool {
        let first = {
            let mut queue = self.inner.queue.lock().await;
            !std::mem::replace(&mut queue.shutdown, true)
        };

        if first {
            let _ = self.inner.shutdown_tx.send(true);
            // Dropping the handle detaches the task; it exits on the signal
            // without interrupting a flush already in flight
            if let Ok(mut slot) = self.inner.flush_task.lock() {
                slot.take();
            }
        }

        self.inner.flush().await
    }

    /// Opt in: remove the opt-out marker and start sending
    pub async fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
        self.inner.toggled.store(true, Ordering::SeqCst);
        if let Err(e) = identity::remove_opt_out_marker(self.inner.config.home_dir.as_deref()) {
            debug!("could not remove opt-out marker: {}", e);
        }
    }

    /// Opt out: write the opt-out marker and stop sending. Queued payloads
    /// are discarded.
    pub async fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.toggled.store(true, Ordering::SeqCst);
        if let Err(e) = identity::write_opt_out_marker(self.inner.config.home_dir.as_deref()) {
            debug!("could not write opt-out marker: {}", e);
        }
        let dropped = self.inner.queue.lock().await.take();
        if !dropped.is_empty() {
            debug!("discarded queued telemetry after opt-out");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.inner.config
    }

    /// Snapshot of the client's state. Performs no I/O beyond checking
    /// whether the opt-out marker exists.
    pub fn get_status(&self) -> TelemetryStatus {
        let config = &self.inner.config;
        let enabled_source = if self.inner.toggled.load(Ordering::SeqCst) {
            EnabledSource::Explicit
        } else {
            config.enabled_source
        };
        let endpoint = match config.backend {
            backends::BackendKind::Clickhouse => config.clickhouse.endpoint.clone(),
            _ => config.endpoints.traces.to_string(),
        };

        TelemetryStatus {
            enabled: self.is_enabled(),
            enabled_source,
            user_id: self.inner.user_id.clone(),
            session_id: self.inner.session_id.clone(),
            project_name: config.project_name.clone(),
            project_version: config.version.clone(),
            organization: config.organization.clone(),
            backend: self.inner.backend.name().to_string(),
            endpoint,
            verbose: config.verbose,
            opt_out_file_exists: identity::opt_out_marker_exists(config.home_dir.as_deref()),
            env_var: std::env::var(ENV_ENABLED).ok(),
        }
    }
}

impl ClientInner {
    /// Put system metadata under caller attributes and client resource
    /// attributes under caller resource attributes; caller keys win
    fn decorate(&self, attributes: &mut Attributes, resource: &mut Attributes) {
        let mut merged = self.system_attributes.clone();
        merged.extend(std::mem::take(attributes));
        *attributes = merged;

        let mut merged = self.resource_attributes.clone();
        merged.extend(std::mem::take(resource));
        *resource = merged;
    }

    async fn submit(&self, item: Pending) {
        if self.config.batch_size <= 1 {
            self.dispatch(item.into()).await;
            return;
        }

        let ready = {
            let mut queue = self.queue.lock().await;
            if queue.shutdown {
                // No timer left to pick it up
                Some(PendingBatch::from(item))
            } else {
                queue.push(item);
                (queue.len() >= self.config.batch_size).then(|| queue.take())
            }
        };
        if let Some(batch) = ready {
            self.dispatch(batch).await;
        }
    }

    async fn flush(&self) -> bool {
        let batch = self.queue.lock().await.take();
        let sent = self.dispatch(batch).await;
        let flushed = log_failure("flush", self.backend.flush().await);
        sent && flushed
    }

    /// Timer-driven flush; skipped once shutdown has begun
    async fn flush_on_timer(&self) {
        let batch = {
            let mut queue = self.queue.lock().await;
            if queue.shutdown {
                return;
            }
            queue.take()
        };
        if batch.is_empty() {
            return;
        }
        self.dispatch(batch).await;
        log_failure("flush", self.backend.flush().await);
    }

    async fn dispatch(&self, batch: PendingBatch) -> bool {
        let mut ok = true;
        if !batch.spans.is_empty() {
            let payload = TracePayload::Otlp(TracesData::merge(batch.spans));
            ok &= log_failure("traces", self.backend.send_trace(payload).await);
        }
        for record in batch.metrics {
            ok &= log_failure("metric", self.backend.send_metric(record).await);
        }
        for record in batch.logs {
            ok &= log_failure("log", self.backend.send_log(record).await);
        }
        ok
    }
}

fn log_failure(what: &str, result: DeliveryResult) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!("telemetry {} not delivered: {}", what, e);
            false
        }
    }
}

async fn run_flush_timer(
    inner: Weak<ClientInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.flush_on_timer().await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Concrete type name of an error. Trait objects have no static name, so
/// the leading identifier of their Debug output stands in for it.
fn error_type_name<E: Error + ?Sized>(error: &E) -> String {
    if std::any::type_name::<E>().starts_with("dyn ") {
        let debug = format!("{:?}", error);
        let leading: String = debug
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if leading.starts_with(|c: char| c.is_ascii_uppercase()) {
            return leading;
        }
        return "Error".to_string();
    }
    short_type_name::<E>()
}

fn short_type_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    let mut segments = base.rsplit("::");
    let name = segments.next().unwrap_or(base);
    // `std::io::error::Error` reads as `io::Error`
    if name == "Error" {
        if let Some(module) = segments.find(|s| *s != "error") {
            return format!("{}::{}", module, name);
        }
    }
    name.to_string()
}

fn build_resource_attributes(
    config: &ResolvedConfig,
    system: &SystemInfo,
    user_id: &str,
    session_id: &str,
) -> Attributes {
    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "production".to_string());
    crate::events::attributes([
        ("service.name", AttributeValue::from(config.project_name.as_str())),
        ("service.version", config.version.as_str().into()),
        ("service.organization", config.organization.as_str().into()),
        ("project.name", config.project_name.as_str().into()),
        ("project.version", config.version.as_str().into()),
        ("user.id", user_id.into()),
        ("session.id", session_id.into()),
        ("deployment.environment", environment.into()),
        ("os.type", system.os.as_str().into()),
        ("os.version", system.os_version.as_str().into()),
        ("process.runtime.name", "rust".into()),
        ("telemetry.sdk.name", SDK_NAME.into()),
        ("telemetry.sdk.version", env!("CARGO_PKG_VERSION").into()),
    ])
}

fn build_system_attributes(config: &ResolvedConfig, system: &SystemInfo) -> Attributes {
    crate::events::attributes([
        ("system.os", AttributeValue::from(system.os.as_str())),
        ("system.os_version", system.os_version.as_str().into()),
        ("system.architecture", system.arch.as_str().into()),
        ("system.is_docker", system.is_docker.into()),
        ("system.project_name", config.project_name.as_str().into()),
        ("system.project_version", config.version.as_str().into()),
        ("system.organization", config.organization.as_str().into()),
    ])
}
