//! # Automagik Telemetry
//!
//! Privacy-first telemetry for Automagik projects. Events, metrics and logs
//! are emitted as OpenTelemetry data and shipped to an OTLP collector or
//! straight into ClickHouse.
//!
//! ## Privacy Guarantees
//!
//! - **Opt-in**: disabled unless explicitly enabled by config or environment
//! - **Anonymous**: a random user id, never derived from hardware or accounts
//! - **Fail Gracefully**: tracking and flushing never return errors or panic
//! - **Debug Backend**: print payloads to stderr instead of sending them
//!
//! ## What We Collect
//!
//! - Event names and the attributes the host application passes in
//! - Metric names and values, log messages and severities
//! - Error type names and truncated error messages
//! - OS, OS version, architecture, whether running in Docker
//! - Project name, version and organization
//!
//! ## Opt-Out
//!
//! ```bash
//! # Via environment variable
//! export AUTOMAGIK_TELEMETRY_ENABLED=false
//!
//! # Permanently, for every Automagik project
//! touch ~/.automagik-no-telemetry
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use automagik_telemetry::{attributes, TelemetryClient, TelemetryConfig};
//!
//! # async fn run() -> Result<(), automagik_telemetry::ConfigError> {
//! let config = TelemetryConfig::new("omni", "1.0.0");
//! let client = TelemetryClient::new(config)?;
//!
//! client
//!     .track_event("omni.message.sent", attributes([("channel", "whatsapp")]))
//!     .await;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod otlp;
pub mod transport;

pub use backends::{BackendKind, ClickHouseBackend, DebugBackend, OtlpBackend, TelemetryBackend};
pub use client::{TelemetryClient, TelemetryStatus};
pub use config::{load_config_file, ClickHouseConfig, ResolvedConfig, TelemetryConfig};
pub use error::{ConfigError, DeliveryError, DeliveryResult};
pub use events::{
    attributes, AttributeValue, Attributes, ExceptionInfo, LogRecord, LogSeverity, MetricRecord,
    MetricType,
};
pub use otlp::{SpanRecord, TracePayload};
