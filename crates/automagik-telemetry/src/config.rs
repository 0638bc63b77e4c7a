//! Telemetry configuration loading and validation
//!
//! [`TelemetryConfig`] is what the host application fills in (directly or
//! from a TOML `[telemetry]` table). [`TelemetryConfig::resolve`] layers
//! environment overrides and defaults on top, validates the result and
//! produces the immutable [`ResolvedConfig`] a client runs with.
//!
//! Precedence for every overridable field: explicit value > environment >
//! default.

use anyhow::Context;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::backends::BackendKind;
use crate::error::ConfigError;
use crate::identity;
use crate::transport::{CompressionPolicy, RetryPolicy};

pub const DEFAULT_ENDPOINT: &str = "https://telemetry.namastex.ai/v1/traces";
pub const DEFAULT_ORGANIZATION: &str = "namastex";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 60;

pub const ENV_ENABLED: &str = "AUTOMAGIK_TELEMETRY_ENABLED";
pub const ENV_ENDPOINT: &str = "AUTOMAGIK_TELEMETRY_ENDPOINT";
pub const ENV_VERBOSE: &str = "AUTOMAGIK_TELEMETRY_VERBOSE";
pub const ENV_TIMEOUT: &str = "AUTOMAGIK_TELEMETRY_TIMEOUT";

const CI_ENV_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "TRAVIS",
    "JENKINS",
    "GITLAB_CI",
    "CIRCLECI",
];
const DEVELOPMENT_ENVIRONMENTS: &[&str] = &["development", "dev", "test", "testing"];

/// Telemetry configuration as supplied by the host application
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Name of the emitting project (required)
    pub project_name: String,

    /// Version of the emitting project (required)
    pub version: String,

    /// `otlp`, `clickhouse` or `debug`
    pub backend: String,

    /// OTLP traces endpoint, or a bare base URL (`https://host`)
    pub endpoint: Option<String>,
    pub metrics_endpoint: Option<String>,
    pub logs_endpoint: Option<String>,

    pub organization: String,

    /// HTTP timeout; `None` defers to the environment, then 5 seconds
    pub timeout_secs: Option<u64>,

    /// Items queued before an inline flush; 1 sends every call immediately
    pub batch_size: usize,

    /// Seconds between background flushes; 0 disables the timer
    pub flush_interval_secs: f64,

    pub compression_enabled: bool,
    pub compression_threshold: usize,

    pub max_retries: u32,
    pub retry_backoff_base_secs: f64,

    /// `None` = decide from environment, opt-out marker and CI detection
    pub enabled: Option<bool>,

    /// `None` = defer to `AUTOMAGIK_TELEMETRY_VERBOSE`
    pub verbose: Option<bool>,

    pub clickhouse: ClickHouseConfig,

    /// Directory holding the user id and opt-out marker (default: `$HOME`)
    pub home_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            version: String::new(),
            backend: BackendKind::Otlp.as_str().to_string(),
            endpoint: None,
            metrics_endpoint: None,
            logs_endpoint: None,
            organization: DEFAULT_ORGANIZATION.to_string(),
            timeout_secs: None,
            batch_size: 100,
            flush_interval_secs: 5.0,
            compression_enabled: true,
            compression_threshold: 1024,
            max_retries: 3,
            retry_backoff_base_secs: 1.0,
            enabled: None,
            verbose: None,
            clickhouse: ClickHouseConfig::default(),
            home_dir: None,
        }
    }
}

/// Connection settings for direct ClickHouse insertion
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub endpoint: String,
    pub database: String,
    pub traces_table: String,
    pub metrics_table: String,
    pub logs_table: String,
    pub username: String,
    pub password: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8123".to_string(),
            database: "telemetry".to_string(),
            traces_table: "traces".to_string(),
            metrics_table: "metrics".to_string(),
            logs_table: "logs".to_string(),
            username: "default".to_string(),
            password: String::new(),
        }
    }
}

/// The three OTLP/HTTP endpoints, one per signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtlpEndpoints {
    pub traces: Url,
    pub metrics: Url,
    pub logs: Url,
}

/// Why the client ended up enabled or disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnabledSource {
    Explicit,
    Environment,
    OptOutMarker,
    Ci,
    Development,
    Default,
}

impl EnabledSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnabledSource::Explicit => "explicit",
            EnabledSource::Environment => "environment",
            EnabledSource::OptOutMarker => "opt_out_marker",
            EnabledSource::Ci => "ci",
            EnabledSource::Development => "development",
            EnabledSource::Default => "default",
        }
    }
}

/// Environment-provided overrides, captured once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub verbose: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub is_ci: bool,
    pub is_development: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let timeout_secs = env::var(ENV_TIMEOUT)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0);

        Self {
            enabled: env::var(ENV_ENABLED).ok().map(|v| parse_bool_env(&v)),
            endpoint: env::var(ENV_ENDPOINT).ok().filter(|v| !v.trim().is_empty()),
            verbose: env::var(ENV_VERBOSE).ok().map(|v| parse_bool_env(&v)),
            timeout_secs,
            is_ci: is_ci(),
            is_development: is_development_env(),
        }
    }
}

/// Fully resolved, validated, immutable client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub project_name: String,
    pub version: String,
    pub organization: String,
    pub backend: BackendKind,
    pub endpoints: OtlpEndpoints,
    pub timeout: Duration,
    pub batch_size: usize,
    /// `Duration::ZERO` means no background flush
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub compression: CompressionPolicy,
    pub clickhouse: ClickHouseConfig,
    pub enabled: bool,
    pub enabled_source: EnabledSource,
    pub verbose: bool,
    pub home_dir: Option<PathBuf>,
}

impl TelemetryConfig {
    pub fn new(project_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Check the fields that don't depend on the environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "project_name",
            });
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "version" });
        }
        if self.organization.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "organization",
            });
        }
        BackendKind::parse(&self.backend)?;

        if let Some(endpoint) = &self.endpoint {
            parse_http_url("endpoint", endpoint)?;
        }
        if let Some(endpoint) = &self.metrics_endpoint {
            parse_http_url("metrics_endpoint", endpoint)?;
        }
        if let Some(endpoint) = &self.logs_endpoint {
            parse_http_url("logs_endpoint", endpoint)?;
        }
        if let Some(timeout) = self.timeout_secs {
            validate_timeout(timeout)?;
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        seconds("flush_interval", self.flush_interval_secs)?;
        seconds("retry_backoff_base", self.retry_backoff_base_secs)?;

        parse_http_url("clickhouse.endpoint", &self.clickhouse.endpoint)?;
        identifier("clickhouse.database", &self.clickhouse.database)?;
        identifier("clickhouse.traces_table", &self.clickhouse.traces_table)?;
        identifier("clickhouse.metrics_table", &self.clickhouse.metrics_table)?;
        identifier("clickhouse.logs_table", &self.clickhouse.logs_table)?;

        Ok(())
    }

    /// Resolve against the current process environment
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        self.resolve_with(&EnvOverrides::from_env())
    }

    /// Resolve against a captured set of environment overrides
    pub fn resolve_with(&self, env: &EnvOverrides) -> Result<ResolvedConfig, ConfigError> {
        self.validate()?;

        let backend = BackendKind::parse(&self.backend)?;

        let base = match (&self.endpoint, &env.endpoint) {
            (Some(explicit), _) => explicit.clone(),
            (None, Some(from_env)) if parse_http_url(ENV_ENDPOINT, from_env).is_ok() => {
                from_env.clone()
            }
            (None, Some(from_env)) => {
                warn!("ignoring invalid {}={}", ENV_ENDPOINT, from_env);
                DEFAULT_ENDPOINT.to_string()
            }
            (None, None) => DEFAULT_ENDPOINT.to_string(),
        };
        let endpoints = derive_endpoints(
            &base,
            self.metrics_endpoint.as_deref(),
            self.logs_endpoint.as_deref(),
        )?;

        let timeout_secs = match (self.timeout_secs, env.timeout_secs) {
            (Some(explicit), _) => explicit,
            (None, Some(from_env)) if validate_timeout(from_env).is_ok() => from_env,
            (None, Some(from_env)) => {
                warn!("ignoring out-of-range {}={}", ENV_TIMEOUT, from_env);
                DEFAULT_TIMEOUT_SECS
            }
            (None, None) => DEFAULT_TIMEOUT_SECS,
        };

        let home_dir = self.home_dir.clone();
        let (enabled, enabled_source) = resolve_enabled(self.enabled, env, home_dir.as_deref());

        Ok(ResolvedConfig {
            project_name: self.project_name.clone(),
            version: self.version.clone(),
            organization: self.organization.clone(),
            backend,
            endpoints,
            timeout: Duration::from_secs(timeout_secs),
            batch_size: self.batch_size,
            flush_interval: Duration::from_secs_f64(self.flush_interval_secs),
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_secs_f64(self.retry_backoff_base_secs),
            ),
            compression: CompressionPolicy {
                enabled: self.compression_enabled,
                threshold: self.compression_threshold,
            },
            clickhouse: self.clickhouse.clone(),
            enabled,
            enabled_source,
            verbose: self.verbose.or(env.verbose).unwrap_or(false),
            home_dir,
        })
    }
}

/// explicit → env → opt-out marker → CI → development → disabled
fn resolve_enabled(
    explicit: Option<bool>,
    env: &EnvOverrides,
    home: Option<&Path>,
) -> (bool, EnabledSource) {
    if let Some(enabled) = explicit {
        return (enabled, EnabledSource::Explicit);
    }
    if let Some(enabled) = env.enabled {
        return (enabled, EnabledSource::Environment);
    }
    if identity::opt_out_marker_exists(home) {
        return (false, EnabledSource::OptOutMarker);
    }
    if env.is_ci {
        return (false, EnabledSource::Ci);
    }
    if env.is_development {
        return (false, EnabledSource::Development);
    }
    (false, EnabledSource::Default)
}

/// Expand a traces endpoint (or bare base URL) into all three signal endpoints
pub fn derive_endpoints(
    base: &str,
    metrics: Option<&str>,
    logs: Option<&str>,
) -> Result<OtlpEndpoints, ConfigError> {
    let mut traces = parse_http_url("endpoint", base)?;
    if traces.path().is_empty() || traces.path() == "/" {
        traces.set_path("/v1/traces");
    }

    let sibling = |signal: &str| -> Url {
        let mut url = traces.clone();
        match traces.path().strip_suffix("/traces") {
            Some(prefix) if traces.path().ends_with("/v1/traces") => {
                url.set_path(&format!("{}/{}", prefix, signal));
            }
            _ => url.set_path(&format!("/v1/{}", signal)),
        }
        url
    };

    let metrics = match metrics {
        Some(explicit) => parse_http_url("metrics_endpoint", explicit)?,
        None => sibling("metrics"),
    };
    let logs = match logs {
        Some(explicit) => parse_http_url("logs_endpoint", explicit)?,
        None => sibling("logs"),
    };

    Ok(OtlpEndpoints {
        traces,
        metrics,
        logs,
    })
}

fn parse_http_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    };
    let url = Url::parse(value.trim()).map_err(|_| invalid())?;
    let has_host = url.host_str().is_some_and(|h| !h.is_empty());
    if !matches!(url.scheme(), "http" | "https") || !has_host {
        return Err(invalid());
    }
    Ok(url)
}

fn validate_timeout(secs: u64) -> Result<(), ConfigError> {
    if (1..=MAX_TIMEOUT_SECS).contains(&secs) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTimeout(secs))
    }
}

fn seconds(field: &'static str, value: f64) -> Result<(), ConfigError> {
    // Duration::from_secs_f64 panics on negative, NaN or overflowing input
    if value.is_finite() && value >= 0.0 && value < 1.0e9 {
        Ok(())
    } else {
        Err(ConfigError::InvalidDuration { field, value })
    }
}

fn identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let valid = !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

/// `true`, `1`, `yes` and `on` (any case) are true; everything else is false
pub fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Check if running in CI environment
pub fn is_ci() -> bool {
    CI_ENV_VARS.iter().any(|var| env::var_os(var).is_some())
}

/// `ENVIRONMENT` names a development or test deployment
pub fn is_development_env() -> bool {
    env::var("ENVIRONMENT")
        .map(|v| DEVELOPMENT_ENVIRONMENTS.contains(&v.trim().to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Load a telemetry config from the `[telemetry]` table of a TOML file.
/// A file without that table yields the defaults.
pub fn load_config_file(path: &Path) -> anyhow::Result<TelemetryConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;

    #[derive(Deserialize)]
    struct FullConfig {
        #[serde(default)]
        telemetry: Option<TelemetryConfig>,
    }

    let full_config: FullConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;

    Ok(full_config.telemetry.unwrap_or_default())
}
