use anyhow::{bail, Context, Result};
use automagik_telemetry::config::ENV_ENABLED;
use automagik_telemetry::{
    load_config_file, AttributeValue, Attributes, LogSeverity, MetricType, TelemetryClient,
    TelemetryConfig, TelemetryStatus,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "automagik-telemetry",
    version,
    about = "Inspect and toggle Automagik telemetry"
)]
struct Cli {
    /// Project name reported with every payload
    #[arg(long, global = true)]
    project: Option<String>,

    /// Project version reported with every payload
    #[arg(long = "project-version", global = true)]
    project_version: Option<String>,

    /// TOML file with a [telemetry] table
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log delivery details to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show whether telemetry is enabled and why
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Opt in: remove the opt-out marker
    Enable,
    /// Opt out: write the opt-out marker
    Disable,
    /// Send a single payload through the configured backend
    Send {
        /// otlp, clickhouse or debug (default: from config)
        #[arg(long, global = true)]
        backend: Option<String>,

        #[command(subcommand)]
        payload: Payload,
    },
}

#[derive(Subcommand)]
enum Payload {
    /// Track a named event
    Event {
        name: String,
        /// Attributes in key=value format (can be specified multiple times)
        #[arg(long = "attr", value_name = "KEY=VALUE", value_parser = parse_attr)]
        attrs: Vec<(String, AttributeValue)>,
    },
    /// Track a metric
    Metric {
        name: String,
        value: f64,
        /// gauge, counter or histogram
        #[arg(long, default_value = "gauge")]
        kind: String,
        #[arg(long = "attr", value_name = "KEY=VALUE", value_parser = parse_attr)]
        attrs: Vec<(String, AttributeValue)>,
    },
    /// Track a log line
    Log {
        message: String,
        #[arg(long, default_value = "info")]
        severity: String,
        #[arg(long = "attr", value_name = "KEY=VALUE", value_parser = parse_attr)]
        attrs: Vec<(String, AttributeValue)>,
    },
}

/// `key=value`; the value is typed as bool, integer or float when it parses
fn parse_attr(raw: &str) -> Result<(String, AttributeValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }

    let value = if let Ok(b) = value.parse::<bool>() {
        AttributeValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        AttributeValue::Int(i)
    } else if let Some(f) = value.parse::<f64>().ok().filter(|f| f.is_finite()) {
        AttributeValue::Double(f)
    } else {
        AttributeValue::String(value.to_string())
    };
    Ok((key.to_string(), value))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "automagik_telemetry=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<TelemetryConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => TelemetryConfig::default(),
    };

    if let Some(project) = &cli.project {
        config.project_name = project.clone();
    } else if config.project_name.is_empty() {
        config.project_name = env!("CARGO_PKG_NAME").to_string();
    }
    if let Some(version) = &cli.project_version {
        config.version = version.clone();
    } else if config.version.is_empty() {
        config.version = env!("CARGO_PKG_VERSION").to_string();
    }
    if cli.verbose {
        config.verbose = Some(true);
    }
    // No background timer; `send` delivers on shutdown
    config.flush_interval_secs = 0.0;

    Ok(config)
}

fn print_status(status: &TelemetryStatus) {
    let state = if status.enabled { "enabled" } else { "disabled" };
    println!("Telemetry: {} ({})", state, status.enabled_source.as_str());
    println!("Project: {} {}", status.project_name, status.project_version);
    println!("Organization: {}", status.organization);
    println!("Backend: {}", status.backend);
    println!("Endpoint: {}", status.endpoint);
    println!("User ID: {}", status.user_id);
    println!("Session ID: {}", status.session_id);
    println!(
        "Opt-out file: {}",
        if status.opt_out_file_exists { "present" } else { "absent" }
    );
    println!(
        "{}: {}",
        ENV_ENABLED,
        status.env_var.as_deref().unwrap_or("(unset)")
    );
}

fn attributes(pairs: Vec<(String, AttributeValue)>) -> Attributes {
    pairs.into_iter().collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(&cli)?;
    if let Command::Send {
        backend: Some(backend),
        ..
    } = &cli.cmd
    {
        config.backend = backend.clone();
    }
    let client = TelemetryClient::new(config).context("Invalid telemetry configuration")?;

    match cli.cmd {
        Command::Status { json } => {
            let status = client.get_status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Enable => {
            client.enable().await;
            println!("Telemetry enabled");
        }
        Command::Disable => {
            client.disable().await;
            if !client.get_status().opt_out_file_exists {
                bail!("Failed to write the opt-out marker");
            }
            println!("Telemetry disabled");
        }
        Command::Send { payload, .. } => {
            if !client.is_enabled() {
                eprintln!(
                    "Telemetry is disabled; nothing sent (set {}=true to send)",
                    ENV_ENABLED
                );
                return Ok(());
            }

            match payload {
                Payload::Event { name, attrs } => {
                    client.track_event(&name, attributes(attrs)).await;
                }
                Payload::Metric {
                    name,
                    value,
                    kind,
                    attrs,
                } => {
                    let kind = MetricType::from(kind.as_str());
                    client
                        .track_metric(&name, value, kind, attributes(attrs))
                        .await;
                }
                Payload::Log {
                    message,
                    severity,
                    attrs,
                } => {
                    let severity = LogSeverity::from(severity.as_str());
                    client
                        .track_log(&message, severity, attributes(attrs))
                        .await;
                }
            }

            if !client.shutdown().await {
                bail!("Telemetry delivery failed");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attr_types() {
        assert_eq!(
            parse_attr("k=v").unwrap(),
            ("k".to_string(), AttributeValue::String("v".into()))
        );
        assert_eq!(parse_attr("n=3").unwrap().1, AttributeValue::Int(3));
        assert_eq!(parse_attr("f=1.5").unwrap().1, AttributeValue::Double(1.5));
        assert_eq!(parse_attr("b=true").unwrap().1, AttributeValue::Bool(true));
        assert_eq!(
            parse_attr("url=a=b").unwrap().1,
            AttributeValue::String("a=b".into())
        );
    }

    #[test]
    fn test_parse_attr_rejects_malformed() {
        assert!(parse_attr("novalue").is_err());
        assert!(parse_attr("=v").is_err());
        assert_eq!(
            parse_attr("x=nan").unwrap().1,
            AttributeValue::String("nan".into())
        );
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
