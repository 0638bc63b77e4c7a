//! ClickHouse backend against a fake HTTP interface

use automagik_telemetry::config::EnvOverrides;
use automagik_telemetry::events::attributes;
use automagik_telemetry::otlp::{SpanRecord, TracePayload};
use automagik_telemetry::{
    ClickHouseBackend, ClickHouseConfig, DeliveryError, LogRecord, LogSeverity, MetricRecord,
    MetricType, TelemetryBackend, TelemetryConfig,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TRACES_INSERT: &str = "INSERT INTO telemetry.traces FORMAT JSONEachRow";
const METRICS_INSERT: &str = "INSERT INTO telemetry.metrics FORMAT JSONEachRow";
const LOGS_INSERT: &str = "INSERT INTO telemetry.logs FORMAT JSONEachRow";

fn backend(
    server: &MockServer,
    home: &TempDir,
    tweak: impl FnOnce(&mut TelemetryConfig),
) -> ClickHouseBackend {
    let mut config = TelemetryConfig {
        backend: "clickhouse".to_string(),
        batch_size: 3,
        max_retries: 1,
        retry_backoff_base_secs: 0.0,
        compression_threshold: 1_000_000,
        home_dir: Some(home.path().to_path_buf()),
        clickhouse: ClickHouseConfig {
            endpoint: server.uri(),
            ..ClickHouseConfig::default()
        },
        ..TelemetryConfig::new("omni", "1.0.0")
    };
    tweak(&mut config);
    let resolved = config.resolve_with(&EnvOverrides::default()).unwrap();
    ClickHouseBackend::from_config(&resolved).unwrap()
}

fn span(name: &str) -> TracePayload {
    TracePayload::from(SpanRecord {
        name: name.to_string(),
        trace_id: "0af7651916cd43dd8448eb211c80319c".to_string(),
        span_id: "b7ad6b7169203331".to_string(),
        attributes: attributes([("user.id", "u-1")]),
        resource_attributes: attributes([("service.name", "omni")]),
        ..SpanRecord::default()
    })
}

fn rows(request: &Request) -> Vec<Value> {
    let body = String::from_utf8(request.body.clone()).unwrap();
    body.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

async fn ok_for(server: &MockServer, query: &str) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(query_param("query", query))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_full_batch_is_one_insert() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/"))
        .and(query_param("query", TRACES_INSERT))
        .and(header("content-type", "application/x-ndjson"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    for name in ["a", "b", "c"] {
        backend.send_trace(span(name)).await.unwrap();
    }
    assert_eq!(backend.pending().await, (0, 0, 0));

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(!body.ends_with('\n'));

    let rows = rows(&requests[0]);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["span_name"], "a");
    assert_eq!(rows[2]["span_name"], "c");
    assert_eq!(rows[0]["service_name"], "omni");
    assert_eq!(rows[0]["user_id"], "u-1");
    assert_eq!(rows[0]["status_code"], "OK");
}

#[tokio::test]
async fn test_basic_auth_header() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    ok_for(&server, TRACES_INSERT).await;

    let backend = backend(&server, &home, |c| {
        c.batch_size = 1;
        c.clickhouse.username = "writer".to_string();
        c.clickhouse.password = "secret".to_string();
    });
    backend.send_trace(span("a")).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let expected = format!("Basic {}", BASE64.encode("writer:secret"));
    assert_eq!(
        requests[0].headers.get("authorization").unwrap().to_str().unwrap(),
        expected
    );
}

#[tokio::test]
async fn test_partial_batch_waits_for_flush() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(query_param("query", TRACES_INSERT))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    backend.send_trace(span("a")).await.unwrap();
    backend.send_trace(span("b")).await.unwrap();
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(backend.pending().await, (2, 0, 0));

    backend.flush().await.unwrap();
    assert_eq!(backend.pending().await, (0, 0, 0));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(rows(&requests[0]).len(), 2);

    // Nothing left to send
    backend.flush().await.unwrap();
}

#[tokio::test]
async fn test_failed_batch_is_dropped() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |c| c.batch_size = 1);
    assert!(backend.send_trace(span("a")).await.is_err());
    assert_eq!(backend.pending().await, (0, 0, 0));
    assert!(backend.flush().await.is_ok());
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(query_param("query", TRACES_INSERT))
        .respond_with(ResponseTemplate::new(400).set_body_string("Unknown table"))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |c| {
        c.batch_size = 1;
        c.max_retries = 3;
    });
    let err = backend.send_trace(span("a")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Rejected { status: 400, .. }));
    assert_eq!(backend.pending().await, (0, 0, 0));
}

#[tokio::test]
async fn test_flush_attempts_every_table() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(query_param("query", METRICS_INSERT))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(query_param("query", TRACES_INSERT))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(query_param("query", LOGS_INSERT))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |c| c.batch_size = 10);
    backend.send_trace(span("a")).await.unwrap();
    backend
        .send_metric(MetricRecord::new("latency", 12.5))
        .await
        .unwrap();
    backend
        .send_log(LogRecord::new("hello", LogSeverity::Info))
        .await
        .unwrap();

    assert!(backend.flush().await.is_err());
    assert_eq!(backend.pending().await, (0, 0, 0));
}

#[tokio::test]
async fn test_metric_and_log_rows() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    ok_for(&server, METRICS_INSERT).await;
    ok_for(&server, LOGS_INSERT).await;

    let backend = backend(&server, &home, |c| c.batch_size = 1);
    backend
        .send_metric(
            MetricRecord::new("requests", 7.0)
                .with_type(MetricType::Counter)
                .with_unit("1"),
        )
        .await
        .unwrap();
    backend
        .send_log(
            LogRecord::new("boom", LogSeverity::Error)
                .with_trace_context("0af7651916cd43dd8448eb211c80319c", "b7ad6b7169203331"),
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    let metric = &rows(&requests[0])[0];
    assert_eq!(metric["metric_name"], "requests");
    assert_eq!(metric["metric_type"], "SUM");
    assert_eq!(metric["value_int"], 7);
    assert_eq!(metric["is_monotonic"], true);

    let log = &rows(&requests[1])[0];
    assert_eq!(log["body"], "boom");
    assert_eq!(log["severity_text"], "ERROR");
    assert_eq!(log["trace_id"], "0af7651916cd43dd8448eb211c80319c");
}

#[tokio::test]
async fn test_invalid_metric_is_not_buffered() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |c| c.batch_size = 1);
    assert!(backend
        .send_metric(MetricRecord::from_fields(None, Some(1.0)))
        .await
        .is_err());
    assert_eq!(backend.pending().await, (0, 0, 0));
}

#[tokio::test]
async fn test_large_insert_is_gzipped() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    ok_for(&server, TRACES_INSERT).await;

    let backend = backend(&server, &home, |c| c.compression_threshold = 128);
    for name in ["a", "b", "c"] {
        backend.send_trace(span(name)).await.unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        requests[0].headers.get("content-encoding").unwrap().to_str().unwrap(),
        "gzip"
    );
    let mut decoded = String::new();
    GzDecoder::new(requests[0].body.as_slice())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded.lines().count(), 3);
}
