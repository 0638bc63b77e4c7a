//! OTLP backend against a fake collector

use automagik_telemetry::config::EnvOverrides;
use automagik_telemetry::events::attributes;
use automagik_telemetry::otlp::{SpanRecord, TracePayload};
use automagik_telemetry::{
    DeliveryError, LogRecord, LogSeverity, MetricRecord, MetricType, OtlpBackend,
    TelemetryBackend, TelemetryConfig,
};
use chrono::DateTime;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(
    server: &MockServer,
    home: &TempDir,
    tweak: impl FnOnce(&mut TelemetryConfig),
) -> OtlpBackend {
    let mut config = TelemetryConfig {
        endpoint: Some(server.uri()),
        enabled: Some(true),
        timeout_secs: Some(5),
        max_retries: 3,
        retry_backoff_base_secs: 0.0,
        home_dir: Some(home.path().to_path_buf()),
        ..TelemetryConfig::new("omni", "1.0.0")
    };
    tweak(&mut config);
    let resolved = config.resolve_with(&EnvOverrides::default()).unwrap();
    OtlpBackend::from_config(&resolved).unwrap()
}

fn span(name: &str) -> TracePayload {
    TracePayload::from(SpanRecord {
        name: name.to_string(),
        trace_id: "0af7651916cd43dd8448eb211c80319c".to_string(),
        span_id: "b7ad6b7169203331".to_string(),
        start: DateTime::from_timestamp(1_700_000_000, 0),
        end: DateTime::from_timestamp(1_700_000_001, 0),
        attributes: attributes([("k", "v")]),
        ..SpanRecord::default()
    })
}

#[tokio::test]
async fn test_success_is_a_single_post() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/traces"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    backend.send_trace(span("test.event")).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let sent = &body["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
    assert_eq!(sent["name"], "test.event");
    assert_eq!(sent["attributes"][0]["value"]["stringValue"], "v");
}

#[tokio::test]
async fn test_server_errors_are_retried_max_retries_plus_one_times() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/traces"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |c| c.max_retries = 3);
    let err = backend.send_trace(span("test.event")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::ServerError { status: 500 }));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    let err = backend.send_trace(span("test.event")).await.unwrap_err();
    match err {
        DeliveryError::Rejected { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad payload");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    assert!(backend.send_trace(span("test.event")).await.is_ok());
}

#[tokio::test]
async fn test_large_payload_is_gzipped() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |c| c.compression_threshold = 64);
    let payload = span("test.event");
    let expected = serde_json::to_vec(&payload.clone().into_traces_data()).unwrap();
    assert!(expected.len() >= 64);
    backend.send_trace(payload).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    assert_eq!(
        request.headers.get("content-encoding").unwrap().to_str().unwrap(),
        "gzip"
    );

    let mut decoded = Vec::new();
    GzDecoder::new(request.body.as_slice())
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, expected);
}

#[tokio::test]
async fn test_small_payload_is_sent_plain() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |c| c.compression_threshold = 1_000_000);
    backend.send_trace(span("test.event")).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("content-encoding").is_none());
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body["resourceSpans"].is_array());
}

#[tokio::test]
async fn test_metrics_and_logs_use_their_own_endpoints() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/metrics"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/logs"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    backend
        .send_metric(MetricRecord::new("requests", 3.0).with_type(MetricType::Counter))
        .await
        .unwrap();
    backend
        .send_log(LogRecord::new("", LogSeverity::Warn))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let metrics: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let metric = &metrics["resourceMetrics"][0]["scopeMetrics"][0];
    assert_eq!(metric["scope"]["name"], "omni.telemetry");
    assert_eq!(metric["metrics"][0]["sum"]["isMonotonic"], true);

    let logs: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let log = &logs["resourceLogs"][0]["scopeLogs"][0]["logRecords"][0];
    assert_eq!(log["severityText"], "WARN");
    assert_eq!(log["body"]["stringValue"], "");
}

#[tokio::test]
async fn test_invalid_metric_never_reaches_the_network() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    let err = backend
        .send_metric(MetricRecord::from_fields(Some("no_value"), None))
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Validation { .. }));
}

#[tokio::test]
async fn test_flush_is_a_no_op() {
    let server = MockServer::start().await;
    let home = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let backend = backend(&server, &home, |_| {});
    assert!(backend.flush().await.is_ok());
    assert!(backend.flush().await.is_ok());
}

#[tokio::test]
async fn test_unreachable_collector_is_a_network_error() {
    let home = TempDir::new().unwrap();
    let config = TelemetryConfig {
        endpoint: Some("http://127.0.0.1:1".to_string()),
        max_retries: 1,
        retry_backoff_base_secs: 0.0,
        home_dir: Some(home.path().to_path_buf()),
        ..TelemetryConfig::new("omni", "1.0.0")
    };
    let resolved = config.resolve_with(&EnvOverrides::default()).unwrap();
    let backend = OtlpBackend::from_config(&resolved).unwrap();

    let err = backend.send_trace(span("test.event")).await.unwrap_err();
    assert!(err.is_retryable());
}
