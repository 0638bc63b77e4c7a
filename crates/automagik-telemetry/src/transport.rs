//! HTTP delivery with compression and retry
//!
//! Both network backends funnel through [`HttpTransport::post`]: one body,
//! gzip when it is large enough, up to `max_retries + 1` attempts with
//! exponential backoff between them. 5xx answers, timeouts and connection
//! failures are retried; every other non-2xx status is final.

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Response, Url};
use std::io::Write;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{ConfigError, DeliveryError, DeliveryResult};

/// Exponential backoff: `backoff_base * 2^attempt` between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    /// Total attempts, including the first
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the zero-based `attempt` failed
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    pub threshold: usize,
}

impl CompressionPolicy {
    pub fn should_compress(&self, len: usize) -> bool {
        self.enabled && len >= self.threshold
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 1024,
        }
    }
}

/// Gzip a payload
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// One logical delivery: retried as a unit
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub url: Url,
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub authorization: Option<String>,
    /// Signal name for log lines (`traces`, `metrics`, `logs`)
    pub signal: &'static str,
}

impl OutgoingRequest {
    pub fn json(url: Url, body: Vec<u8>, signal: &'static str) -> Self {
        Self {
            url,
            body,
            content_type: "application/json",
            authorization: None,
            signal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
    retry: RetryPolicy,
    compression: CompressionPolicy,
    verbose: bool,
}

impl HttpTransport {
    pub fn new(
        timeout: Duration,
        retry: RetryPolicy,
        compression: CompressionPolicy,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("automagik-telemetry-rust/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            client,
            timeout,
            retry,
            compression,
            verbose,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Deliver a request, retrying transient failures
    pub async fn post(&self, request: OutgoingRequest) -> DeliveryResult {
        let original_len = request.body.len();
        let compressed = self.compression.should_compress(original_len);
        let body = if compressed {
            gzip(&request.body)?
        } else {
            request.body
        };

        if self.verbose {
            info!(
                signal = request.signal,
                url = %request.url,
                bytes = original_len,
                wire_bytes = body.len(),
                compressed,
                "sending telemetry payload"
            );
        }

        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            let result = self
                .send_attempt(
                    &request.url,
                    &body,
                    request.content_type,
                    request.authorization.as_deref(),
                    compressed,
                )
                .await;

            let err = match result {
                Ok(()) => {
                    debug!(signal = request.signal, attempt = attempt + 1, "telemetry delivered");
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(signal = request.signal, "telemetry rejected, not retrying: {}", err);
                return Err(err);
            }

            attempt += 1;
            if attempt >= attempts {
                debug!(
                    signal = request.signal,
                    "telemetry delivery failed after {} attempts: {}",
                    attempts,
                    err
                );
                return Err(err);
            }

            let backoff = self.retry.backoff_for(attempt - 1);
            debug!(
                signal = request.signal,
                "telemetry attempt {} failed, retrying in {:?}: {}",
                attempt,
                backoff,
                err
            );
            sleep(backoff).await;
        }
    }

    async fn send_attempt(
        &self,
        url: &Url,
        body: &[u8],
        content_type: &'static str,
        authorization: Option<&str>,
        compressed: bool,
    ) -> DeliveryResult {
        let mut builder = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(body.to_vec());
        if compressed {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(auth) = authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::Network(e)
            }
        })?;

        Self::handle_response(response).await
    }

    async fn handle_response(response: Response) -> DeliveryResult {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_server_error() {
            return Err(DeliveryError::ServerError {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body: crate::events::truncate(&body, crate::events::MAX_STRING_LEN),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1));
        assert_eq!(policy.attempts(), u32::MAX);
        assert!(policy.backoff_for(64) >= Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn test_compression_threshold_is_inclusive() {
        let policy = CompressionPolicy {
            enabled: true,
            threshold: 10,
        };
        assert!(!policy.should_compress(9));
        assert!(policy.should_compress(10));

        let off = CompressionPolicy {
            enabled: false,
            threshold: 0,
        };
        assert!(!off.should_compress(1_000_000));
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = br#"{"resourceSpans":[]}"#.repeat(100);
        let compressed = gzip(&data).unwrap();
        assert!(compressed.len() < data.len());

        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }
}
