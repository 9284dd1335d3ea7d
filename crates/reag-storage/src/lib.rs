//! Acquisition plumbing (streaming + rendered fetch, retry) and fingerprint stores for REAG.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod browser;
mod fingerprint;
mod postgres;

pub use browser::{BrowserConfig, BrowserFetcher};
pub use fingerprint::{fingerprint_digest, FingerprintStore, MemoryFingerprintStore, StoreError};
pub use postgres::PgFingerprintStore;

pub const CRATE_NAME: &str = "reag-storage";

const BODY_CLOSE_MARKER: &[u8] = b"</body>";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {after:?} fetching {url}")]
    Timeout { url: String, after: Duration },
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("rendered fetch unavailable for {url} (built without the `browser` feature)")]
    RenderingUnavailable { url: String },
    #[error("no listing URL configured for {source_id}")]
    NoCandidateUrl { source_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors the retry wrapper knows how to classify.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Timeout { .. } | FetchError::Navigation { .. } => RetryDisposition::Retryable,
            FetchError::NoCandidateUrl { .. } | FetchError::RenderingUnavailable { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with linear backoff: the wait after failed attempt `k` is `base_delay * k`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Upper bound on wall-clock time spent by one source's acquisition.
    pub fn worst_case(&self, per_attempt_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|k| self.delay_after_attempt(k)).sum();
        backoff + per_attempt_timeout.saturating_mul(attempts)
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the policy is exhausted.
/// `op` receives the 1-indexed attempt number. The last error is returned on exhaustion.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.disposition() == RetryDisposition::NonRetryable {
                    warn!(label, attempt, error = %err, "non-retryable failure");
                    return Err(err);
                }
                if attempt >= max_attempts {
                    warn!(label, attempt, error = %err, "retries exhausted");
                    return Err(err);
                }
                let delay = policy.delay_after_attempt(attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub max_body_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub status: u16,
    pub final_url: String,
    pub body: String,
    /// True when reading stopped at the byte cap rather than the closing body marker.
    pub truncated: bool,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            timeout: config.timeout,
            max_body_bytes: config.max_body_bytes.max(1),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Single GET attempt that reads the body incrementally and stops at the byte cap or
    /// once `</body>` has been seen.
    pub async fn fetch_partial(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedDocument, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let _permit = self
                .global_limit
                .acquire()
                .await
                .expect("semaphore not closed");

            let mut resp = self.client.get(url).send().await.map_err(|err| self.map_err(url, err))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let mut buf: Vec<u8> = Vec::new();
            let mut truncated = false;
            while let Some(chunk) = resp.chunk().await.map_err(|err| self.map_err(url, err))? {
                let scan_from = buf.len().saturating_sub(BODY_CLOSE_MARKER.len() - 1);
                buf.extend_from_slice(&chunk);
                let capped = buf.len() >= self.max_body_bytes;
                if capped {
                    buf.truncate(self.max_body_bytes);
                }
                if let Some(pos) = find_ascii_ci(&buf[scan_from..], BODY_CLOSE_MARKER) {
                    buf.truncate(scan_from + pos + BODY_CLOSE_MARKER.len());
                    break;
                }
                if capped {
                    truncated = true;
                    break;
                }
            }
            debug!(bytes = buf.len(), truncated, "read partial body");

            Ok(FetchedDocument {
                status: status.as_u16(),
                final_url,
                body: String::from_utf8_lossy(&buf).into_owned(),
                truncated,
            })
        }
        .instrument(span)
        .await
    }

    fn map_err(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Request(err)
        }
    }
}

fn find_ascii_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug)]
    struct FlakyError(RetryDisposition);

    impl std::fmt::Display for FlakyError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky ({:?})", self.0)
        }
    }

    impl Retryable for FlakyError {
        fn disposition(&self) -> RetryDisposition {
            self.0
        }
    }

    async fn serve_once(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 1024];
            let _ = sock.read(&mut req).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = sock.write_all(head.as_bytes()).await;
            let _ = sock.write_all(body.as_bytes()).await;
            let _ = sock.shutdown().await;
        });
        format!("http://{addr}/listing")
    }

    #[test]
    fn backoff_is_linear_in_attempt_number() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn worst_case_bounds_backoff_plus_timeouts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        };
        // 1s + 2s of backoff, three 10s attempts.
        assert_eq!(policy.worst_case(Duration::from_secs(10)), Duration::from_secs(33));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        };
        let started = tokio::time::Instant::now();
        let attempt_offsets = std::sync::Mutex::new(Vec::new());
        let out = with_retry(&policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            attempt_offsets.lock().unwrap().push(started.elapsed());
            async move {
                if attempt < 3 {
                    Err(FlakyError(RetryDisposition::Retryable))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // base*1 before the second attempt, base*2 before the third.
        assert_eq!(
            *attempt_offsets.lock().unwrap(),
            vec![Duration::ZERO, Duration::from_millis(10), Duration::from_millis(30)]
        );
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
        };
        let started = tokio::time::Instant::now();
        let out: Result<(), FlakyError> = with_retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FlakyError(RetryDisposition::Retryable)) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // No sleep after the final attempt.
        assert_eq!(started.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let out: Result<(), FlakyError> = with_retry(&RetryPolicy::default(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FlakyError(RetryDisposition::NonRetryable)) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn rendering_unavailable_is_not_retried() {
        let err = FetchError::RenderingUnavailable {
            url: "https://example.com".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.com".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        let err = FetchError::HttpStatus {
            status: 404,
            url: "https://example.com".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn body_marker_search_ignores_case() {
        assert_eq!(find_ascii_ci(b"<p>x</p></BODY></html>", BODY_CLOSE_MARKER), Some(8));
        assert_eq!(find_ascii_ci(b"<p>x</p>", BODY_CLOSE_MARKER), None);
    }

    #[tokio::test]
    async fn streaming_fetch_stops_at_closing_body_marker() {
        let body = format!("<html><body><p>listing</p></body>{}</html>", "x".repeat(4096));
        let url = serve_once(body).await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let doc = fetcher.fetch_partial(Uuid::new_v4(), "test", &url).await.unwrap();
        assert!(doc.body.ends_with("</body>"));
        assert!(!doc.truncated);
        assert_eq!(doc.status, 200);
    }

    #[tokio::test]
    async fn streaming_fetch_stops_at_byte_cap() {
        let body = format!("<html><body>{}</body></html>", "y".repeat(64 * 1024));
        let url = serve_once(body).await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            max_body_bytes: 1024,
            ..Default::default()
        })
        .unwrap();
        let doc = fetcher.fetch_partial(Uuid::new_v4(), "test", &url).await.unwrap();
        assert_eq!(doc.body.len(), 1024);
        assert!(doc.truncated);
    }
}
