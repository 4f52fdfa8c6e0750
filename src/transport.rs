//! Shared HTTP client with bounded exponential-backoff retry.
//!
//! Only transient network faults are retried. HTTP responses of any status are
//! handed back to the caller, which owns the protocol-specific handling
//! (rate limits, auth failures).

use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::TransportError;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            jitter_max: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_backoff(attempt) + Duration::from_millis(jitter)
    }
}

/// The last error of a retried operation and how many attempts were made.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub error: E,
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `max_attempts` attempts have been made. `op` receives the 1-based attempt.
pub async fn retry_transient<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    max_attempts: u32,
    is_transient: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !is_transient(&error) {
                    return Err(RetryError { attempts: attempt, error });
                }
                let delay = policy.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient network error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Connection resets, aborts, broken pipes and timeouts are worth retrying.
pub fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Fallback wait when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// How long to back off after a 429.
pub fn rate_limit_wait(headers: &HeaderMap) -> Duration {
    retry_after(headers).unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
}

/// Parse a `Retry-After` header given in (possibly fractional) seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub json: Option<serde_json::Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }
}

/// Pooled client shared by every poller, the webhook sender and the
/// slash-command responder. Cloning is cheap.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::build(
            config.http_timeout,
            config.http_max_connections,
            RetryPolicy::default(),
        )?)
    }

    pub fn build(
        timeout: Duration,
        max_connections: usize,
        policy: RetryPolicy,
    ) -> reqwest::Result<Self> {
        let max_connections = max_connections.max(1);
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .build()?;

        Ok(Self {
            client,
            policy,
            permits: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a request, retrying transient faults up to `max_attempts` times.
    /// Non-success statuses are returned as ordinary responses.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
        max_attempts: u32,
    ) -> Result<Response, TransportError> {
        retry_transient(&self.policy, max_attempts, is_transient, |attempt| {
            let builder = self.prepare(method.clone(), url, options);
            let permits = &self.permits;
            async move {
                // The semaphore is never closed, so acquisition only waits.
                let _permit = permits.acquire().await.ok();
                debug!(attempt, "Sending HTTP request");
                builder.send().await
            }
        })
        .await
        .map_err(|e| TransportError {
            attempts: e.attempts,
            source: e.error,
        })
    }

    fn prepare(&self, method: Method, url: &str, options: &RequestOptions) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .headers(options.headers.clone());
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(body) = &options.json {
            builder = builder.json(body);
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_stub, StubResponse};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeError {
        transient: bool,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake error (transient: {})", self.transient)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            jitter_max: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = policy();
        assert_eq!(policy.base_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(400));

        for attempt in 1..5 {
            let delay = policy.backoff(attempt);
            assert!(delay >= policy.base_backoff(attempt));
            assert!(delay <= policy.base_backoff(attempt) + policy.jitter_max);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_after_max_attempts() {
        let policy = policy();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retry_transient(
            &policy,
            4,
            |e: &FakeError| e.transient,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError { transient: true }) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // 100 + 200 + 400 ms of base backoff, plus at most 3 * 20 ms jitter.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(760), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(
            &policy(),
            5,
            |e: &FakeError| e.transient,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError { transient: false }) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let result = retry_transient(
            &policy(),
            3,
            |e: &FakeError| e.transient,
            |attempt| async move {
                if attempt < 3 {
                    Err(FakeError { transient: true })
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.25"));
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(250)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_rate_limit_wait_falls_back_to_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(rate_limit_wait(&headers), DEFAULT_RATE_LIMIT_WAIT);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("-3"));
        assert_eq!(rate_limit_wait(&headers), DEFAULT_RATE_LIMIT_WAIT);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(rate_limit_wait(&headers), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_http_error_status_is_returned_without_retry() {
        let stub = spawn_stub(vec![StubResponse::json(404, r#"{"message":"Unknown Channel"}"#)]).await;
        let transport =
            HttpTransport::build(Duration::from_secs(5), 4, policy()).unwrap();

        let response = transport
            .request(Method::GET, &stub.url("/missing"), &RequestOptions::new(), 3)
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(stub.request_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_exhausts_attempts() {
        // Bind then drop a listener so the port is known to be closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::build(
            Duration::from_secs(2),
            4,
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                jitter_max: Duration::ZERO,
            },
        )
        .unwrap();

        let err = transport
            .request(
                Method::GET,
                &format!("http://{}/", addr),
                &RequestOptions::new(),
                3,
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
    }
}
