//! Rate-limited HTTP access with retry classification and capped backoff.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy's retries are spent.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && is_retryable(&err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Refills one token per `refill_every`, up to `capacity`.
#[derive(Debug)]
struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new((config.capacity, Instant::now())),
        }
    }

    async fn take(&self) {
        let step = self.config.refill_every.max(Duration::from_millis(1));
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last_refill) = &mut *state;
                let refills = (last_refill.elapsed().as_millis() / step.as_millis()) as u32;
                if refills > 0 {
                    *tokens = tokens.saturating_add(refills).min(self.config.capacity);
                    *last_refill += step * refills;
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                step.saturating_sub(last_refill.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_service_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            per_service_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("cannot decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Inclusive byte range for a `Range` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn starting_at(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len.max(1) - 1,
        }
    }

    fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeChunk {
    pub body: Vec<u8>,
    /// Full resource size when the server reported it.
    pub total_len: Option<u64>,
    /// The server ignored the range and sent the whole resource.
    pub whole_resource: bool,
}

/// Parses the `/total` part of a `Content-Range` header (`bytes 0-99/1234`, `bytes */1234`).
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_service_limit: usize,
    per_service: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<TokenBucket>,
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
            per_service_limit: config.per_service_concurrency.max(1),
            per_service: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(TokenBucket::new),
        })
    }

    async fn admit(&self, service: &str) -> (OwnedSemaphorePermit, OwnedSemaphorePermit) {
        let service_limit = {
            let mut map = self.per_service.lock().await;
            map.entry(service.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_service_limit)))
                .clone()
        };
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        let scoped = service_limit
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        (global, scoped)
    }

    async fn send(
        &self,
        service: &str,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, FetchError> {
        let _permits = self.admit(service).await;
        let response = request.send().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        if status.is_success() || status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body: body.chars().take(512).collect(),
        })
    }

    /// Single authenticated GET decoded as JSON. Retries are left to the caller.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        service: &str,
        url: &str,
        query: &[(&str, String)],
        bearer: &str,
    ) -> Result<T, FetchError> {
        let span = tracing::info_span!("http_get_json", service, url);
        async {
            let request = self.client.get(url).query(query).bearer_auth(bearer);
            let response = self.send(service, url, request).await?;
            let bytes = response.bytes().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            debug!(bytes = bytes.len(), "response received");
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    /// Single form POST decoded as JSON (OAuth token exchange).
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        service: &str,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let request = self.client.post(url).form(form);
        let response = self.send(service, url, request).await?;
        let bytes = response.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Single authenticated `Range` GET for one chunk of a download.
    pub async fn get_range(
        &self,
        service: &str,
        url: &str,
        bearer: &str,
        range: ByteRange,
    ) -> Result<RangeChunk, FetchError> {
        let request = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .header(RANGE, range.header_value());
        let response = self.send(service, url, request).await?;
        let status = response.status();
        let content_range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(RangeChunk {
                body: Vec::new(),
                total_len: content_range_total.or(Some(range.start)),
                whole_resource: false,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?
            .to_vec();

        if status == StatusCode::PARTIAL_CONTENT {
            Ok(RangeChunk {
                body,
                total_len: content_range_total,
                whole_resource: false,
            })
        } else {
            let total = body.len() as u64;
            Ok(RangeChunk {
                body,
                total_len: Some(total),
                whole_resource: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn content_range_totals_are_parsed() {
        assert_eq!(parse_content_range_total("bytes 0-99/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes */50"), Some(50));
        assert_eq!(parse_content_range_total("bytes 0-99/*"), None);
        assert_eq!(ByteRange::starting_at(100, 50).header_value(), "bytes=100-149");
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_errors_and_after_budget() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry_with_backoff(&policy, |_: &String| true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicUsize::new(0);
        let result: Result<u8, String> = retry_with_backoff(&policy, |e: &String| e != "fatal", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err("fatal".to_string())
                } else {
                    Ok(1)
                }
            }
        })
        .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
