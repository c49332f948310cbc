//! Rate-limited, retrying HTTP client shared by provider adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};

/// 429 and 5xx answers are worth another attempt; other failures are final.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Seconds form of `Retry-After`; HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential from `base_delay`, or the provider's `Retry-After` when it
    /// sent one; capped at `max_delay` either way.
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        delay.min(self.max_delay)
    }
}

/// At most `requests` calls per `per`, per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub per: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub retry: RetryPolicy,
    /// Provider slug → request budget. Providers not listed are unthrottled.
    pub rate_limits: HashMap<String, RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 4,
            retry: RetryPolicy::default(),
            rate_limits: HashMap::new(),
        }
    }
}

/// Token bucket refilled in whole intervals.
#[derive(Debug)]
pub struct RequestBudget {
    limit: RateLimit,
    state: Mutex<(u32, Instant)>,
}

impl RequestBudget {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new((limit.requests, Instant::now())),
        }
    }

    /// Waits until a request may be sent.
    pub async fn acquire(&self) {
        let interval = self.limit.per.max(Duration::from_millis(1));
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last_refill) = &mut *state;
                let elapsed = last_refill.elapsed();
                if elapsed >= interval {
                    *tokens = self.limit.requests;
                    *last_refill = Instant::now();
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                interval.saturating_sub(elapsed)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Concurrency slot and request budget of one provider.
#[derive(Debug)]
struct ProviderGate {
    slots: Semaphore,
    budget: Option<RequestBudget>,
}

/// One GET against a provider API.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    /// Provider slug; concurrency and rate limits apply per scope.
    pub scope: &'a str,
    pub url: &'a str,
    pub bearer: Option<&'a str>,
    /// Extra request headers, for providers that do not take bearer tokens.
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider answered {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }

    /// 401/403: the connection's credentials were refused.
    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Semaphore,
    per_provider_concurrency: usize,
    rate_limits: HashMap<String, RateLimit>,
    gates: Mutex<HashMap<String, Arc<ProviderGate>>>,
    retry: RetryPolicy,
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
        let client = builder.build().context("building provider http client")?;

        Ok(Self {
            client,
            global: Semaphore::new(config.global_concurrency.max(1)),
            per_provider_concurrency: config.per_provider_concurrency.max(1),
            rate_limits: config.rate_limits,
            gates: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn gate(&self, scope: &str) -> Arc<ProviderGate> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(scope.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderGate {
                    slots: Semaphore::new(self.per_provider_concurrency),
                    budget: self.rate_limits.get(scope).copied().map(RequestBudget::new),
                })
            })
            .clone()
    }

    pub async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", provider = request.scope, url = request.url);
        self.fetch_inner(request).instrument(span).await
    }

    async fn fetch_inner(&self, request: FetchRequest<'_>) -> Result<FetchedResponse, FetchError> {
        // Neither semaphore is ever closed.
        let _global = self.global.acquire().await.ok();
        let gate = self.gate(request.scope).await;
        let _slot = gate.slots.acquire().await.ok();

        let mut attempt = 0usize;
        loop {
            if let Some(budget) = &gate.budget {
                budget.acquire().await;
            }

            let mut builder = self.client.get(request.url).query(&request.query);
            if let Some(token) = request.bearer {
                builder = builder.bearer_auth(token);
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let can_retry = attempt < self.retry.max_retries;
            match builder.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) if can_retry && is_retryable_status(resp.status()) => {
                    let delay = self.retry.delay(attempt, retry_after(resp.headers()));
                    tracing::debug!(status = resp.status().as_u16(), attempt, ?delay, "retrying provider request");
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => {
                    return Err(FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) if can_retry && is_retryable_error(&err) => {
                    let delay = self.retry.delay(attempt, None);
                    tracing::debug!(error = %err, attempt, ?delay, "retrying provider request");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(FetchError::Request(err)),
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn delays_grow_exponentially_and_honor_retry_after() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        };

        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(2, None), Duration::from_millis(400));
        assert_eq!(policy.delay(40, None), Duration::from_secs(2));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(1))), Duration::from_secs(1));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(90))), Duration::from_secs(2));
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));

        let refused = FetchError::HttpStatus {
            status: 403,
            url: "https://api.gusto.com/v1/companies".into(),
        };
        assert!(refused.is_auth());
    }

    #[tokio::test]
    async fn budget_hands_out_its_capacity_without_waiting() {
        let budget = RequestBudget::new(RateLimit {
            requests: 3,
            per: Duration::from_secs(60),
        });
        let started = Instant::now();
        for _ in 0..3 {
            budget.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn gates_are_shared_per_provider() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            rate_limits: HashMap::from([(
                "gusto".to_string(),
                RateLimit {
                    requests: 200,
                    per: Duration::from_secs(60),
                },
            )]),
            ..Default::default()
        })
        .unwrap();

        let gusto = fetcher.gate("gusto").await;
        assert!(Arc::ptr_eq(&gusto, &fetcher.gate("gusto").await));
        assert!(gusto.budget.is_some());
        assert!(fetcher.gate("deel").await.budget.is_none());
        assert_eq!(gusto.slots.available_permits(), 4);
    }
}
