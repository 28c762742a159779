//! Outbound REST access for the metadata providers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// Quota (429) and server-side failures are worth another attempt.
pub fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

/// Capped exponential backoff between attempts of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub retries: usize,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (zero-based).
    pub fn delay(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.initial
            .saturating_mul(1u32 << doublings)
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_provider_concurrency: 1,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Burst of `rate` requests, refilled one at a time over each second.
    pub fn per_second(rate: u32) -> Option<Self> {
        if rate == 0 {
            return None;
        }
        Some(Self {
            capacity: rate,
            refill_every: Duration::from_secs(1) / rate,
        })
    }
}

/// Request pacing shared by every call through one fetcher.
#[derive(Debug)]
struct RateLimiter {
    config: TokenBucketConfig,
    bucket: Mutex<(u32, Instant)>,
}

impl RateLimiter {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new((config.capacity, Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.bucket.lock().await;
                let (tokens, refilled_at) = &mut *guard;
                let interval = self.config.refill_every.max(Duration::from_millis(1));
                let earned = (refilled_at.elapsed().as_nanos() / interval.as_nanos()) as u32;
                if earned > 0 {
                    *tokens = tokens.saturating_add(earned).min(self.config.capacity);
                    *refilled_at += interval * earned;
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                interval.saturating_sub(refilled_at.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// GET request description: URL, query pairs and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub elapsed: Duration,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
        elapsed: Duration,
    },
    #[error("http fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One attempt either settles the request or asks for another try.
enum Attempt {
    Settled(Result<FetchedResponse, FetchError>),
    Retry(FetchError),
}

/// Shared REST client: bounded concurrency overall and per provider, optional
/// rate limit, and retries on 429, 5xx, connect and timeout failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    total: Arc<Semaphore>,
    per_provider_permits: usize,
    providers: StdMutex<HashMap<String, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            total: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_permits: config.per_provider_concurrency.max(1),
            providers: StdMutex::new(HashMap::new()),
            limiter: config.token_bucket.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    fn provider_slots(&self, provider: &str) -> Arc<Semaphore> {
        let mut providers = self
            .providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            providers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_permits))),
        )
    }

    async fn permits(&self, provider: &str) -> Result<[OwnedSemaphorePermit; 2], FetchError> {
        let total = Arc::clone(&self.total)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let own = self
            .provider_slots(provider)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        Ok([total, own])
    }

    pub async fn get(
        &self,
        provider: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", provider, url = %request.url);
        async {
            let _permits = self.permits(provider).await?;
            let started = Instant::now();
            let mut retry = 0usize;
            loop {
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
                match self.attempt(request, started, retry + 1).await {
                    Attempt::Settled(result) => return result,
                    Attempt::Retry(err) if retry < self.backoff.retries => {
                        let wait = self.backoff.delay(retry);
                        debug!(error = %err, retry, ?wait, "retrying request");
                        tokio::time::sleep(wait).await;
                        retry += 1;
                    }
                    Attempt::Retry(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, request: &HttpRequest, started: Instant, attempts: usize) -> Attempt {
        let builder = request
            .headers
            .iter()
            .fold(self.client.get(&request.url).query(&request.query), |b, (k, v)| {
                b.header(k.as_str(), v.as_str())
            });

        let response = match builder.send().await {
            Ok(response) => response,
            Err(source) => {
                let retryable = retryable_transport(&source);
                let err = FetchError::Request {
                    url: request.url.clone(),
                    attempts,
                    source,
                };
                return if retryable {
                    Attempt::Retry(err)
                } else {
                    Attempt::Settled(Err(err))
                };
            }
        };

        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
                elapsed: started.elapsed(),
            };
            return if retryable_status(status) {
                Attempt::Retry(err)
            } else {
                Attempt::Settled(Err(err))
            };
        }

        Attempt::Settled(match response.bytes().await {
            Ok(body) => Ok(FetchedResponse {
                status,
                body: body.to_vec(),
                elapsed: started.elapsed(),
                attempts,
            }),
            Err(source) => Err(FetchError::Request {
                url,
                attempts,
                source,
            }),
        })
    }
}
