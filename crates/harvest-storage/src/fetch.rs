use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

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
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff. Shared by the fetcher and the pipeline's retry loop.
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
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity, Instant::now())),
        }
    }

    async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = &mut *state;
            let elapsed = last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                *tokens = tokens.saturating_add(refills).min(self.capacity);
                *last_refill = Instant::now();
            }
            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

/// GET-only HTML fetcher with a global concurrency cap, optional token bucket and
/// retry of transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket: config.token_bucket.map(|c| Arc::new(TokenBucket::new(c))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            let err = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.text().await?;
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (classify_status(status), err)
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            match err {
                (RetryDisposition::Retryable, err) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
        assert_eq!(BackoffPolicy::none().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_without_waiting() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 3,
            refill_every: Duration::from_secs(60),
        });
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
