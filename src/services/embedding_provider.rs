use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::EmbeddingConfig;
use crate::rate_limit::RateLimiter;

/// One slot per input text; `None` means the backend has no vector for it.
pub type EmbeddingBatch = Vec<Option<Vec<f32>>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("embedding network error: {0}")]
    Network(String),
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding api error: status={status}, message={message}")]
    Api { status: u16, message: String },
    #[error("embedding api rejected credentials: {0}")]
    Auth(String),
    #[error("embedding api quota exceeded: {0}")]
    Quota(String),
    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl ProviderError {
    /// Network-class failures worth another attempt. Everything else points
    /// at configuration and is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Remote backends go through the shared rate limiter.
    fn is_remote(&self) -> bool {
        true
    }

    /// Largest batch a single round trip accepts.
    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
        }
    }

    /// `base * 2^attempt` plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Wraps a backend with rate limiting, retry/backoff and response validation.
pub struct RetryingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    requests_sent: AtomicU64,
    retries: AtomicU64,
}

impl RetryingProvider {
    pub fn new(
        inner: Arc<dyn EmbeddingProvider>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            limiter,
            policy,
            requests_sent: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Network round trips issued, including retries.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    async fn call_once(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        if self.inner.is_remote() {
            self.requests_sent.fetch_add(1, Ordering::Relaxed);
            self.limiter.scoped(|| self.inner.embed(texts)).await
        } else {
            self.inner.embed(texts).await
        }
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        let attempts = self.policy.max_retries.max(1);

        for attempt in 0..attempts {
            match self.call_once(texts).await {
                Ok(batch) => return validate_batch(batch, texts.len(), self.inner.dimension()),
                Err(e) if e.is_transient() => {
                    if attempt + 1 >= attempts {
                        tracing::error!(
                            provider = self.inner.name(),
                            attempts,
                            error = %e,
                            "Embedding request failed after all retries"
                        );
                        return Err(ProviderError::RetriesExhausted {
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.policy.delay_for(attempt);
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient embedding error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(provider = self.inner.name(), error = %e, "Non-retryable embedding error");
                    return Err(e);
                }
            }
        }

        // attempts >= 1, the loop always returns
        Err(ProviderError::RetriesExhausted {
            attempts,
            last_error: "no attempt made".to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn is_remote(&self) -> bool {
        self.inner.is_remote()
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = self.inner.max_batch_size().max(1);
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(chunk_size) {
            out.extend(self.embed_chunk(chunk).await?);
        }
        Ok(out)
    }
}

fn validate_batch(
    batch: EmbeddingBatch,
    expected_len: usize,
    dimension: usize,
) -> Result<EmbeddingBatch, ProviderError> {
    if batch.len() != expected_len {
        return Err(ProviderError::MalformedResponse(format!(
            "expected {expected_len} embeddings, got {}",
            batch.len()
        )));
    }
    for vector in batch.iter().flatten() {
        if vector.len() != dimension {
            return Err(ProviderError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
    }
    Ok(batch)
}
