use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use puzzle_forge::rate_limit::RateLimiter;
use puzzle_forge::services::{
    EmbeddingBatch, EmbeddingProvider, ProviderError, RetryPolicy, RetryingProvider,
};
use puzzle_forge::workers::ProviderFactory;

pub const DIMENSION: usize = 8;

/// Theme `t{i}` points along axis `i % 8`; candidate `t{i}w{k}` tilts away
/// from it as `k` grows, so the expected ranking is w1, w2, ...
pub fn synthetic_vector(text: &str) -> Option<Vec<f32>> {
    let rest = text.strip_prefix('t')?;
    let (theme, tilt) = match rest.split_once('w') {
        Some((t, k)) => (t.parse::<usize>().ok()?, k.parse::<f32>().ok()? * 0.15),
        None => (rest.parse::<usize>().ok()?, 0.0),
    };
    let mut v = vec![0.0; DIMENSION];
    v[theme % DIMENSION] = 1.0;
    v[(theme + 1) % DIMENSION] += tilt;
    Some(v)
}

/// Remote-looking fake backend that counts calls and can simulate latency.
pub struct SyntheticProvider {
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl SyntheticProvider {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| synthetic_vector(t)).collect())
    }
}

/// Backend whose credentials are always rejected.
pub struct RejectingProvider;

#[async_trait]
impl EmbeddingProvider for RejectingProvider {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    async fn embed(&self, _texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        Err(ProviderError::Auth("API key not valid".to_string()))
    }
}

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
    }
}

/// Every worker shares `inner` behind the pipeline's limiter.
pub fn shared_factory(inner: Arc<dyn EmbeddingProvider>, limiter: Arc<RateLimiter>) -> ProviderFactory {
    Arc::new(
        move |_: usize| -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
            let provider: Arc<dyn EmbeddingProvider> = Arc::new(RetryingProvider::new(
                inner.clone(),
                limiter.clone(),
                retry_policy(),
            ));
            Ok(provider)
        },
    )
}
