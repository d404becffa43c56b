use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{BackupOutcome, CacheError, EmbeddingCache};
use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::shutdown::Shutdown;

/// Resources owned by the orchestrator and handed to workers as `Arc` handles.
#[derive(Clone)]
pub struct PipelineState {
    cache: Arc<EmbeddingCache>,
    limiter: Arc<RateLimiter>,
    config: Arc<Config>,
    shutdown: Shutdown,
    started_at: Instant,
    cache_flushed: Arc<AtomicBool>,
}

impl PipelineState {
    pub async fn new(config: &Config, shutdown: Shutdown) -> Self {
        let cache = Arc::new(EmbeddingCache::open(config.cache.cache_file.clone()).await);
        Self {
            cache,
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            config: Arc::new(config.clone()),
            shutdown,
            started_at: Instant::now(),
            cache_flushed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Final snapshot on shutdown. Later calls return `Ok(None)` without writing.
    pub async fn flush_cache_once(&self) -> Result<Option<BackupOutcome>, CacheError> {
        if self
            .cache_flushed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Cache already flushed");
            return Ok(None);
        }

        let outcome = self.cache.backup_to_disk().await?;
        if let BackupOutcome::Written { entries } = outcome {
            tracing::info!(entries, "Final cache snapshot written");
        }
        Ok(Some(outcome))
    }
}
