use std::sync::Arc;

use chrono::Utc;
use tokio_cron_scheduler::JobSchedulerError;
use uuid::Uuid;

use crate::aggregate::{PuzzleOutput, ResultAggregator};
use crate::config::{Config, EmbeddingBackend};
use crate::input::{self, InputError};
use crate::output::{self, OutputError, OutputPaths, RunMetadata, RunSummary};
use crate::services::{
    EmbeddingProvider, GeminiProvider, ProviderError, RetryPolicy, RetryingProvider, VectorIndex,
    VectorIndexError, VectorIndexProvider,
};
use crate::shutdown::Shutdown;
use crate::state::PipelineState;
use crate::task::TaskGenerator;
use crate::workers::cache_backup::CacheBackupScheduler;
use crate::workers::{ProviderFactory, TaskProcessor};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("no themes to process")]
    NoThemes,
    #[error("vector index error: {0}")]
    VectorIndex(#[from] VectorIndexError),
    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error("output error: {0}")]
    Output(#[from] OutputError),
    #[error("background task failed: {0}")]
    Join(String),
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub summary: RunSummary,
    pub output: PuzzleOutput,
    pub paths: OutputPaths,
}

pub struct Pipeline {
    state: PipelineState,
}

impl Pipeline {
    pub async fn new(config: &Config, shutdown: Shutdown) -> Self {
        Self {
            state: PipelineState::new(config, shutdown).await,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Provider factory for the configured backend. Every handle goes
    /// through the shared limiter and retry policy.
    pub async fn provider_factory(&self) -> Result<ProviderFactory, PipelineError> {
        let cfg = self.state.config().embedding.clone();
        let limiter = self.state.limiter().clone();
        let policy = RetryPolicy::from_config(&cfg);

        match cfg.backend {
            EmbeddingBackend::Gemini => {
                // 启动前先构建一次，尽早暴露客户端配置错误
                GeminiProvider::new(&cfg)?;
                let factory: ProviderFactory = Arc::new(
                    move |worker_id: usize| -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
                        let inner: Arc<dyn EmbeddingProvider> = Arc::new(GeminiProvider::new(&cfg)?);
                        tracing::debug!(worker = worker_id, "Gemini provider ready");
                        let provider: Arc<dyn EmbeddingProvider> =
                            Arc::new(RetryingProvider::new(inner, limiter.clone(), policy.clone()));
                        Ok(provider)
                    },
                );
                Ok(factory)
            }
            EmbeddingBackend::VectorIndex => {
                let (index_path, vocab_path) =
                    (cfg.vector_index_path.clone(), cfg.vector_vocab_path.clone());
                let index = tokio::task::spawn_blocking(move || {
                    VectorIndex::load(&index_path, &vocab_path)
                })
                .await
                .map_err(|e| PipelineError::Join(e.to_string()))??;

                if index.dimension() != cfg.dimension {
                    return Err(ProviderError::DimensionMismatch {
                        expected: cfg.dimension,
                        actual: index.dimension(),
                    }
                    .into());
                }

                let index = Arc::new(index);
                let factory: ProviderFactory = Arc::new(
                    move |_worker_id: usize| -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
                        let inner: Arc<dyn EmbeddingProvider> =
                            Arc::new(VectorIndexProvider::new(index.clone()));
                        let provider: Arc<dyn EmbeddingProvider> =
                            Arc::new(RetryingProvider::new(inner, limiter.clone(), policy.clone()));
                        Ok(provider)
                    },
                );
                Ok(factory)
            }
        }
    }

    /// Load inputs, process every task, aggregate and write outputs.
    /// `run_summary.json` is written whenever processing started.
    pub async fn run(&self, factory: ProviderFactory) -> Result<PipelineOutcome, PipelineError> {
        let config = self.state.config().clone();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(%run_id, "Pipeline started");

        let themes = input::load_themes(&config.paths.themes_file).await?;
        let candidates = input::load_candidates(&config.paths.candidates_file).await?;
        if themes.is_empty() {
            return Err(PipelineError::NoThemes);
        }

        let mut plan = TaskGenerator::create_tasks_for_puzzles(
            &themes,
            &candidates,
            config.puzzle.themes_per_puzzle,
            config.puzzle.total_puzzle_count,
        );
        let tasks = std::mem::take(&mut plan.tasks);

        let backup = if config.cache.backup_interval.is_zero() {
            None
        } else {
            Some(
                CacheBackupScheduler::start(
                    self.state.cache().clone(),
                    config.cache.backup_interval,
                )
                .await?,
            )
        };

        let processor = TaskProcessor::new(
            &config.worker,
            config.puzzle.words_per_theme,
            self.state.cache().clone(),
            factory,
            self.state.shutdown().clone(),
        );
        let report = processor.run(tasks).await;

        if let Some(backup) = backup {
            backup.shutdown().await;
        }
        if let Err(e) = self.state.flush_cache_once().await {
            tracing::error!(error = %e, "Final cache snapshot failed");
        }

        let aggregation = ResultAggregator::new(&config.puzzle).aggregate(&report.results, &plan);
        let paths = OutputPaths::new(&config.paths.output_dir);
        let mut output_files = Vec::new();

        let metadata = RunMetadata {
            run_id,
            generated_at: Utc::now(),
            embedding_backend: format!("{:?}", config.embedding.backend),
            model_id: config.embedding.model_id.clone(),
            embedding_dimension: config.embedding.dimension,
            aggregation: aggregation.output.metadata.clone(),
            processing: report.stats.clone(),
            workers: report.worker_stats.clone(),
            cache: self.state.cache().stats().await,
            rate_limiter: self.state.limiter().stats().await,
        };

        let writes = [
            (paths.puzzles.clone(), output::write_json(&paths.puzzles, &aggregation.output)),
            (paths.metadata.clone(), output::write_json(&paths.metadata, &metadata)),
            (
                paths.embeddings.clone(),
                output::embeddings_csv(&aggregation.embedding_rows)
                    .and_then(|bytes| output::write_atomic(&paths.embeddings, &bytes)),
            ),
        ];
        for (path, result) in writes {
            match result {
                Ok(()) => output_files.push(path.display().to_string()),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to write output"),
            }
        }

        let out = &aggregation.output;
        let summary = RunSummary {
            run_id,
            status: RunSummary::status_for(out.puzzles.len(), config.puzzle.total_puzzle_count),
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: self.state.uptime_secs(),
            interrupted: report.interrupted,
            fatal_error: report.fatal_error.as_ref().map(ToString::to_string),
            total_tasks: report.stats.total_tasks,
            successful_tasks: report.stats.successful_tasks,
            failed_tasks: report.stats.failed_tasks,
            cancelled_tasks: report.stats.cancelled_tasks,
            planned_puzzles: config.puzzle.total_puzzle_count,
            successful_puzzles: out.puzzles.len(),
            failed_puzzles: out.failed_puzzles.len(),
            output_files,
        };
        output::write_json(&paths.summary, &summary)?;

        tracing::info!(
            %run_id,
            status = ?summary.status,
            puzzles = summary.successful_puzzles,
            failed_puzzles = summary.failed_puzzles,
            "Pipeline finished"
        );

        Ok(PipelineOutcome {
            summary,
            output: aggregation.output,
            paths,
        })
    }
}
