use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::cache::{EmbeddingCache, EntryMetadata, WordType};
use crate::dedupe::dedupe_candidates;
use crate::services::{EmbeddingProvider, ProviderError};
use crate::similarity::cosine_similarity;
use crate::task::{TaskStage, ThemeProcessingResult, ThemeProcessingTask};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub worker_id: usize,
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub api_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub duplicates_skipped: u64,
    pub total_processing_secs: f64,
}

impl WorkerStats {
    pub fn avg_processing_secs(&self) -> f64 {
        if self.tasks_processed == 0 {
            0.0
        } else {
            self.total_processing_secs / self.tasks_processed as f64
        }
    }

    pub(crate) fn record(&mut self, result: &ThemeProcessingResult) {
        self.tasks_processed += 1;
        if result.success {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.api_calls += result.api_calls_made as u64;
        self.cache_hits += result.cache_hits as u64;
        self.cache_misses += result.cache_misses as u64;
        self.duplicates_skipped += result.duplicates_skipped as u64;
        self.total_processing_secs += result.processing_time_secs;
    }
}

struct Scored {
    word: String,
    embedding: Vec<f32>,
    similarity: f32,
}

/// Per-worker context: owns its provider handle and counters, shares the cache.
pub struct ThemeWorker {
    worker_id: usize,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    words_per_theme: usize,
    stage: TaskStage,
    stats: WorkerStats,
}

impl ThemeWorker {
    pub fn new(
        worker_id: usize,
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        words_per_theme: usize,
    ) -> Self {
        Self {
            worker_id,
            provider,
            cache,
            words_per_theme,
            stage: TaskStage::Received,
            stats: WorkerStats {
                worker_id,
                ..WorkerStats::default()
            },
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stage reached by the current or most recent task.
    pub fn stage(&self) -> TaskStage {
        self.stage
    }

    /// Count a result produced outside `process_task`, e.g. a task timeout.
    pub fn record_external(&mut self, result: &ThemeProcessingResult) {
        self.stats.record(result);
    }

    /// Task-level problems come back as a failed result; `Err` is reserved
    /// for provider errors that should stop the whole pool.
    pub async fn process_task(
        &mut self,
        task: &ThemeProcessingTask,
    ) -> Result<ThemeProcessingResult, ProviderError> {
        let started = Instant::now();
        self.stage = TaskStage::Received;
        tracing::debug!(
            worker = self.worker_id,
            task_id = %task.task_id,
            candidates = task.candidates.len(),
            "Processing task"
        );

        match self.run_stages(task, started).await {
            Ok(result) => {
                self.stats.record(&result);
                if result.success {
                    tracing::info!(
                        worker = self.worker_id,
                        task_id = %task.task_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        cache_hits = result.cache_hits,
                        api_calls = result.api_calls_made,
                        "Task completed"
                    );
                } else {
                    tracing::warn!(
                        worker = self.worker_id,
                        task_id = %task.task_id,
                        stage = ?result.failed_stage,
                        error = result.error_message(),
                        "Task failed"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                self.stats.tasks_processed += 1;
                self.stats.tasks_failed += 1;
                self.stats.total_processing_secs += started.elapsed().as_secs_f64();
                tracing::error!(
                    worker = self.worker_id,
                    task_id = %task.task_id,
                    error = %e,
                    "Fatal embedding error"
                );
                Err(e)
            }
        }
    }

    async fn run_stages(
        &mut self,
        task: &ThemeProcessingTask,
        started: Instant,
    ) -> Result<ThemeProcessingResult, ProviderError> {
        let k = self.words_per_theme;
        let fail = |stage: TaskStage, msg: String| {
            ThemeProcessingResult::failure(task, stage, msg, started.elapsed().as_secs_f64())
        };

        self.stage = TaskStage::Deduplicating;
        let dedup = dedupe_candidates(&task.candidates);
        let duplicates_skipped = dedup.skipped.len() as u32;
        if dedup.unique.len() < k {
            let mut r = fail(
                TaskStage::Deduplicating,
                format!("Not enough unique candidates: {} < {k}", dedup.unique.len()),
            );
            r.duplicates_skipped = duplicates_skipped;
            return Ok(r);
        }

        // 先查缓存，未命中的词合并成一次 provider 调用
        self.stage = TaskStage::Embedding;
        let mut texts = Vec::with_capacity(dedup.unique.len() + 1);
        texts.push(task.theme.trim().to_string());
        texts.extend(dedup.unique.iter().cloned());

        let mut vectors = self.cache.get_batch(&texts).await;
        let miss_idx: Vec<usize> = (0..texts.len()).filter(|&i| vectors[i].is_none()).collect();
        let cache_hits = (texts.len() - miss_idx.len()) as u32;
        let cache_misses = miss_idx.len() as u32;
        let mut fetched = vec![false; texts.len()];
        let mut api_calls_made = 0u32;

        if !miss_idx.is_empty() {
            let miss_texts: Vec<String> = miss_idx.iter().map(|&i| texts[i].clone()).collect();
            let response = self.provider.embed(&miss_texts).await?;
            if self.provider.is_remote() {
                api_calls_made = 1;
            }
            for (&i, vector) in miss_idx.iter().zip(response) {
                if let Some(v) = vector {
                    vectors[i] = Some(v);
                    fetched[i] = true;
                }
            }
        }

        let with_counts = |mut r: ThemeProcessingResult| {
            r.api_calls_made = api_calls_made;
            r.cache_hits = cache_hits;
            r.cache_misses = cache_misses;
            r.duplicates_skipped = duplicates_skipped;
            r
        };

        let Some(theme_embedding) = vectors[0].clone() else {
            return Ok(with_counts(fail(
                TaskStage::Embedding,
                format!("Failed to generate embedding for theme: {}", task.theme),
            )));
        };

        self.stage = TaskStage::Ranking;
        let mut scored: Vec<Scored> = Vec::with_capacity(dedup.unique.len());
        let mut to_cache: Vec<(String, Vec<f32>, EntryMetadata)> = Vec::new();
        if fetched[0] {
            to_cache.push((
                texts[0].clone(),
                theme_embedding.clone(),
                EntryMetadata::theme_word(&task.theme),
            ));
        }
        for (i, word) in texts.iter().enumerate().skip(1) {
            let Some(embedding) = vectors[i].take() else {
                tracing::warn!(worker = self.worker_id, word = %word, "No embedding for candidate");
                continue;
            };
            let similarity = cosine_similarity(&theme_embedding, &embedding);
            if fetched[i] {
                to_cache.push((
                    word.clone(),
                    embedding.clone(),
                    EntryMetadata::scored(&task.theme, WordType::Candidate, similarity),
                ));
            }
            scored.push(Scored {
                word: word.clone(),
                embedding,
                similarity,
            });
        }
        self.cache.put_batch(to_cache).await;

        // 稳定排序：相似度相同时保持候选词原始顺序
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        self.stage = TaskStage::Selecting;
        if scored.len() < k {
            return Ok(with_counts(fail(
                TaskStage::Selecting,
                format!("Not enough valid words after embedding: {} < {k}", scored.len()),
            )));
        }
        scored.truncate(k);

        let mut selected_words = Vec::with_capacity(k);
        let mut word_embeddings = Vec::with_capacity(k);
        let mut similarities = Vec::with_capacity(k);
        for s in scored {
            selected_words.push(s.word);
            word_embeddings.push(s.embedding);
            similarities.push(s.similarity);
        }

        self.stage = TaskStage::Done;
        Ok(ThemeProcessingResult {
            task_id: task.task_id.clone(),
            theme: task.theme.clone(),
            success: true,
            theme_embedding: Some(theme_embedding),
            selected_words,
            word_embeddings,
            similarities,
            api_calls_made,
            cache_hits,
            cache_misses,
            duplicates_skipped,
            processing_time_secs: started.elapsed().as_secs_f64(),
            error_message: None,
            failed_stage: None,
        })
    }
}
