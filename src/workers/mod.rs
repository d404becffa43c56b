pub mod cache_backup;
pub mod theme_worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::cache::EmbeddingCache;
use crate::config::WorkerConfig;
use crate::constants::PROGRESS_LOG_EVERY;
use crate::services::{EmbeddingProvider, ProviderError};
use crate::shutdown::Shutdown;
use crate::task::{TaskStage, ThemeProcessingResult, ThemeProcessingTask};

pub use theme_worker::{ThemeWorker, WorkerStats};

/// Builds the provider handle a worker owns for its lifetime.
pub type ProviderFactory =
    Arc<dyn Fn(usize) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> + Send + Sync>;

pub const TIMEOUT_MESSAGE: &str = "Processing timeout";
pub const CANCELLED_MESSAGE: &str = "Cancelled before completion";

enum WorkItem {
    Batch(Vec<ThemeProcessingTask>),
    /// 毒丸：worker 收到后正常退出
    Shutdown,
}

enum WorkerEvent {
    Result(ThemeProcessingResult),
    Fatal { worker_id: usize, error: ProviderError },
    Exited(WorkerStats),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub timed_out_tasks: usize,
    pub cancelled_tasks: usize,
    pub worker_count: usize,
    pub batch_count: usize,
    pub elapsed_secs: f64,
    pub tasks_per_sec: f64,
}

#[derive(Debug, Default)]
pub struct TaskRunReport {
    /// One result per submitted task, in submission order.
    pub results: Vec<ThemeProcessingResult>,
    pub stats: ProcessingStats,
    pub worker_stats: Vec<WorkerStats>,
    pub fatal_error: Option<ProviderError>,
    pub interrupted: bool,
}

struct WorkerContext {
    worker_id: usize,
    factory: ProviderFactory,
    cache: Arc<EmbeddingCache>,
    words_per_theme: usize,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    stop: Arc<AtomicBool>,
    task_timeout: Duration,
    queue_poll: Duration,
}

/// Fans tasks out to a bounded pool of worker tasks and collects results.
pub struct TaskProcessor {
    config: WorkerConfig,
    words_per_theme: usize,
    cache: Arc<EmbeddingCache>,
    factory: ProviderFactory,
    shutdown: Shutdown,
}

pub fn create_batches(
    tasks: Vec<ThemeProcessingTask>,
    batch_size: usize,
) -> Vec<Vec<ThemeProcessingTask>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(tasks.len().div_ceil(batch_size));
    let mut iter = tasks.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

impl TaskProcessor {
    pub fn new(
        config: &WorkerConfig,
        words_per_theme: usize,
        cache: Arc<EmbeddingCache>,
        factory: ProviderFactory,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config: config.clone(),
            words_per_theme,
            cache,
            factory,
            shutdown,
        }
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub async fn run(&self, tasks: Vec<ThemeProcessingTask>) -> TaskRunReport {
        let started = Instant::now();
        let total = tasks.len();
        if total == 0 {
            tracing::warn!("No tasks to process");
            return TaskRunReport::default();
        }

        let order: Vec<(String, ThemeProcessingTask)> =
            tasks.iter().map(|t| (t.task_id.clone(), t.clone())).collect();
        let batches = create_batches(tasks, self.config.tasks_per_batch);
        let batch_count = batches.len();
        let worker_count = self.config.worker_count.clamp(1, batch_count);

        tracing::info!(
            tasks = total,
            batches = batch_count,
            workers = worker_count,
            "Starting task processing"
        );

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(worker_count * 2);
        let queue = Arc::new(Mutex::new(work_rx));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let stop = Arc::new(AtomicBool::new(false));
        let mut shutdown_rx = self.shutdown.subscribe();
        // 启动前已收到的关闭请求：worker 不接任务，全部记为取消
        let stopped_early = self.shutdown.is_requested();
        if stopped_early {
            stop.store(true, Ordering::SeqCst);
            tracing::warn!("Shutdown requested before processing started");
        }

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                worker_id,
                factory: self.factory.clone(),
                cache: self.cache.clone(),
                words_per_theme: self.words_per_theme,
                queue: queue.clone(),
                events: events_tx.clone(),
                stop: stop.clone(),
                task_timeout: self.config.task_timeout,
                queue_poll: self.config.queue_poll,
            };
            handles.push(tokio::spawn(worker_loop(ctx)));
        }
        drop(events_tx);
        drop(queue);

        let feeder_stop = stop.clone();
        let feeder = tokio::spawn(async move {
            for batch in batches {
                if feeder_stop.load(Ordering::SeqCst) {
                    break;
                }
                if work_tx.send(WorkItem::Batch(batch)).await.is_err() {
                    return;
                }
            }
            for _ in 0..worker_count {
                if work_tx.send(WorkItem::Shutdown).await.is_err() {
                    return;
                }
            }
        });

        let mut results: HashMap<String, ThemeProcessingResult> = HashMap::with_capacity(total);
        let mut stats = ProcessingStats {
            total_tasks: total,
            worker_count,
            batch_count,
            ..ProcessingStats::default()
        };
        let mut worker_stats = Vec::with_capacity(worker_count);
        let mut fatal_error: Option<ProviderError> = None;
        let mut interrupted = stopped_early;
        let mut drain_deadline: Option<tokio::time::Instant> = None;
        let mut exited = 0usize;

        let grace = self.config.shutdown_grace;
        let begin_stop = |deadline: &mut Option<tokio::time::Instant>| {
            stop.store(true, Ordering::SeqCst);
            deadline.get_or_insert_with(|| tokio::time::Instant::now() + grace);
        };

        while exited < worker_count {
            let deadline = drain_deadline;
            let drain_timer = async move {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(WorkerEvent::Result(result)) => {
                        stats.completed_tasks += 1;
                        if result.success {
                            stats.successful_tasks += 1;
                        } else {
                            stats.failed_tasks += 1;
                            if result.error_message() == TIMEOUT_MESSAGE {
                                stats.timed_out_tasks += 1;
                            }
                        }
                        results.insert(result.task_id.clone(), result);

                        if stats.completed_tasks % PROGRESS_LOG_EVERY == 0
                            || stats.completed_tasks == total
                        {
                            let elapsed = started.elapsed().as_secs_f64();
                            tracing::info!(
                                completed = stats.completed_tasks,
                                total,
                                succeeded = stats.successful_tasks,
                                failed = stats.failed_tasks,
                                tasks_per_sec = stats.completed_tasks as f64 / elapsed.max(1e-9),
                                "Progress"
                            );
                        }
                    }
                    Some(WorkerEvent::Fatal { worker_id, error }) => {
                        tracing::error!(worker = worker_id, error = %error, "Fatal provider error, stopping pool");
                        fatal_error.get_or_insert(error);
                        begin_stop(&mut drain_deadline);
                    }
                    Some(WorkerEvent::Exited(ws)) => {
                        exited += 1;
                        worker_stats.push(ws);
                    }
                    None => break,
                },
                _ = shutdown_rx.recv(), if !interrupted => {
                    interrupted = true;
                    tracing::warn!(
                        grace_secs = grace.as_secs_f64(),
                        "Shutdown requested, draining in-flight tasks"
                    );
                    begin_stop(&mut drain_deadline);
                }
                _ = drain_timer => {
                    tracing::warn!(
                        remaining_workers = worker_count - exited,
                        "Grace period elapsed, aborting remaining workers"
                    );
                    break;
                }
            }
        }

        feeder.abort();
        for handle in &handles {
            handle.abort();
        }
        for outcome in futures::future::join_all(handles).await {
            if let Err(e) = outcome {
                if e.is_panic() {
                    tracing::error!(error = %e, "Worker panicked");
                }
            }
        }

        let mut ordered = Vec::with_capacity(total);
        for (task_id, task) in order {
            match results.remove(&task_id) {
                Some(r) => ordered.push(r),
                None => {
                    stats.cancelled_tasks += 1;
                    stats.failed_tasks += 1;
                    ordered.push(ThemeProcessingResult::failure(
                        &task,
                        TaskStage::Received,
                        CANCELLED_MESSAGE,
                        0.0,
                    ));
                }
            }
        }

        stats.elapsed_secs = started.elapsed().as_secs_f64();
        stats.tasks_per_sec = stats.completed_tasks as f64 / stats.elapsed_secs.max(1e-9);
        worker_stats.sort_by_key(|w| w.worker_id);

        tracing::info!(
            succeeded = stats.successful_tasks,
            failed = stats.failed_tasks,
            cancelled = stats.cancelled_tasks,
            elapsed_secs = stats.elapsed_secs,
            "Task processing finished"
        );

        TaskRunReport {
            results: ordered,
            stats,
            worker_stats,
            fatal_error,
            interrupted,
        }
    }
}

async fn worker_loop(ctx: WorkerContext) {
    let provider = match (ctx.factory)(ctx.worker_id) {
        Ok(p) => p,
        Err(error) => {
            ctx.stop.store(true, Ordering::SeqCst);
            let _ = ctx.events.send(WorkerEvent::Fatal {
                worker_id: ctx.worker_id,
                error,
            });
            let _ = ctx.events.send(WorkerEvent::Exited(WorkerStats {
                worker_id: ctx.worker_id,
                ..WorkerStats::default()
            }));
            return;
        }
    };

    let mut worker = ThemeWorker::new(ctx.worker_id, provider, ctx.cache, ctx.words_per_theme);
    tracing::debug!(worker = ctx.worker_id, "Worker started");

    'pull: loop {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        // 拉取带超时，空闲时也能定期检查 stop 标志
        let item = tokio::time::timeout(ctx.queue_poll, async {
            ctx.queue.lock().await.recv().await
        })
        .await;

        let batch = match item {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(WorkItem::Shutdown)) => {
                tracing::debug!(worker = ctx.worker_id, "Received shutdown sentinel");
                break;
            }
            Ok(Some(WorkItem::Batch(batch))) => batch,
        };

        for task in batch {
            if ctx.stop.load(Ordering::SeqCst) {
                break 'pull;
            }

            let started = Instant::now();
            match tokio::time::timeout(ctx.task_timeout, worker.process_task(&task)).await {
                Ok(Ok(result)) => {
                    let _ = ctx.events.send(WorkerEvent::Result(result));
                }
                Ok(Err(error)) => {
                    ctx.stop.store(true, Ordering::SeqCst);
                    let _ = ctx.events.send(WorkerEvent::Fatal {
                        worker_id: ctx.worker_id,
                        error,
                    });
                    break 'pull;
                }
                Err(_) => {
                    tracing::warn!(
                        worker = ctx.worker_id,
                        task_id = %task.task_id,
                        timeout_secs = ctx.task_timeout.as_secs_f64(),
                        "Task timed out"
                    );
                    let result = ThemeProcessingResult::failure(
                        &task,
                        worker.stage(),
                        TIMEOUT_MESSAGE,
                        started.elapsed().as_secs_f64(),
                    );
                    worker.record_external(&result);
                    let _ = ctx.events.send(WorkerEvent::Result(result));
                }
            }
        }
    }

    let stats = worker.stats().clone();
    tracing::debug!(
        worker = ctx.worker_id,
        processed = stats.tasks_processed,
        failed = stats.tasks_failed,
        avg_secs = stats.avg_processing_secs(),
        "Worker exiting"
    );
    let _ = ctx.events.send(WorkerEvent::Exited(stats));
}
