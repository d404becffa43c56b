/// 每个主题默认选出的单词数
pub const DEFAULT_WORDS_PER_THEME: usize = 4;

/// 每个谜题默认包含的主题数
pub const DEFAULT_THEMES_PER_PUZZLE: usize = 4;

/// 默认生成的谜题数量
pub const DEFAULT_TOTAL_PUZZLE_COUNT: usize = 20;

/// Default shared requests-per-minute budget for the embedding API.
pub const DEFAULT_REQUESTS_PER_MINUTE: u64 = 2900;

/// Minimum gap between any two API requests (milliseconds).
pub const DEFAULT_MIN_REQUEST_INTERVAL_MS: u64 = 100;

/// 同时在途的最大请求数
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;

/// Length of the fixed RPM window.
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// Upper bound on the concurrency-gate wait before proceeding anyway.
pub const DEFAULT_CONCURRENCY_TIMEOUT_SECS: u64 = 60;

/// 缓存快照写盘间隔（秒）
pub const DEFAULT_CACHE_BACKUP_INTERVAL_SECS: u64 = 60;

/// Orchestrator-level timeout for one task.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Idle queue poll timeout so workers notice shutdown.
pub const DEFAULT_QUEUE_POLL_MS: u64 = 500;

/// 关闭时等待在途任务完成的宽限期（秒）
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

pub const DEFAULT_TASKS_PER_BATCH: usize = 5;

pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;

pub const DEFAULT_EMBEDDING_MAX_RETRIES: u32 = 3;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Progress is logged each time this many tasks complete.
pub const PROGRESS_LOG_EVERY: usize = 20;

/// CSV columns that precede the `embedding_dim_N` columns in the cache file.
pub const CACHE_CSV_FIXED_COLUMNS: [&str; 5] =
    ["word", "theme", "word_type", "similarity_to_theme", "timestamp"];

/// Prefix of the per-dimension CSV columns (1-based suffix).
pub const EMBEDDING_COLUMN_PREFIX: &str = "embedding_dim_";
