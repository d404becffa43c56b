use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub enable_file_logs: bool,
    pub log_dir: String,
    pub rate_limit: RateLimitConfig,
    pub puzzle: PuzzleConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u64,
    pub min_request_interval: Duration,
    pub max_concurrent_requests: usize,
    /// Length of the fixed RPM window; 60s in production.
    pub window: Duration,
    pub concurrency_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PuzzleConfig {
    pub words_per_theme: usize,
    pub themes_per_puzzle: usize,
    pub total_puzzle_count: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub tasks_per_batch: usize,
    pub task_timeout: Duration,
    pub queue_poll: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_file: PathBuf,
    pub backup_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    Gemini,
    VectorIndex,
}

impl FromStr for EmbeddingBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "vector_index" | "vector-index" | "local" => Ok(Self::VectorIndex),
            other => Err(format!("unknown embedding backend '{other}'")),
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub api_url: String,
    pub api_key: String,
    pub model_id: String,
    pub dimension: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub timeout_secs: u64,
    pub vector_index_path: PathBuf,
    pub vector_vocab_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub themes_file: PathBuf,
    pub candidates_file: PathBuf,
    pub output_dir: PathBuf,
}

impl fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("backend", &self.backend)
            .field("api_url", &self.api_url)
            .field("api_key", &"***REDACTED***")
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("timeout_secs", &self.timeout_secs)
            .field("vector_index_path", &self.vector_index_path)
            .field("vector_vocab_path", &self.vector_vocab_path)
            .finish()
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            min_request_interval: Duration::from_millis(DEFAULT_MIN_REQUEST_INTERVAL_MS),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
            concurrency_timeout: Duration::from_secs(DEFAULT_CONCURRENCY_TIMEOUT_SECS),
        }
    }
}

impl Default for PuzzleConfig {
    fn default() -> Self {
        Self {
            words_per_theme: DEFAULT_WORDS_PER_THEME,
            themes_per_puzzle: DEFAULT_THEMES_PER_PUZZLE,
            total_puzzle_count: DEFAULT_TOTAL_PUZZLE_COUNT,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            tasks_per_batch: DEFAULT_TASKS_PER_BATCH,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            queue_poll: Duration::from_millis(DEFAULT_QUEUE_POLL_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_file: PathBuf::from("data/cache/all_embeddings.csv"),
            backup_interval: Duration::from_secs(DEFAULT_CACHE_BACKUP_INTERVAL_SECS),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Gemini,
            api_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: String::new(),
            model_id: "gemini-embedding-001".to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            max_retries: DEFAULT_EMBEDDING_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            timeout_secs: 30,
            vector_index_path: PathBuf::from("data/index/vectors.bin"),
            vector_vocab_path: PathBuf::from("data/index/vocabulary.json"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            themes_file: PathBuf::from("data/themes/selected_themes.json"),
            candidates_file: PathBuf::from("data/candidates/candidate_words.json"),
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_file_logs: false,
            log_dir: "./logs".to_string(),
            rate_limit: RateLimitConfig::default(),
            puzzle: PuzzleConfig::default(),
            worker: WorkerConfig::default(),
            cache: CacheConfig::default(),
            embedding: EmbeddingConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl PuzzleConfig {
    pub fn themes_needed(&self) -> usize {
        self.total_puzzle_count * self.themes_per_puzzle
    }

    pub fn words_per_puzzle(&self) -> usize {
        self.themes_per_puzzle * self.words_per_theme
    }
}

/// CPUs minus one reserved for the orchestrator, clamped to 2..=8.
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).clamp(2, 8)
}

impl Config {
    pub fn from_env() -> Self {
        let Config {
            cache,
            embedding,
            paths,
            ..
        } = Config::default();

        Self {
            log_level: env_or("RUST_LOG", "info"),
            enable_file_logs: env_or_bool("ENABLE_FILE_LOGS", false),
            log_dir: env_or("LOG_DIR", "./logs"),
            rate_limit: RateLimitConfig {
                requests_per_minute: env_or_parse("RATE_LIMIT_RPM", DEFAULT_REQUESTS_PER_MINUTE),
                min_request_interval: Duration::from_millis(env_or_parse(
                    "RATE_LIMIT_MIN_INTERVAL_MS",
                    DEFAULT_MIN_REQUEST_INTERVAL_MS,
                )),
                max_concurrent_requests: env_or_parse(
                    "RATE_LIMIT_MAX_CONCURRENT",
                    DEFAULT_MAX_CONCURRENT_REQUESTS,
                ),
                window: Duration::from_secs(env_or_parse(
                    "RATE_LIMIT_WINDOW_SECS",
                    DEFAULT_RATE_WINDOW_SECS,
                )),
                concurrency_timeout: Duration::from_secs(env_or_parse(
                    "RATE_LIMIT_CONCURRENCY_TIMEOUT_SECS",
                    DEFAULT_CONCURRENCY_TIMEOUT_SECS,
                )),
            },
            puzzle: PuzzleConfig {
                words_per_theme: env_or_parse("WORDS_PER_THEME", DEFAULT_WORDS_PER_THEME),
                themes_per_puzzle: env_or_parse("THEMES_PER_PUZZLE", DEFAULT_THEMES_PER_PUZZLE),
                total_puzzle_count: env_or_parse("TOTAL_PUZZLE_COUNT", DEFAULT_TOTAL_PUZZLE_COUNT),
            },
            worker: WorkerConfig {
                worker_count: env_or_parse("WORKER_COUNT", default_worker_count()),
                tasks_per_batch: env_or_parse("TASKS_PER_BATCH", DEFAULT_TASKS_PER_BATCH),
                task_timeout: Duration::from_secs(env_or_parse(
                    "TASK_TIMEOUT_SECS",
                    DEFAULT_TASK_TIMEOUT_SECS,
                )),
                queue_poll: Duration::from_millis(env_or_parse(
                    "QUEUE_POLL_MS",
                    DEFAULT_QUEUE_POLL_MS,
                )),
                shutdown_grace: Duration::from_secs(env_or_parse(
                    "SHUTDOWN_GRACE_SECS",
                    DEFAULT_SHUTDOWN_GRACE_SECS,
                )),
            },
            cache: CacheConfig {
                cache_file: env_or_path("CACHE_FILE", cache.cache_file),
                backup_interval: Duration::from_secs(env_or_parse(
                    "CACHE_BACKUP_INTERVAL_SECS",
                    DEFAULT_CACHE_BACKUP_INTERVAL_SECS,
                )),
            },
            embedding: EmbeddingConfig {
                backend: env_or_parse_str("EMBEDDING_BACKEND", embedding.backend),
                api_url: env_or("EMBEDDING_API_URL", &embedding.api_url),
                api_key: env_or("EMBEDDING_API_KEY", ""),
                model_id: env_or("EMBEDDING_MODEL", &embedding.model_id),
                dimension: env_or_parse("EMBEDDING_DIMENSION", DEFAULT_EMBEDDING_DIMENSION),
                max_retries: env_or_parse("EMBEDDING_MAX_RETRIES", DEFAULT_EMBEDDING_MAX_RETRIES),
                retry_base_delay: Duration::from_millis(env_or_parse(
                    "EMBEDDING_RETRY_BASE_DELAY_MS",
                    DEFAULT_RETRY_BASE_DELAY_MS,
                )),
                timeout_secs: env_or_parse("EMBEDDING_TIMEOUT_SECS", embedding.timeout_secs),
                vector_index_path: env_or_path("VECTOR_INDEX_PATH", embedding.vector_index_path),
                vector_vocab_path: env_or_path("VECTOR_VOCAB_PATH", embedding.vector_vocab_path),
            },
            paths: PathsConfig {
                themes_file: env_or_path("THEMES_FILE", paths.themes_file),
                candidates_file: env_or_path("CANDIDATES_FILE", paths.candidates_file),
                output_dir: env_or_path("OUTPUT_DIR", paths.output_dir),
            },
        }
    }

    /// Reject settings that would make the pipeline spin or divide by zero.
    pub fn validate(&self) -> Result<(), String> {
        let checks: [(&str, bool); 8] = [
            ("RATE_LIMIT_RPM", self.rate_limit.requests_per_minute > 0),
            (
                "RATE_LIMIT_MAX_CONCURRENT",
                self.rate_limit.max_concurrent_requests > 0,
            ),
            ("RATE_LIMIT_WINDOW_SECS", !self.rate_limit.window.is_zero()),
            ("WORDS_PER_THEME", self.puzzle.words_per_theme > 0),
            ("THEMES_PER_PUZZLE", self.puzzle.themes_per_puzzle > 0),
            ("WORKER_COUNT", self.worker.worker_count > 0),
            ("TASKS_PER_BATCH", self.worker.tasks_per_batch > 0),
            ("EMBEDDING_DIMENSION", self.embedding.dimension > 0),
        ];

        for (key, ok) in checks {
            if !ok {
                return Err(format!("{key} must be greater than zero"));
            }
        }

        if self.embedding.backend == EmbeddingBackend::Gemini && self.embedding.api_key.is_empty()
        {
            return Err("EMBEDDING_API_KEY must be set for the gemini backend".to_string());
        }
        Ok(())
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_path(key: &str, default: PathBuf) -> PathBuf {
    env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

pub fn env_or_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn env_or_parse_str<T>(key: &str, default: T) -> T
where
    T: FromStr<Err = String>,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "Invalid env var, using default");
            default
        }),
        Err(_) => default,
    }
}

pub fn env_or_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, OnceLock};

    use super::*;

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn managed_keys() -> &'static [&'static str] {
        &[
            "RUST_LOG",
            "RATE_LIMIT_RPM",
            "RATE_LIMIT_MIN_INTERVAL_MS",
            "WORDS_PER_THEME",
            "WORKER_COUNT",
            "EMBEDDING_BACKEND",
            "EMBEDDING_API_KEY",
            "TASK_TIMEOUT_SECS",
        ]
    }

    fn clear_keys(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_when_missing() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());

        let cfg = Config::from_env();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.rate_limit.requests_per_minute, 2900);
        assert_eq!(cfg.rate_limit.min_request_interval, Duration::from_millis(100));
        assert_eq!(cfg.puzzle.words_per_theme, 4);
        assert_eq!(cfg.puzzle.themes_needed(), 80);
        assert_eq!(cfg.embedding.backend, EmbeddingBackend::Gemini);
        assert!((2..=8).contains(&cfg.worker.worker_count));
    }

    #[test]
    fn parses_numeric_values() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());

        env::set_var("RATE_LIMIT_RPM", "120");
        env::set_var("WORDS_PER_THEME", "5");
        env::set_var("TASK_TIMEOUT_SECS", "42");

        let cfg = Config::from_env();
        assert_eq!(cfg.rate_limit.requests_per_minute, 120);
        assert_eq!(cfg.puzzle.words_per_theme, 5);
        assert_eq!(cfg.worker.task_timeout, Duration::from_secs(42));
        clear_keys(managed_keys());
    }

    #[test]
    fn invalid_values_fall_back() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());

        env::set_var("RATE_LIMIT_RPM", "lots");
        env::set_var("EMBEDDING_BACKEND", "carrier-pigeon");

        let cfg = Config::from_env();
        assert_eq!(cfg.rate_limit.requests_per_minute, 2900);
        assert_eq!(cfg.embedding.backend, EmbeddingBackend::Gemini);
        clear_keys(managed_keys());
    }

    #[test]
    fn validate_requires_api_key_for_gemini() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());

        let mut cfg = Config::from_env();
        assert!(cfg.validate().is_err());

        cfg.embedding.backend = EmbeddingBackend::VectorIndex;
        assert!(cfg.validate().is_ok());

        cfg.puzzle.words_per_theme = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("WORDS_PER_THEME"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys(managed_keys());
        env::set_var("EMBEDDING_API_KEY", "super-secret-key");

        let cfg = Config::from_env();
        let rendered = format!("{:?}", cfg.embedding);
        assert!(!rendered.contains("super-secret-key"));
        assert!(rendered.contains("REDACTED"));
        clear_keys(managed_keys());
    }
}
