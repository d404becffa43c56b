use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use puzzle_forge::config::{
    CacheConfig, Config, EmbeddingBackend, EmbeddingConfig, PathsConfig, PuzzleConfig,
    RateLimitConfig, WorkerConfig,
};

pub struct TestRun {
    pub config: Config,
    pub temp_dir: TempDir,
}

/// 直接构造 Config，避免 set_var 在并行测试间产生竞态
pub fn test_config(temp_dir: &Path, total_puzzles: usize, themes_per_puzzle: usize) -> Config {
    Config {
        log_level: "info".to_string(),
        enable_file_logs: false,
        log_dir: temp_dir.join("logs").to_string_lossy().to_string(),
        rate_limit: RateLimitConfig {
            requests_per_minute: 10_000,
            min_request_interval: Duration::ZERO,
            max_concurrent_requests: 4,
            window: Duration::from_secs(60),
            concurrency_timeout: Duration::from_secs(5),
        },
        puzzle: PuzzleConfig {
            words_per_theme: 4,
            themes_per_puzzle,
            total_puzzle_count: total_puzzles,
        },
        worker: WorkerConfig {
            worker_count: 3,
            tasks_per_batch: 2,
            task_timeout: Duration::from_secs(10),
            queue_poll: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
        },
        cache: CacheConfig {
            cache_file: temp_dir.join("cache").join("all_embeddings.csv"),
            backup_interval: Duration::ZERO,
        },
        embedding: EmbeddingConfig {
            backend: EmbeddingBackend::VectorIndex,
            dimension: 8,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            vector_index_path: temp_dir.join("index").join("vectors.bin"),
            vector_vocab_path: temp_dir.join("index").join("vocabulary.json"),
            ..EmbeddingConfig::default()
        },
        paths: PathsConfig {
            themes_file: temp_dir.join("themes.json"),
            candidates_file: temp_dir.join("candidates.json"),
            output_dir: temp_dir.join("outputs"),
        },
    }
}

pub fn setup_run(total_puzzles: usize, themes_per_puzzle: usize) -> TestRun {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp_dir.path(), total_puzzles, themes_per_puzzle);
    TestRun { config, temp_dir }
}

pub fn theme_name(i: usize) -> String {
    format!("t{i}")
}

/// `t{i}w{k}` for k in 1..=per_theme.
pub fn candidate_words(i: usize, per_theme: usize) -> Vec<String> {
    (1..=per_theme).map(|k| format!("t{i}w{k}")).collect()
}

/// Writes `{"themes": [...]}` and a theme -> candidates map.
pub fn write_inputs(config: &Config, theme_count: usize, per_theme: usize) {
    let themes: Vec<String> = (0..theme_count).map(theme_name).collect();
    let candidates: BTreeMap<String, Vec<String>> = (0..theme_count)
        .map(|i| (theme_name(i), candidate_words(i, per_theme)))
        .collect();

    std::fs::write(
        &config.paths.themes_file,
        serde_json::to_vec(&serde_json::json!({ "themes": themes })).expect("themes json"),
    )
    .expect("write themes");
    std::fs::write(
        &config.paths.candidates_file,
        serde_json::to_vec(&candidates).expect("candidates json"),
    )
    .expect("write candidates");
}

pub fn read_json(path: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(path).expect("read output");
    serde_json::from_str(&raw).expect("parse output")
}
