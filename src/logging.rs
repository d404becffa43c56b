use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::Config;

const LOG_FILE_PREFIX: &str = "puzzle-forge";
const MAX_LOG_FILES: usize = 14;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_level: String,
    pub enable_file_logs: bool,
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_file_logs: false,
            log_dir: "./logs".to_string(),
        }
    }
}

impl From<&Config> for LogConfig {
    fn from(config: &Config) -> Self {
        Self {
            log_level: config.log_level.clone(),
            enable_file_logs: config.enable_file_logs,
            log_dir: config.log_dir.clone(),
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
///
/// The returned guard flushes the file writer when dropped, so keep it
/// alive until the job is about to exit.
pub fn init_tracing(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // worker 以 tokio 任务运行，线程 id 便于区分并发输出
    let stdout_layer = fmt::layer().with_target(true).with_thread_ids(true);
    let registry = Registry::default().with(env_filter).with(stdout_layer);

    if !config.enable_file_logs {
        let _ = registry.try_init();
        return None;
    }

    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(&config.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            let _ = registry.try_init();
            tracing::warn!(error = %e, dir = %config.log_dir, "File logging disabled");
            return None;
        }
    };

    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false).json();
    // 全局 subscriber 已存在（如测试环境）时 try_init 失败，属于正常情况
    match registry.with(file_layer).try_init() {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let cfg = LogConfig::default();
        assert!(init_tracing(&cfg).is_none());
        assert!(init_tracing(&cfg).is_none());
    }

    #[test]
    fn file_logs_after_stdout_init_do_not_panic() {
        let tmp = tempfile::tempdir().expect("tempdir");
        init_tracing(&LogConfig::default());
        let guard = init_tracing(&LogConfig {
            log_level: "debug".to_string(),
            enable_file_logs: true,
            log_dir: tmp.path().to_string_lossy().to_string(),
        });
        assert!(guard.is_none());
    }

    #[test]
    fn log_config_follows_job_config() {
        let mut config = Config::default();
        config.log_level = "debug".to_string();
        config.enable_file_logs = true;

        let log = LogConfig::from(&config);
        assert_eq!(log.log_level, "debug");
        assert!(log.enable_file_logs);
        assert_eq!(log.log_dir, config.log_dir);
    }
}
