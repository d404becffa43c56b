use puzzle_forge::config::Config;
use puzzle_forge::logging::{init_tracing, LogConfig};
use puzzle_forge::pipeline::{Pipeline, PipelineError};
use puzzle_forge::shutdown::Shutdown;

/// Exit code when the run fails before any output is written.
const EXIT_FATAL: i32 = 2;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    let log_guard = init_tracing(&LogConfig::from(&config));
    tracing::info!(
        backend = ?config.embedding.backend,
        workers = config.worker.worker_count,
        puzzles = config.puzzle.total_puzzle_count,
        "Starting puzzle-forge"
    );

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Pipeline aborted");
            EXIT_FATAL
        }
    };

    tracing::info!(exit_code = code, "Shutdown complete");
    // process::exit 不会运行析构，先手动刷新文件日志
    drop(log_guard);
    std::process::exit(code);
}

async fn run(config: Config) -> Result<i32, PipelineError> {
    config.validate().map_err(PipelineError::Config)?;

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let pipeline = Pipeline::new(&config, shutdown).await;
    let factory = pipeline.provider_factory().await?;
    let outcome = pipeline.run(factory).await?;

    tracing::info!(
        summary = %outcome.paths.summary.display(),
        status = ?outcome.summary.status,
        "Run summary written"
    );
    Ok(outcome.summary.exit_code())
}

async fn shutdown_signal(shutdown: Shutdown) {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received, draining in-flight tasks");
    shutdown.trigger();
}
