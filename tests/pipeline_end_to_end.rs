mod common;

use std::collections::HashSet;
use std::sync::Arc;


use puzzle_forge::output::RunStatus;
use puzzle_forge::pipeline::{Pipeline, PipelineError};
use puzzle_forge::services::{EmbeddingProvider, VectorIndex};
use puzzle_forge::shutdown::Shutdown;

use common::fixtures::{candidate_words, read_json, setup_run, theme_name, write_inputs};
use common::providers::{shared_factory, synthetic_vector, RejectingProvider, SyntheticProvider};

#[tokio::test]
async fn it_builds_complete_puzzles_from_inputs() {
    let run = setup_run(2, 4);
    write_inputs(&run.config, 8, 6);

    let shutdown = Shutdown::new();
    let pipeline = Pipeline::new(&run.config, shutdown).await;
    let provider = Arc::new(SyntheticProvider::new());
    let factory = shared_factory(provider.clone(), pipeline.state().limiter().clone());

    let outcome = pipeline.run(factory).await.expect("pipeline run");

    assert_eq!(outcome.summary.status, RunStatus::Completed);
    assert_eq!(outcome.summary.exit_code(), 0);
    assert_eq!(outcome.summary.successful_puzzles, 2);
    assert_eq!(outcome.summary.failed_tasks, 0);
    assert!(outcome.output.failed_puzzles.is_empty());
    // one provider round trip per theme task
    assert_eq!(provider.calls(), 8);

    for (id, puzzle) in &outcome.output.puzzles {
        assert_eq!(puzzle.total_words, 16);
        assert_eq!(puzzle.themes.len(), 4);
        let unique: HashSet<&String> = puzzle.words.iter().collect();
        assert_eq!(unique.len(), 16, "puzzle {id} has duplicate words");
    }

    let first = &outcome.output.puzzles[&1];
    assert_eq!(first.themes, vec!["t0", "t1", "t2", "t3"]);
    assert_eq!(first.groups[0].words, candidate_words(0, 4));
    assert!(first.groups[0]
        .similarities
        .windows(2)
        .all(|w| w[0] >= w[1]));

    let puzzles_json = read_json(&outcome.paths.puzzles);
    assert!(puzzles_json["puzzles"]["puzzle_1"].is_object());
    assert!(puzzles_json["puzzles"]["puzzle_2"].is_object());
    assert_eq!(puzzles_json["metadata"]["successful_puzzles"], 2);

    let summary_json = read_json(&outcome.paths.summary);
    assert_eq!(summary_json["status"], "completed");
    assert_eq!(summary_json["output_files"].as_array().map(Vec::len), Some(3));

    let csv = std::fs::read_to_string(&outcome.paths.embeddings).expect("embeddings csv");
    // header + (theme row + 4 words) per theme
    assert_eq!(csv.lines().count(), 1 + 8 * 5);

    assert!(run.config.cache.cache_file.exists());
    assert!(outcome.paths.metadata.exists());
}

#[tokio::test]
async fn it_serves_second_run_from_persisted_cache() {
    let run = setup_run(1, 4);
    write_inputs(&run.config, 4, 5);

    let shutdown = Shutdown::new();
    let first = Pipeline::new(&run.config, shutdown.clone()).await;
    let factory = shared_factory(
        Arc::new(SyntheticProvider::new()),
        first.state().limiter().clone(),
    );
    first.run(factory).await.expect("first run");

    let second = Pipeline::new(&run.config, shutdown).await;
    assert!(second.state().cache().len().await >= 4 * 6);
    let provider = Arc::new(SyntheticProvider::new());
    let factory = shared_factory(provider.clone(), second.state().limiter().clone());
    let outcome = second.run(factory).await.expect("second run");

    assert_eq!(provider.calls(), 0);
    assert_eq!(outcome.summary.successful_puzzles, 1);
    assert_eq!(outcome.output.metadata.total_cache_misses, 0);
    assert_eq!(outcome.output.metadata.total_api_calls, 0);
    assert!(outcome.output.metadata.total_cache_hits >= 24);
}

#[tokio::test]
async fn it_writes_summary_when_provider_rejects_credentials() {
    let run = setup_run(2, 4);
    write_inputs(&run.config, 8, 6);

    let shutdown = Shutdown::new();
    let pipeline = Pipeline::new(&run.config, shutdown).await;
    let factory = shared_factory(Arc::new(RejectingProvider), pipeline.state().limiter().clone());

    let outcome = pipeline.run(factory).await.expect("summary still produced");

    assert_eq!(outcome.summary.status, RunStatus::Failed);
    assert_eq!(outcome.summary.exit_code(), 1);
    assert_eq!(outcome.summary.successful_puzzles, 0);
    assert!(outcome
        .summary
        .fatal_error
        .as_deref()
        .is_some_and(|e| e.contains("credentials")));
    assert_eq!(
        outcome.summary.failed_tasks + outcome.summary.successful_tasks,
        outcome.summary.total_tasks
    );

    let summary_json = read_json(&outcome.paths.summary);
    assert_eq!(summary_json["status"], "failed");
}

#[tokio::test]
async fn it_rejects_puzzle_with_failed_theme() {
    let run = setup_run(2, 4);
    write_inputs(&run.config, 8, 6);

    // t5 只剩两个候选词，不足以选出 4 个
    let mut candidates: serde_json::Value =
        read_json(&run.config.paths.candidates_file);
    candidates["t5"] = serde_json::json!(["t5w1", "t5w2"]);
    std::fs::write(
        &run.config.paths.candidates_file,
        serde_json::to_vec(&candidates).expect("json"),
    )
    .expect("rewrite candidates");

    let shutdown = Shutdown::new();
    let pipeline = Pipeline::new(&run.config, shutdown).await;
    let factory = shared_factory(
        Arc::new(SyntheticProvider::new()),
        pipeline.state().limiter().clone(),
    );
    let outcome = pipeline.run(factory).await.expect("pipeline run");

    assert_eq!(outcome.summary.status, RunStatus::Partial);
    assert_eq!(outcome.summary.exit_code(), 0);
    assert!(outcome.output.puzzles.contains_key(&1));
    assert_eq!(outcome.output.failed_puzzles.len(), 1);

    let failed = &outcome.output.failed_puzzles[0];
    assert_eq!(failed.puzzle_id, 2);
    assert_eq!(failed.reason, "Incomplete puzzle: 3/4 themes");
    assert_eq!(failed.failed_task_ids, vec!["p02_t1_t5".to_string()]);

    let task = &outcome.output.failed_tasks[0];
    assert!(task.reason.starts_with("Not enough unique candidates"));
}

#[tokio::test]
async fn it_runs_against_local_vector_index() {
    let run = setup_run(2, 4);
    write_inputs(&run.config, 8, 6);

    let mut vocabulary = Vec::new();
    let mut rows = Vec::new();
    for i in 0..8 {
        for word in std::iter::once(theme_name(i)).chain(candidate_words(i, 6)) {
            rows.push(synthetic_vector(&word).expect("synthetic word"));
            vocabulary.push(word);
        }
    }
    let index = VectorIndex::from_rows(vocabulary, rows).expect("index");
    let cfg = &run.config.embedding;
    std::fs::create_dir_all(cfg.vector_index_path.parent().expect("parent")).expect("mkdir");
    index
        .write_to(&cfg.vector_index_path, &cfg.vector_vocab_path)
        .expect("write index");

    let shutdown = Shutdown::new();
    let pipeline = Pipeline::new(&run.config, shutdown).await;
    let factory = pipeline.provider_factory().await.expect("factory");
    let provider = factory(0).expect("provider");
    assert_eq!(provider.dimension(), 8);

    let outcome = pipeline.run(factory).await.expect("pipeline run");

    assert_eq!(outcome.summary.successful_puzzles, 2);
    assert_eq!(outcome.output.metadata.total_api_calls, 0);
    assert_eq!(pipeline.state().limiter().stats().await.requests_made, 0);
}

#[tokio::test]
async fn it_fails_fast_on_missing_inputs() {
    let run = setup_run(1, 4);

    let shutdown = Shutdown::new();
    let pipeline = Pipeline::new(&run.config, shutdown).await;
    let factory = shared_factory(
        Arc::new(SyntheticProvider::new()),
        pipeline.state().limiter().clone(),
    );

    let err = pipeline.run(factory).await.unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));
    assert!(!run.config.paths.output_dir.join("run_summary.json").exists());
}
