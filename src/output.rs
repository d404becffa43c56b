use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::{AggregationMetadata, EmbeddingRow};
use crate::cache::{snapshot::temp_path, CacheStats};
use crate::constants::EMBEDDING_COLUMN_PREFIX;
use crate::rate_limit::RateLimiterStats;
use crate::workers::{ProcessingStats, WorkerStats};

pub const PUZZLES_FILE: &str = "final_puzzles.json";
pub const METADATA_FILE: &str = "puzzle_metadata.json";
pub const SUMMARY_FILE: &str = "run_summary.json";
pub const EMBEDDINGS_FILE: &str = "puzzle_embeddings.csv";

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every planned puzzle was produced.
    Completed,
    /// Some puzzles were produced.
    Partial,
    /// No usable output.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub interrupted: bool,
    pub fatal_error: Option<String>,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub planned_puzzles: usize,
    pub successful_puzzles: usize,
    pub failed_puzzles: usize,
    pub output_files: Vec<String>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.successful_puzzles > 0 {
            0
        } else {
            1
        }
    }

    pub fn status_for(successful: usize, planned: usize) -> RunStatus {
        match successful {
            0 => RunStatus::Failed,
            n if n >= planned => RunStatus::Completed,
            _ => RunStatus::Partial,
        }
    }
}

/// Everything in `puzzle_metadata.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub embedding_backend: String,
    pub model_id: String,
    pub embedding_dimension: usize,
    pub aggregation: AggregationMetadata,
    pub processing: ProcessingStats,
    pub workers: Vec<WorkerStats>,
    pub cache: CacheStats,
    pub rate_limiter: RateLimiterStats,
}

/// Write `bytes` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), OutputError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = temp_path(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(source) = result {
        let _ = fs::remove_file(&tmp);
        return Err(OutputError::Io {
            path: path.display().to_string(),
            source,
        });
    }
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OutputError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

pub fn embeddings_csv(rows: &[EmbeddingRow]) -> Result<Vec<u8>, OutputError> {
    let dimension = rows.iter().map(|r| r.embedding.len()).max().unwrap_or(0);
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<String> = [
        "puzzle_id",
        "theme",
        "word",
        "word_type",
        "similarity_to_theme",
        "rank",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend((1..=dimension).map(|i| format!("{EMBEDDING_COLUMN_PREFIX}{i}")));
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![
            row.puzzle_id.to_string(),
            row.theme.clone(),
            row.word.clone(),
            row.word_type.to_string(),
            row.similarity_to_theme.to_string(),
            row.rank.to_string(),
        ];
        record.extend(row.embedding.iter().map(|v| v.to_string()));
        record.resize(header.len(), String::new());
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| OutputError::Csv(csv::Error::from(e.into_error())))
}

/// Paths of the files a run writes into `output_dir`.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub puzzles: PathBuf,
    pub metadata: PathBuf,
    pub summary: PathBuf,
    pub embeddings: PathBuf,
}

impl OutputPaths {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            puzzles: output_dir.join(PUZZLES_FILE),
            metadata: output_dir.join(METADATA_FILE),
            summary: output_dir.join(SUMMARY_FILE),
            embeddings: output_dir.join(EMBEDDINGS_FILE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WordType;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("x.json");
        write_json(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json(&path, &serde_json::json!({"a": 2})).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["a"], 2);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn embeddings_csv_layout() {
        let rows = vec![
            EmbeddingRow {
                puzzle_id: 1,
                theme: "sun".into(),
                word: "sun".into(),
                word_type: WordType::Theme,
                similarity_to_theme: 1.0,
                rank: 0,
                embedding: vec![0.5, 0.25],
            },
            EmbeddingRow {
                puzzle_id: 1,
                theme: "sun".into(),
                word: "ray".into(),
                word_type: WordType::SelectedWord,
                similarity_to_theme: 0.75,
                rank: 1,
                embedding: vec![0.125, 1.0],
            },
        ];
        let text = String::from_utf8(embeddings_csv(&rows).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "puzzle_id,theme,word,word_type,similarity_to_theme,rank,embedding_dim_1,embedding_dim_2"
        );
        assert_eq!(lines[1], "1,sun,sun,theme,1,0,0.5,0.25");
        assert_eq!(lines[2], "1,sun,ray,selected_word,0.75,1,0.125,1");
    }

    #[test]
    fn status_and_exit_code() {
        assert_eq!(RunSummary::status_for(0, 4), RunStatus::Failed);
        assert_eq!(RunSummary::status_for(2, 4), RunStatus::Partial);
        assert_eq!(RunSummary::status_for(4, 4), RunStatus::Completed);
    }
}
