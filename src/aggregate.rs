use std::collections::BTreeMap;

use serde::{Serialize, Serializer};

use crate::cache::WordType;
use crate::config::PuzzleConfig;
use crate::similarity::mean;
use crate::task::{parse_task_id, TaskPlan, TaskStage, ThemeProcessingResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThemeGroup {
    pub theme: String,
    pub words: Vec<String>,
    pub similarities: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Puzzle {
    pub puzzle_id: usize,
    /// All selected words, theme by theme.
    pub words: Vec<String>,
    pub themes: Vec<String>,
    pub theme_similarity_scores: Vec<f32>,
    pub total_words: usize,
    pub groups: Vec<ThemeGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedPuzzle {
    pub puzzle_id: usize,
    pub themes: Vec<String>,
    pub reason: String,
    pub failed_task_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub task_id: String,
    pub theme: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<TaskStage>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationMetadata {
    pub total_themes_needed: usize,
    pub total_themes_available: usize,
    pub themes_reused: bool,
    pub words_per_theme: usize,
    pub themes_per_puzzle: usize,
    pub successful_puzzles: usize,
    pub failed_puzzles: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub total_api_calls: u64,
    pub total_cache_hits: u64,
    pub total_cache_misses: u64,
    pub cache_miss_rate: f64,
    pub avg_similarity: f64,
    pub processing_time_secs: f64,
    pub avg_processing_time_per_theme: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PuzzleOutput {
    #[serde(serialize_with = "puzzles_by_key")]
    pub puzzles: BTreeMap<usize, Puzzle>,
    pub failed_puzzles: Vec<FailedPuzzle>,
    pub failed_tasks: Vec<FailedTask>,
    pub metadata: AggregationMetadata,
}

fn puzzles_by_key<S: Serializer>(
    puzzles: &BTreeMap<usize, Puzzle>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(puzzles.iter().map(|(id, p)| (format!("puzzle_{id}"), p)))
}

/// One row of `puzzle_embeddings.csv`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    pub puzzle_id: usize,
    pub theme: String,
    pub word: String,
    pub word_type: WordType,
    pub similarity_to_theme: f32,
    /// 0 for the theme itself, then 1..K by similarity.
    pub rank: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub output: PuzzleOutput,
    pub embedding_rows: Vec<EmbeddingRow>,
}

pub struct ResultAggregator {
    themes_per_puzzle: usize,
    words_per_theme: usize,
    words_per_puzzle: usize,
}

impl ResultAggregator {
    pub fn new(config: &PuzzleConfig) -> Self {
        Self {
            themes_per_puzzle: config.themes_per_puzzle,
            words_per_theme: config.words_per_theme,
            words_per_puzzle: config.words_per_puzzle(),
        }
    }

    /// Regroup results by the puzzle id encoded in each task id. Completion
    /// order does not matter.
    pub fn aggregate(&self, results: &[ThemeProcessingResult], plan: &TaskPlan) -> Aggregation {
        let mut groups: BTreeMap<usize, Vec<(usize, &ThemeProcessingResult)>> = BTreeMap::new();
        let mut failed_tasks = Vec::new();

        for result in results {
            if !result.success {
                failed_tasks.push(FailedTask {
                    task_id: result.task_id.clone(),
                    theme: result.theme.clone(),
                    reason: result.error_message().to_string(),
                    stage: result.failed_stage,
                });
            }
            match parse_task_id(&result.task_id) {
                Some(pos) => groups
                    .entry(pos.puzzle_id)
                    .or_default()
                    .push((pos.theme_index, result)),
                None => {
                    tracing::warn!(task_id = %result.task_id, "Cannot parse puzzle id from task id");
                    if result.success {
                        failed_tasks.push(FailedTask {
                            task_id: result.task_id.clone(),
                            theme: result.theme.clone(),
                            reason: "Unrecognized task id".to_string(),
                            stage: None,
                        });
                    }
                }
            }
        }

        let mut puzzles = BTreeMap::new();
        let mut failed_puzzles = Vec::new();
        let mut embedding_rows = Vec::new();

        for (puzzle_id, mut members) in groups {
            members.sort_by_key(|(idx, _)| *idx);
            match self.build_puzzle(puzzle_id, &members) {
                Ok(puzzle) => {
                    for (_, r) in &members {
                        embedding_rows.extend(embedding_rows_for(puzzle_id, r));
                    }
                    puzzles.insert(puzzle_id, puzzle);
                }
                Err(reason) => {
                    tracing::warn!(puzzle_id, reason = %reason, "Puzzle rejected");
                    failed_puzzles.push(FailedPuzzle {
                        puzzle_id,
                        themes: members.iter().map(|(_, r)| r.theme.clone()).collect(),
                        reason,
                        failed_task_ids: members
                            .iter()
                            .filter(|(_, r)| !r.success)
                            .map(|(_, r)| r.task_id.clone())
                            .collect(),
                    });
                }
            }
        }

        let metadata = self.metadata(results, plan, puzzles.len(), failed_puzzles.len());
        tracing::info!(
            puzzles = puzzles.len(),
            failed_puzzles = failed_puzzles.len(),
            failed_tasks = failed_tasks.len(),
            "Aggregation completed"
        );

        Aggregation {
            output: PuzzleOutput {
                puzzles,
                failed_puzzles,
                failed_tasks,
                metadata,
            },
            embedding_rows,
        }
    }

    fn build_puzzle(
        &self,
        puzzle_id: usize,
        members: &[(usize, &ThemeProcessingResult)],
    ) -> Result<Puzzle, String> {
        let succeeded: Vec<&ThemeProcessingResult> = members
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(_, r)| *r)
            .collect();

        if succeeded.len() < self.themes_per_puzzle {
            return Err(format!(
                "Incomplete puzzle: {}/{} themes",
                succeeded.len(),
                self.themes_per_puzzle
            ));
        }
        if members.len() != self.themes_per_puzzle {
            return Err(format!(
                "Unexpected theme count: {}/{} themes",
                members.len(),
                self.themes_per_puzzle
            ));
        }

        let bad_counts: Vec<&str> = succeeded
            .iter()
            .filter(|r| {
                r.selected_words.len() != self.words_per_theme
                    || r.similarities.len() != self.words_per_theme
            })
            .map(|r| r.theme.as_str())
            .collect();
        if !bad_counts.is_empty() {
            return Err(format!(
                "Invalid word counts in themes: {}",
                bad_counts.join(", ")
            ));
        }

        let mut puzzle = Puzzle {
            puzzle_id,
            words: Vec::with_capacity(self.words_per_puzzle),
            themes: Vec::with_capacity(self.themes_per_puzzle),
            theme_similarity_scores: Vec::new(),
            total_words: 0,
            groups: Vec::with_capacity(self.themes_per_puzzle),
        };
        for r in succeeded {
            puzzle.words.extend(r.selected_words.iter().cloned());
            puzzle.theme_similarity_scores.extend(&r.similarities);
            puzzle.themes.push(r.theme.clone());
            puzzle.groups.push(ThemeGroup {
                theme: r.theme.clone(),
                words: r.selected_words.clone(),
                similarities: r.similarities.clone(),
            });
        }
        puzzle.total_words = puzzle.words.len();
        Ok(puzzle)
    }

    fn metadata(
        &self,
        results: &[ThemeProcessingResult],
        plan: &TaskPlan,
        successful_puzzles: usize,
        failed_puzzles: usize,
    ) -> AggregationMetadata {
        let successful: Vec<&ThemeProcessingResult> = results.iter().filter(|r| r.success).collect();
        let hits: u64 = results.iter().map(|r| r.cache_hits as u64).sum();
        let misses: u64 = results.iter().map(|r| r.cache_misses as u64).sum();
        let processing_time: f64 = results.iter().map(|r| r.processing_time_secs).sum();
        let similarities: Vec<f32> = successful
            .iter()
            .flat_map(|r| r.similarities.iter().copied())
            .collect();

        AggregationMetadata {
            total_themes_needed: plan.themes_needed,
            total_themes_available: plan.themes_available,
            themes_reused: plan.themes_reused,
            words_per_theme: self.words_per_theme,
            themes_per_puzzle: self.themes_per_puzzle,
            successful_puzzles,
            failed_puzzles,
            successful_tasks: successful.len(),
            failed_tasks: results.len() - successful.len(),
            total_api_calls: results.iter().map(|r| r.api_calls_made as u64).sum(),
            total_cache_hits: hits,
            total_cache_misses: misses,
            cache_miss_rate: if hits + misses > 0 {
                misses as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            avg_similarity: mean(&similarities).unwrap_or(0.0),
            processing_time_secs: processing_time,
            avg_processing_time_per_theme: if results.is_empty() {
                0.0
            } else {
                processing_time / results.len() as f64
            },
        }
    }
}

fn embedding_rows_for(puzzle_id: usize, result: &ThemeProcessingResult) -> Vec<EmbeddingRow> {
    let mut rows = Vec::with_capacity(result.selected_words.len() + 1);
    if let Some(theme_embedding) = &result.theme_embedding {
        rows.push(EmbeddingRow {
            puzzle_id,
            theme: result.theme.clone(),
            word: result.theme.clone(),
            word_type: WordType::Theme,
            similarity_to_theme: 1.0,
            rank: 0,
            embedding: theme_embedding.clone(),
        });
    }
    for (rank, ((word, embedding), similarity)) in result
        .selected_words
        .iter()
        .zip(&result.word_embeddings)
        .zip(&result.similarities)
        .enumerate()
    {
        rows.push(EmbeddingRow {
            puzzle_id,
            theme: result.theme.clone(),
            word: word.clone(),
            word_type: WordType::SelectedWord,
            similarity_to_theme: *similarity,
            rank: rank + 1,
            embedding: embedding.clone(),
        });
    }
    rows
}
