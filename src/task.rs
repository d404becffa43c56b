use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One theme and its candidate words. Built once, consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeProcessingTask {
    pub task_id: String,
    pub theme: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Received,
    Deduplicating,
    Embedding,
    Ranking,
    Selecting,
    Done,
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::Deduplicating => "deduplicating",
            Self::Embedding => "embedding",
            Self::Ranking => "ranking",
            Self::Selecting => "selecting",
            Self::Done => "done",
        })
    }
}

/// Outcome of one task. On success the three selection vectors are
/// parallel and `similarities` is sorted descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeProcessingResult {
    pub task_id: String,
    pub theme: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_words: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub word_embeddings: Vec<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similarities: Vec<f32>,
    #[serde(default)]
    pub api_calls_made: u32,
    #[serde(default)]
    pub cache_hits: u32,
    #[serde(default)]
    pub cache_misses: u32,
    #[serde(default)]
    pub duplicates_skipped: u32,
    #[serde(default)]
    pub processing_time_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<TaskStage>,
}

impl ThemeProcessingResult {
    pub fn failure(
        task: &ThemeProcessingTask,
        stage: TaskStage,
        message: impl Into<String>,
        processing_time_secs: f64,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            theme: task.theme.clone(),
            success: false,
            theme_embedding: None,
            selected_words: Vec::new(),
            word_embeddings: Vec::new(),
            similarities: Vec::new(),
            api_calls_made: 0,
            cache_hits: 0,
            cache_misses: 0,
            duplicates_skipped: 0,
            processing_time_secs,
            error_message: Some(message.into()),
            failed_stage: Some(stage),
        }
    }

    pub fn error_message(&self) -> &str {
        self.error_message.as_deref().unwrap_or("")
    }
}

pub fn format_task_id(puzzle_id: usize, theme_index: usize, theme: &str) -> String {
    format!("p{puzzle_id:02}_t{theme_index}_{theme}")
}

/// Puzzle and theme position encoded in a task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskPosition {
    pub puzzle_id: usize,
    pub theme_index: usize,
}

/// Parse `p{puzzle}_t{index}_{theme}`; the theme part may contain `_`.
pub fn parse_task_id(task_id: &str) -> Option<TaskPosition> {
    let mut parts = task_id.splitn(3, '_');
    let puzzle_id = parts.next()?.strip_prefix('p')?.parse().ok()?;
    let theme_index = parts.next()?.strip_prefix('t')?.parse().ok()?;
    parts.next()?;
    Some(TaskPosition {
        puzzle_id,
        theme_index,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    #[serde(skip)]
    pub tasks: Vec<ThemeProcessingTask>,
    pub themes_needed: usize,
    pub themes_available: usize,
    pub themes_reused: bool,
    pub themes_without_candidates: usize,
}

pub struct TaskGenerator;

impl TaskGenerator {
    /// Lay out `total_puzzles * themes_per_puzzle` tasks, cycling through
    /// `themes` when there are not enough of them.
    pub fn create_tasks_for_puzzles(
        themes: &[String],
        candidates: &HashMap<String, Vec<String>>,
        themes_per_puzzle: usize,
        total_puzzles: usize,
    ) -> TaskPlan {
        let themes_needed = themes_per_puzzle * total_puzzles;
        let mut plan = TaskPlan {
            themes_needed,
            themes_available: themes.len(),
            themes_reused: themes.len() < themes_needed,
            ..TaskPlan::default()
        };
        if themes.is_empty() || themes_per_puzzle == 0 {
            return plan;
        }

        if plan.themes_reused {
            tracing::warn!(
                available = themes.len(),
                needed = themes_needed,
                "Not enough themes, cycling to fill puzzles"
            );
        }

        plan.tasks.reserve(themes_needed);
        for (slot, theme) in themes.iter().cycle().take(themes_needed).enumerate() {
            let puzzle_id = slot / themes_per_puzzle + 1;
            let theme_index = slot % themes_per_puzzle;
            let theme_candidates = match lookup_candidates(candidates, theme) {
                Some(words) => words.clone(),
                None => {
                    plan.themes_without_candidates += 1;
                    tracing::warn!(theme = %theme, "No candidates for theme");
                    Vec::new()
                }
            };
            plan.tasks.push(ThemeProcessingTask {
                task_id: format_task_id(puzzle_id, theme_index, theme),
                theme: theme.clone(),
                candidates: theme_candidates,
            });
        }

        tracing::info!(
            tasks = plan.tasks.len(),
            puzzles = total_puzzles,
            themes_per_puzzle,
            "Generated theme tasks"
        );
        plan
    }
}

fn lookup_candidates<'a>(
    candidates: &'a HashMap<String, Vec<String>>,
    theme: &str,
) -> Option<&'a Vec<String>> {
    candidates.get(theme).or_else(|| {
        let key = crate::cache::normalize_key(theme);
        candidates
            .iter()
            .find(|(k, _)| crate::cache::normalize_key(k) == key)
            .map(|(_, v)| v)
    })
}
