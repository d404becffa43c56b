use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::cache::normalize_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    Empty,
    CaseInsensitiveMatch,
    PluralForm,
    SingularOfExistingPlural,
}

impl fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty word",
            Self::CaseInsensitiveMatch => "case-insensitive match",
            Self::PluralForm => "plural form",
            Self::SingularOfExistingPlural => "singular of existing plural",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateSkip {
    pub word: String,
    /// Normalized key of the word it collided with.
    pub matched: String,
    pub reason: DuplicateReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Deduplication {
    pub unique: Vec<String>,
    pub skipped: Vec<DuplicateSkip>,
}

/// Plural heuristic: a trailing "s" is the only inflection considered.
fn find_duplicate(key: &str, seen: &HashSet<String>) -> Option<(String, DuplicateReason)> {
    if seen.contains(key) {
        return Some((key.to_string(), DuplicateReason::CaseInsensitiveMatch));
    }
    if let Some(singular) = key.strip_suffix('s').filter(|s| !s.is_empty()) {
        if seen.contains(singular) {
            return Some((singular.to_string(), DuplicateReason::PluralForm));
        }
    }
    let plural = format!("{key}s");
    if seen.contains(&plural) {
        return Some((plural, DuplicateReason::SingularOfExistingPlural));
    }
    None
}

/// First-seen wins; later variants are dropped with the reason recorded.
pub fn dedupe_candidates<S: AsRef<str>>(candidates: &[S]) -> Deduplication {
    let mut seen: HashSet<String> = HashSet::with_capacity(candidates.len());
    let mut out = Deduplication::default();

    for word in candidates {
        let word = word.as_ref();
        let key = normalize_key(word);
        if key.is_empty() {
            out.skipped.push(DuplicateSkip {
                word: word.to_string(),
                matched: String::new(),
                reason: DuplicateReason::Empty,
            });
            continue;
        }

        if let Some((matched, reason)) = find_duplicate(&key, &seen) {
            tracing::trace!(word, %matched, %reason, "Skipping duplicate candidate");
            out.skipped.push(DuplicateSkip {
                word: word.to_string(),
                matched,
                reason,
            });
            continue;
        }

        seen.insert(key);
        out.unique.push(word.trim().to_string());
    }
    out
}
