use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("unexpected shape in {path}: {message}")]
    Shape { path: String, message: String },
}

async fn read_json(path: &Path) -> Result<Value, InputError> {
    let display = path.display().to_string();
    let bytes = tokio::fs::read(path).await.map_err(|source| InputError::Read {
        path: display.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| InputError::Json {
        path: display,
        source,
    })
}

/// Accepts `["a", ...]`, `{"themes": [...]}` or a list of `{"theme": "a"}`.
pub fn parse_themes(value: &Value) -> Result<Vec<String>, String> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("themes").or_else(|| map.get("selected_themes")) {
            Some(Value::Array(items)) => items,
            _ => return Err("expected an array or an object with a 'themes' array".to_string()),
        },
        _ => return Err("expected an array of themes".to_string()),
    };

    let themes: Vec<String> = list
        .iter()
        .filter_map(|item| word_of(item, "theme"))
        .filter(|t| !t.is_empty())
        .collect();
    Ok(themes)
}

/// Accepts `{theme: [words]}`, `{theme: {"candidates": [words]}}` and the
/// same map wrapped in `{"candidates": {...}}`. Word entries may be strings
/// or `{"word": ...}` objects.
pub fn parse_candidates(value: &Value) -> Result<HashMap<String, Vec<String>>, String> {
    let Value::Object(map) = value else {
        return Err("expected an object keyed by theme".to_string());
    };

    let map = match map.get("candidates") {
        Some(Value::Object(inner)) if map.len() == 1 => inner,
        _ => map,
    };

    let mut out = HashMap::with_capacity(map.len());
    for (theme, entry) in map {
        let words = match entry {
            Value::Array(items) => items,
            Value::Object(obj) => match obj.get("candidates").or_else(|| obj.get("words")) {
                Some(Value::Array(items)) => items,
                _ => {
                    tracing::warn!(theme = %theme, "Candidate entry has no word list, skipping");
                    continue;
                }
            },
            _ => {
                tracing::warn!(theme = %theme, "Candidate entry is not a list, skipping");
                continue;
            }
        };
        let words: Vec<String> = words.iter().filter_map(|w| word_of(w, "word")).collect();
        out.insert(theme.clone(), words);
    }
    Ok(out)
}

fn word_of(item: &Value, field: &str) -> Option<String> {
    match item {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Object(obj) => obj.get(field)?.as_str().map(|s| s.trim().to_string()),
        _ => None,
    }
}

pub async fn load_themes(path: &Path) -> Result<Vec<String>, InputError> {
    let value = read_json(path).await?;
    let themes = parse_themes(&value).map_err(|message| InputError::Shape {
        path: path.display().to_string(),
        message,
    })?;
    tracing::info!(count = themes.len(), path = %path.display(), "Loaded themes");
    Ok(themes)
}

pub async fn load_candidates(path: &Path) -> Result<HashMap<String, Vec<String>>, InputError> {
    let value = read_json(path).await?;
    let candidates = parse_candidates(&value).map_err(|message| InputError::Shape {
        path: path.display().to_string(),
        message,
    })?;
    tracing::info!(themes = candidates.len(), path = %path.display(), "Loaded candidates");
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn theme_shapes() {
        assert_eq!(parse_themes(&json!(["a", " b ", ""])).unwrap(), vec!["a", "b"]);
        assert_eq!(parse_themes(&json!({"themes": ["x"]})).unwrap(), vec!["x"]);
        assert_eq!(
            parse_themes(&json!([{"theme": "y", "score": 1.0}])).unwrap(),
            vec!["y"]
        );
        assert!(parse_themes(&json!(42)).is_err());
        assert!(parse_themes(&json!({"other": []})).is_err());
    }

    #[test]
    fn candidate_shapes() {
        let flat = parse_candidates(&json!({"ocean": ["sea", "tide"]})).unwrap();
        assert_eq!(flat["ocean"], vec!["sea", "tide"]);

        let nested = parse_candidates(&json!({
            "candidates": {"ocean": {"candidates": ["sea", {"word": "wave"}]}}
        }))
        .unwrap();
        assert_eq!(nested["ocean"], vec!["sea", "wave"]);

        let skipped = parse_candidates(&json!({"ocean": 5, "sky": ["blue"]})).unwrap();
        assert!(!skipped.contains_key("ocean"));
        assert_eq!(skipped["sky"], vec!["blue"]);

        assert!(parse_candidates(&json!(["not", "a", "map"])).is_err());
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_themes(&tmp.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(err, InputError::Read { .. }));
    }

    #[tokio::test]
    async fn load_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("themes.json");
        tokio::fs::write(&path, r#"{"themes": ["ocean", "space"]}"#)
            .await
            .unwrap();
        assert_eq!(load_themes(&path).await.unwrap(), vec!["ocean", "space"]);
    }
}
