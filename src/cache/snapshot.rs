//! CSV snapshot format for the embedding cache.
//!
//! Header: `word,theme,word_type,similarity_to_theme,timestamp,embedding_dim_1..N`.
//! Writes go to a sibling `.tmp` file which then replaces the target, so a
//! reader never sees a half-written snapshot.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::{CacheError, EmbeddingCacheEntry, WordType};
use crate::constants::{CACHE_CSV_FIXED_COLUMNS, EMBEDDING_COLUMN_PREFIX};

pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

pub fn write_snapshot(target: &Path, entries: &[EmbeddingCacheEntry]) -> Result<(), CacheError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(target);
    let result = write_csv(&tmp, entries).and_then(|()| {
        fs::rename(&tmp, target)?;
        Ok(())
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_csv(path: &Path, entries: &[EmbeddingCacheEntry]) -> Result<(), CacheError> {
    let mut sorted: Vec<&EmbeddingCacheEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.key());

    // 一个快照文件只允许一种维度
    let dimension = sorted.first().map(|e| e.embedding.len()).unwrap_or(0);
    if let Some(bad) = sorted.iter().find(|e| e.embedding.len() != dimension) {
        return Err(CacheError::DimensionMismatch {
            word: bad.word.clone(),
            expected: dimension,
            actual: bad.embedding.len(),
        });
    }

    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header: Vec<String> = CACHE_CSV_FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend((1..=dimension).map(|i| format!("{EMBEDDING_COLUMN_PREFIX}{i}")));
    writer.write_record(&header)?;

    for entry in sorted {
        let mut row: Vec<String> = Vec::with_capacity(CACHE_CSV_FIXED_COLUMNS.len() + dimension);
        row.push(entry.word.clone());
        row.push(entry.theme.clone().unwrap_or_default());
        row.push(entry.word_type.map(|t| t.to_string()).unwrap_or_default());
        row.push(
            entry
                .similarity_to_theme
                .map(|s| s.to_string())
                .unwrap_or_default(),
        );
        row.push(entry.timestamp.to_string());
        row.extend(entry.embedding.iter().map(|v| v.to_string()));
        writer.write_record(&row)?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| CacheError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

struct Columns {
    word: usize,
    theme: Option<usize>,
    word_type: Option<usize>,
    similarity: Option<usize>,
    timestamp: Option<usize>,
    /// Dimension columns in ascending dimension order.
    dims: Vec<usize>,
}

fn locate_columns(headers: &csv::StringRecord) -> Option<Columns> {
    let find = |name: &str| headers.iter().position(|h| h.trim() == name);

    let mut dims: Vec<(usize, usize)> = headers
        .iter()
        .enumerate()
        .filter_map(|(idx, h)| {
            h.trim()
                .strip_prefix(EMBEDDING_COLUMN_PREFIX)
                .and_then(|n| n.parse::<usize>().ok())
                .map(|n| (n, idx))
        })
        .collect();
    dims.sort_unstable();

    Some(Columns {
        word: find("word")?,
        theme: find("theme"),
        word_type: find("word_type"),
        similarity: find("similarity_to_theme"),
        timestamp: find("timestamp"),
        dims: dims.into_iter().map(|(_, idx)| idx).collect(),
    })
}

/// Read a snapshot. Malformed rows are skipped with a warning.
pub fn read_snapshot(path: &Path) -> Result<Vec<EmbeddingCacheEntry>, CacheError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();

    let Some(columns) = locate_columns(&headers) else {
        tracing::warn!(file = %path.display(), "Cache file has no 'word' column, ignoring it");
        return Ok(Vec::new());
    };
    if columns.dims.is_empty() {
        return Ok(Vec::new());
    }

    // 维度以表头为准，不信任第一行数据
    let dimension = columns.dims.len();
    let mut entries = Vec::new();
    let mut skipped = 0usize;

    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                skipped += 1;
                tracing::warn!(row = line + 1, error = %e, "Skipping unreadable cache row");
                continue;
            }
        };

        match parse_row(&record, &columns) {
            Some(entry) => {
                if entry.embedding.len() != dimension {
                    skipped += 1;
                    tracing::warn!(
                        row = line + 1,
                        expected = dimension,
                        got = entry.embedding.len(),
                        "Skipping cache row with inconsistent dimension"
                    );
                    continue;
                }
                entries.push(entry);
            }
            None => {
                skipped += 1;
                tracing::warn!(row = line + 1, "Skipping malformed cache row");
            }
        }
    }

    if skipped > 0 {
        tracing::warn!(skipped, kept = entries.len(), "Cache snapshot had malformed rows");
    }
    Ok(entries)
}

fn parse_row(record: &csv::StringRecord, columns: &Columns) -> Option<EmbeddingCacheEntry> {
    let cell = |idx: Option<usize>| {
        idx.and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let word = cell(Some(columns.word))?.to_string();

    let mut embedding = Vec::with_capacity(columns.dims.len());
    for &idx in &columns.dims {
        match record.get(idx).map(str::trim) {
            Some("") | None => break,
            Some(raw) => embedding.push(raw.parse::<f32>().ok()?),
        }
    }
    if embedding.is_empty() {
        return None;
    }

    Some(EmbeddingCacheEntry {
        word,
        embedding,
        timestamp: cell(columns.timestamp)
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0),
        theme: cell(columns.theme).map(str::to_string),
        word_type: cell(columns.word_type).and_then(|s| s.parse::<WordType>().ok()),
        similarity_to_theme: cell(columns.similarity).and_then(|s| s.parse::<f32>().ok()),
    })
}
