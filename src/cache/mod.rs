pub mod snapshot;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("snapshot task failed: {0}")]
    Join(String),
    #[error("embedding dimension mismatch for '{word}': expected {expected}, got {actual}")]
    DimensionMismatch {
        word: String,
        expected: usize,
        actual: usize,
    },
}

/// Lookup key for a word: trimmed and lowercased.
pub fn normalize_key(word: &str) -> String {
    word.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordType {
    Theme,
    SelectedWord,
    Candidate,
}

impl WordType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Theme => "theme",
            Self::SelectedWord => "selected_word",
            Self::Candidate => "candidate",
        }
    }
}

impl fmt::Display for WordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "theme" => Ok(Self::Theme),
            "selected_word" => Ok(Self::SelectedWord),
            "candidate" => Ok(Self::Candidate),
            other => Err(format!("unknown word type '{other}'")),
        }
    }
}

/// Provenance recorded alongside a cached vector. Not needed for lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryMetadata {
    pub theme: Option<String>,
    pub word_type: Option<WordType>,
    pub similarity_to_theme: Option<f32>,
}

impl EntryMetadata {
    pub fn theme_word(theme: &str) -> Self {
        Self {
            theme: Some(theme.to_string()),
            word_type: Some(WordType::Theme),
            similarity_to_theme: None,
        }
    }

    pub fn scored(theme: &str, word_type: WordType, similarity: f32) -> Self {
        Self {
            theme: Some(theme.to_string()),
            word_type: Some(word_type),
            similarity_to_theme: Some(similarity),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCacheEntry {
    /// Original casing, kept for display and snapshots.
    pub word: String,
    pub embedding: Vec<f32>,
    /// Unix seconds.
    pub timestamp: f64,
    pub theme: Option<String>,
    pub word_type: Option<WordType>,
    pub similarity_to_theme: Option<f32>,
}

impl EmbeddingCacheEntry {
    pub fn new(word: &str, embedding: Vec<f32>, metadata: EntryMetadata) -> Self {
        Self {
            word: word.to_string(),
            embedding,
            timestamp: unix_now_secs(),
            theme: metadata.theme,
            word_type: metadata.word_type,
            similarity_to_theme: metadata.similarity_to_theme,
        }
    }

    pub fn key(&self) -> String {
        normalize_key(&self.word)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub cache_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub backups: u64,
    pub hit_rate: f64,
    pub total_requests: u64,
    /// Unix millis of the last successful backup, 0 if none.
    pub last_backup_ms: i64,
    pub cache_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Written { entries: usize },
    Skipped,
}

/// Word → vector store shared by every worker, snapshotted to CSV.
#[derive(Debug)]
pub struct EmbeddingCache {
    cache_file: PathBuf,
    entries: RwLock<HashMap<String, EmbeddingCacheEntry>>,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    backups: AtomicU64,
    last_backup_ms: AtomicI64,
    // 串行化快照写入，避免定时备份与关闭时的最终备份交错写同一个文件
    backup_lock: Mutex<()>,
}

impl EmbeddingCache {
    pub fn new(cache_file: impl Into<PathBuf>) -> Self {
        Self {
            cache_file: cache_file.into(),
            entries: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            backups: AtomicU64::new(0),
            last_backup_ms: AtomicI64::new(0),
            backup_lock: Mutex::new(()),
        }
    }

    /// Create the cache and load any existing snapshot.
    pub async fn open(cache_file: impl Into<PathBuf>) -> Self {
        let cache = Self::new(cache_file);
        let loaded = cache.load_from_disk().await;
        tracing::info!(
            entries = loaded,
            file = %cache.cache_file.display(),
            "Embedding cache initialized"
        );
        cache
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    pub async fn get(&self, word: &str) -> Option<Vec<f32>> {
        let key = normalize_key(word);
        let found = self
            .entries
            .read()
            .await
            .get(&key)
            .map(|e| e.embedding.clone());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(word, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(word, "Cache miss");
        }
        found
    }

    pub async fn get_batch<S: AsRef<str>>(&self, words: &[S]) -> Vec<Option<Vec<f32>>> {
        let results: Vec<Option<Vec<f32>>> = {
            let map = self.entries.read().await;
            words
                .iter()
                .map(|w| {
                    map.get(&normalize_key(w.as_ref()))
                        .map(|e| e.embedding.clone())
                })
                .collect()
        };

        let hits = results.iter().filter(|r| r.is_some()).count() as u64;
        let misses = results.len() as u64 - hits;
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
        tracing::debug!(hits, total = results.len(), "Batch cache lookup");
        results
    }

    pub async fn get_entry(&self, word: &str) -> Option<EmbeddingCacheEntry> {
        self.entries.read().await.get(&normalize_key(word)).cloned()
    }

    /// Upsert by normalized key; last write wins.
    pub async fn put(&self, word: &str, embedding: Vec<f32>, metadata: EntryMetadata) {
        let entry = EmbeddingCacheEntry::new(word, embedding, metadata);
        self.entries.write().await.insert(entry.key(), entry);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    pub async fn put_batch<I>(&self, items: I)
    where
        I: IntoIterator<Item = (String, Vec<f32>, EntryMetadata)>,
    {
        let entries: Vec<EmbeddingCacheEntry> = items
            .into_iter()
            .map(|(word, embedding, metadata)| EmbeddingCacheEntry::new(&word, embedding, metadata))
            .collect();
        if entries.is_empty() {
            return;
        }

        let count = entries.len() as u64;
        {
            let mut map = self.entries.write().await;
            for entry in entries {
                map.insert(entry.key(), entry);
            }
        }
        self.writes.fetch_add(count, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        tracing::debug!(count, "Batch cached embeddings");
    }

    pub async fn contains(&self, word: &str) -> bool {
        self.entries.read().await.contains_key(&normalize_key(word))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.dirty.store(true, Ordering::Release);
        tracing::info!("Cache cleared");
    }

    /// Write a point-in-time snapshot to the cache file (temp file, then rename).
    pub async fn backup_to_disk(&self) -> Result<BackupOutcome, CacheError> {
        let _guard = self.backup_lock.lock().await;

        let was_dirty = self.dirty.swap(false, Ordering::AcqRel);
        let snapshot: Vec<EmbeddingCacheEntry> =
            self.entries.read().await.values().cloned().collect();

        // 空缓存且从未写入：不要用空文件覆盖磁盘上已有的快照
        if snapshot.is_empty() && !was_dirty {
            tracing::debug!("Empty cache, skipping backup");
            return Ok(BackupOutcome::Skipped);
        }

        let path = self.cache_file.clone();
        let count = snapshot.len();
        let written = tokio::task::spawn_blocking(move || snapshot::write_snapshot(&path, &snapshot))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))
            .and_then(|r| r);

        match written {
            Ok(()) => {
                self.backups.fetch_add(1, Ordering::Relaxed);
                self.last_backup_ms
                    .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
                tracing::debug!(entries = count, "Backed up embedding cache");
                Ok(BackupOutcome::Written { entries: count })
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Back up only when something changed since the last snapshot.
    pub async fn backup_if_dirty(&self) -> Result<BackupOutcome, CacheError> {
        if !self.is_dirty() {
            return Ok(BackupOutcome::Skipped);
        }
        self.backup_to_disk().await
    }

    /// Merge the on-disk snapshot into memory. Never fails: a missing or
    /// unreadable file leaves the cache empty and logs a warning.
    pub async fn load_from_disk(&self) -> usize {
        let path = self.cache_file.clone();
        if !path.exists() {
            tracing::info!(file = %path.display(), "No existing cache file, starting empty");
            return 0;
        }

        let loaded = tokio::task::spawn_blocking(move || snapshot::read_snapshot(&path)).await;
        let entries = match loaded {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to load cache snapshot, starting empty");
                return 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cache load task failed, starting empty");
                return 0;
            }
        };

        let count = entries.len();
        let mut map = self.entries.write().await;
        for entry in entries {
            map.insert(entry.key(), entry);
        }
        tracing::info!(loaded = count, "Loaded embeddings from cache file");
        count
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        CacheStats {
            cache_size: self.len().await,
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            backups: self.backups.load(Ordering::Relaxed),
            hit_rate: if total_requests > 0 {
                hits as f64 / total_requests as f64
            } else {
                0.0
            },
            total_requests,
            last_backup_ms: self.last_backup_ms.load(Ordering::Relaxed),
            cache_file: self.cache_file.display().to_string(),
        }
    }
}

pub(crate) fn unix_now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
