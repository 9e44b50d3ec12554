//! Resume bookkeeping: persisted per-file receive checkpoints.
//!
//! The receiver periodically records how many bytes of a file it has
//! accepted, keyed by the stable file id (`name-size`). A record never
//! outlives its file's completion, and entries untouched for seven days
//! are swept on load.

use crate::config::RESUME_MAX_AGE;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One persisted checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeRecord {
    /// Bytes accepted for the file so far.
    pub received_size: u64,
    /// Last update, epoch milliseconds.
    pub last_updated: u64,
}

/// Current time as epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Local key-value persistence capability for resume bookkeeping.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn get(&self, file_id: &str) -> Result<Option<ResumeRecord>>;
    /// Insert or overwrite the checkpoint for `file_id`, stamping it now.
    async fn put(&self, file_id: &str, received_size: u64) -> Result<()>;
    async fn remove(&self, file_id: &str) -> Result<()>;
    /// Drop records older than `max_age`; returns how many were removed.
    async fn sweep(&self, max_age: Duration) -> Result<usize>;
}

// ── JSON file store ──────────────────────────────────────────────────────────

/// File-backed store: the whole map is rewritten as pretty JSON on every
/// mutation, which is cheap at the expected entry counts.
pub struct JsonResumeStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, ResumeRecord>>,
}

impl JsonResumeStore {
    /// Open (or create) a store at `path`, sweeping stale records.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut entries: HashMap<String, ResumeRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        event = "resume_store_parse_failure",
                        path = %path.display(),
                        error = %e,
                        "Discarding unreadable resume store"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let cutoff = now_ms().saturating_sub(RESUME_MAX_AGE.as_millis() as u64);
        let before = entries.len();
        entries.retain(|_, rec| rec.last_updated >= cutoff);
        if entries.len() != before {
            debug!(
                event = "resume_store_swept",
                removed = before - entries.len(),
                "Dropped stale resume records on load"
            );
        }

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Default location: `<home>/.meshdrop/resume.json`.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| Error::Store("no home directory".into()))?;
        Ok(home.join(".meshdrop").join("resume.json"))
    }

    /// Rewrite the store file through a temp-file-then-rename so a crash
    /// mid-write never leaves a corrupt store behind.
    async fn persist(&self, entries: &HashMap<String, ResumeRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ResumeStore for JsonResumeStore {
    async fn get(&self, file_id: &str) -> Result<Option<ResumeRecord>> {
        Ok(self.entries.lock().await.get(file_id).cloned())
    }

    async fn put(&self, file_id: &str, received_size: u64) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            file_id.to_string(),
            ResumeRecord {
                received_size,
                last_updated: now_ms(),
            },
        );
        self.persist(&entries).await
    }

    async fn remove(&self, file_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(file_id).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn sweep(&self, max_age: Duration) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, rec| rec.last_updated >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Volatile store for tests and callers that opt out of resume.
#[derive(Default)]
pub struct MemoryResumeStore {
    entries: Mutex<HashMap<String, ResumeRecord>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn get(&self, file_id: &str) -> Result<Option<ResumeRecord>> {
        Ok(self.entries.lock().await.get(file_id).cloned())
    }

    async fn put(&self, file_id: &str, received_size: u64) -> Result<()> {
        self.entries.lock().await.insert(
            file_id.to_string(),
            ResumeRecord {
                received_size,
                last_updated: now_ms(),
            },
        );
        Ok(())
    }

    async fn remove(&self, file_id: &str) -> Result<()> {
        self.entries.lock().await.remove(file_id);
        Ok(())
    }

    async fn sweep(&self, max_age: Duration) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, rec| rec.last_updated >= cutoff);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("meshdrop_test").join("resume").join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    #[tokio::test]
    async fn put_then_get_returns_latest_size() {
        let store = MemoryResumeStore::new();
        store.put("a.txt-100", 40).await.unwrap();
        store.put("a.txt-100", 60).await.unwrap();
        let rec = store.get("a.txt-100").await.unwrap().unwrap();
        assert_eq!(rec.received_size, 60);
    }

    #[tokio::test]
    async fn remove_clears_the_record() {
        let store = MemoryResumeStore::new();
        store.put("a.txt-100", 40).await.unwrap();
        store.remove("a.txt-100").await.unwrap();
        assert!(store.get("a.txt-100").await.unwrap().is_none());
        // Removing again is a no-op.
        store.remove("a.txt-100").await.unwrap();
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = test_dir("reopen");
        let path = dir.join("resume.json");

        {
            let store = JsonResumeStore::open(path.clone()).unwrap();
            store.put("b.bin-500000", 480000).await.unwrap();
        }
        let store = JsonResumeStore::open(path).unwrap();
        let rec = store.get("b.bin-500000").await.unwrap().unwrap();
        assert_eq!(rec.received_size, 480000);

        cleanup(&dir);
    }

    #[tokio::test]
    async fn json_store_leaves_no_temp_file_behind() {
        let dir = test_dir("atomic");
        let path = dir.join("resume.json");

        let store = JsonResumeStore::open(path.clone()).unwrap();
        store.put("a.txt-100", 40).await.unwrap();
        store.remove("a.txt-100").await.unwrap();

        assert!(path.exists());
        assert!(
            !path.with_extension("json.tmp").exists(),
            "rename must consume the temp file"
        );

        cleanup(&dir);
    }

    #[tokio::test]
    async fn sweep_drops_only_stale_records() {
        let store = MemoryResumeStore::new();
        store.put("fresh-1", 10).await.unwrap();
        {
            let mut entries = store.entries.lock().await;
            entries.insert(
                "stale-1".into(),
                ResumeRecord {
                    received_size: 5,
                    last_updated: now_ms() - RESUME_MAX_AGE.as_millis() as u64 - 1000,
                },
            );
        }
        let removed = store.sweep(RESUME_MAX_AGE).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("fresh-1").await.unwrap().is_some());
        assert!(store.get("stale-1").await.unwrap().is_none());
    }
}
