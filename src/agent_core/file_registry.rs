//! File Registry — content-hash ledger for file reads.
//!
//! Records the SHA-256 of each file's content the first time a tool reads it.
//! A later read whose hash matches is annotated as unchanged in tool feedback.
//! The registry never blocks or replaces an actual read.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Annotation appended to feedback for a re-read of unchanged content.
pub const UNCHANGED_NOTE: &str = "[unchanged since last read]";

#[derive(Debug, Clone)]
struct FileRegistryEntry {
    content_hash: String,
    last_access: DateTime<Utc>,
}

/// What the registry concluded about one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadObservation {
    pub hash: String,
    /// The path was known and its hash matched the previous read.
    pub unchanged: bool,
}

#[derive(Debug, Default)]
pub struct FileRegistry {
    entries: Mutex<HashMap<String, FileRegistryEntry>>,
}

/// Lowercase hex SHA-256 of `content`.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FileRegistryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_known(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    /// Record `content` for `path` and return its hash.
    pub fn register(&self, path: &str, content: &str) -> String {
        self.observe(path, content).hash
    }

    /// Record a read and report whether it matched the previous one.
    pub fn observe(&self, path: &str, content: &str) -> ReadObservation {
        let hash = content_hash(content);
        let mut entries = self.lock();
        let now = Utc::now();

        let unchanged = match entries.get_mut(path) {
            Some(entry) if entry.content_hash == hash => {
                entry.last_access = now;
                true
            }
            Some(entry) => {
                tracing::debug!(path, "file content changed since last read");
                entry.content_hash = hash.clone();
                entry.last_access = now;
                false
            }
            None => {
                entries.insert(
                    path.to_string(),
                    FileRegistryEntry {
                        content_hash: hash.clone(),
                        last_access: now,
                    },
                );
                false
            }
        };

        ReadObservation { hash, unchanged }
    }

    /// When `path` was last read, if ever.
    pub fn last_access(&self, path: &str) -> Option<DateTime<Utc>> {
        self.lock().get(path).map(|e| e.last_access)
    }

    /// Forget a path (after a write changes it).
    pub fn forget(&self, path: &str) {
        self.lock().remove(path);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_first_read_is_not_unchanged() {
        let registry = FileRegistry::new();
        assert!(!registry.is_known("src/main.rs"));
        let obs = registry.observe("src/main.rs", "fn main() {}");
        assert!(!obs.unchanged);
        assert!(registry.is_known("src/main.rs"));
    }

    #[test]
    fn test_reread_same_content_is_unchanged() {
        let registry = FileRegistry::new();
        let hash = registry.register("a.txt", "hello");
        let obs = registry.observe("a.txt", "hello");
        assert!(obs.unchanged);
        assert_eq!(obs.hash, hash);
    }

    #[test]
    fn test_reread_changed_content_updates_hash() {
        let registry = FileRegistry::new();
        registry.register("a.txt", "v1");
        assert!(!registry.observe("a.txt", "v2").unchanged);
        assert!(registry.observe("a.txt", "v2").unchanged);
    }

    #[test]
    fn test_forget_and_clear() {
        let registry = FileRegistry::new();
        registry.register("a.txt", "x");
        registry.register("b.txt", "y");
        registry.forget("a.txt");
        assert!(!registry.is_known("a.txt"));
        assert!(registry.last_access("b.txt").is_some());
        registry.clear();
        assert!(registry.is_empty());
    }
}
