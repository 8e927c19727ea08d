//! Result Cache — time-boxed memoization of read-only tool outputs.
//!
//! Keyed by `(tool_name, serialized_parameters)`. Entries older than the TTL
//! are treated as absent. When the store is full, the entry inserted longest
//! ago is evicted regardless of how often it was hit (insertion order, not
//! access order).
//!
//! Each entry remembers the workspace paths its call read. A write drops
//! every entry whose path overlaps the written one in either direction, so
//! a listing of `src` goes stale when `src/new.rs` is created and a read of
//! `src/a.rs` goes stale when `src` is removed. Entries with no path cover
//! the whole project.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default time-to-live for cached results.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Default entry ceiling.
pub const DEFAULT_CAPACITY: usize = 50;

type CacheKey = (String, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    result: String,
    paths: Vec<String>,
    inserted_at: Instant,
    hit_count: u32,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Keys from oldest to newest insertion.
    order: VecDeque<CacheKey>,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// Thread-safe result cache shared by concurrent read-only executions.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock cannot leave a torn entry: every
        // mutation is a single insert/remove pair.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, tool: &str, params: &str) -> Option<String> {
        self.get_at(tool, params, Instant::now())
    }

    pub fn put(&self, tool: &str, params: &str, result: impl Into<String>) {
        self.put_at(tool, params, &[], result.into(), Instant::now());
    }

    /// Insert a result along with the paths the call read.
    pub fn put_with_paths(
        &self,
        tool: &str,
        params: &str,
        paths: &[&str],
        result: impl Into<String>,
    ) {
        self.put_at(tool, params, paths, result.into(), Instant::now());
    }

    /// Lookup against an explicit clock reading.
    pub fn get_at(&self, tool: &str, params: &str, now: Instant) -> Option<String> {
        let key = (tool.to_string(), params.to_string());
        let mut state = self.lock();

        let expired = match state.entries.get(&key) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.inserted_at) > self.ttl,
        };
        if expired {
            state.remove(&key);
            tracing::debug!(tool, "cache entry expired");
            return None;
        }

        let entry = state.entries.get_mut(&key)?;
        entry.hit_count += 1;
        tracing::debug!(tool, hits = entry.hit_count, "cache hit");
        Some(entry.result.clone())
    }

    /// Insert against an explicit clock reading. Re-inserting a key refreshes
    /// its timestamp and moves it to the newest position.
    pub fn put_at(
        &self,
        tool: &str,
        params: &str,
        paths: &[&str],
        result: String,
        now: Instant,
    ) {
        let key = (tool.to_string(), params.to_string());
        let mut state = self.lock();

        if state.entries.contains_key(&key) {
            state.remove(&key);
        }
        state.entries.insert(
            key.clone(),
            CacheEntry {
                result,
                paths: paths.iter().map(|p| normalize(p).to_string()).collect(),
                inserted_at: now,
                hit_count: 0,
            },
        );
        state.order.push_back(key);

        while state.entries.len() > self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            tracing::debug!(tool = %oldest.0, "cache eviction");
        }
    }

    /// Drop entries whose paths overlap `path`. Returns how many.
    pub fn invalidate_path(&self, path: &str) -> usize {
        let written = normalize(path);
        let mut state = self.lock();
        let stale: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.paths.is_empty() || entry.paths.iter().any(|p| overlaps(p, written))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            state.remove(key);
        }
        stale.len()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strip `./` prefixes and trailing slashes. The project root becomes "".
fn normalize(path: &str) -> &str {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p == "." {
        ""
    } else {
        p
    }
}

/// True when one path equals the other or lies beneath it.
fn overlaps(a: &str, b: &str) -> bool {
    a.is_empty() || b.is_empty() || a == b || is_under(a, b) || is_under(b, a)
}

fn is_under(child: &str, parent: &str) -> bool {
    child
        .strip_prefix(parent)
        .is_some_and(|rest| rest.starts_with('/'))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_within_ttl() {
        let cache = ResultCache::default();
        let t0 = Instant::now();
        cache.put_at("read_file", "a.rs", &[], "fn main() {}".into(), t0);
        assert_eq!(
            cache.get_at("read_file", "a.rs", t0 + Duration::from_secs(119)).as_deref(),
            Some("fn main() {}")
        );
    }

    #[test]
    fn test_absent_after_ttl() {
        let cache = ResultCache::default();
        let t0 = Instant::now();
        cache.put_at("read_file", "a.rs", &[], "x".into(), t0);
        let later = t0 + DEFAULT_TTL + Duration::from_secs(1);
        assert!(cache.get_at("read_file", "a.rs", later).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_includes_tool_name() {
        let cache = ResultCache::default();
        cache.put("read_file", "a.rs", "content");
        assert!(cache.get("list_files", "a.rs").is_none());
    }

    #[test]
    fn test_evicts_oldest_insertion_not_least_used() {
        let cache = ResultCache::new(DEFAULT_TTL, 3);
        let t0 = Instant::now();
        cache.put_at("t", "1", &[], "one".into(), t0);
        cache.put_at("t", "2", &[], "two".into(), t0);
        cache.put_at("t", "3", &[], "three".into(), t0);

        // Heavily used, still oldest by insertion.
        for _ in 0..5 {
            assert!(cache.get_at("t", "1", t0).is_some());
        }
        cache.put_at("t", "4", &[], "four".into(), t0);

        assert_eq!(cache.len(), 3);
        assert!(cache.get_at("t", "1", t0).is_none());
        assert!(cache.get_at("t", "2", t0).is_some());
        assert!(cache.get_at("t", "4", t0).is_some());
    }

    #[test]
    fn test_reinsert_moves_to_newest() {
        let cache = ResultCache::new(DEFAULT_TTL, 2);
        let t0 = Instant::now();
        cache.put_at("t", "1", &[], "one".into(), t0);
        cache.put_at("t", "2", &[], "two".into(), t0);
        cache.put_at("t", "1", &[], "one again".into(), t0);
        cache.put_at("t", "3", &[], "three".into(), t0);

        assert!(cache.get_at("t", "2", t0).is_none());
        assert_eq!(cache.get_at("t", "1", t0).as_deref(), Some("one again"));
    }

    #[test]
    fn test_invalidate_path_and_clear() {
        let cache = ResultCache::default();
        cache.put_with_paths("read_file", "lib", &["src/lib.rs"], "old");
        cache.put_with_paths("read_file", "main", &["src/main.rs"], "main");
        assert_eq!(cache.invalidate_path("src/lib.rs"), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_write_under_listed_directory_invalidates_listing() {
        let cache = ResultCache::default();
        cache.put_with_paths("list_files", "src", &["src"], "src/main.rs");
        cache.put_with_paths("list_files", "docs", &["./docs/"], "docs/guide.md");

        assert_eq!(cache.invalidate_path("src/health.rs"), 1);
        assert!(cache.get("list_files", "src").is_none());
        assert!(cache.get("list_files", "docs").is_some());
    }

    #[test]
    fn test_removed_directory_invalidates_reads_beneath_it() {
        let cache = ResultCache::default();
        cache.put_with_paths("read_file", "a", &["src/a.rs"], "a");
        cache.put_with_paths("read_file", "b", &["src/nested/b.rs"], "b");
        cache.put_with_paths("read_file", "c", &["srcx/c.rs"], "c");

        assert_eq!(cache.invalidate_path("./src/"), 2);
        assert!(cache.get("read_file", "c").is_some());
    }

    #[test]
    fn test_root_and_pathless_entries_go_stale_on_any_write() {
        let cache = ResultCache::default();
        cache.put_with_paths("list_files", "root", &["."], "Cargo.toml");
        cache.put("search", "fn main", "src/main.rs:1");
        cache.put_with_paths("read_file", "readme", &["README.md"], "# hi");

        assert_eq!(cache.invalidate_path("src/main.rs"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("read_file", "readme").is_some());
    }

    #[test]
    fn test_concurrent_puts_are_not_torn() {
        let cache = std::sync::Arc::new(ResultCache::new(DEFAULT_TTL, 1000));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let cache = std::sync::Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.put("t", &format!("{n}-{i}"), format!("v{n}-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
        assert_eq!(cache.get("t", "3-7").as_deref(), Some("v3-7"));
    }
}
