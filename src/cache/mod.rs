//! Memoization of vectorizer output keyed by token-sequence hash.
//!
//! Entries expire after `ttl` without access. When a `put` brings the cache
//! to capacity, a cleanup pass drops expired entries first, then the least
//! recently accessed ones, and the result is written to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

/// On-disk form: `{"entries": {hash: [..]}, "accessTimes": {hash: "RFC3339"}}`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    entries: HashMap<String, Vec<f64>>,
    #[serde(default)]
    access_times: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Vec<f64>>,
    access_times: HashMap<String, DateTime<Utc>>,
    hits: u64,
    misses: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.access_times.remove(key);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.clone(),
            access_times: self.access_times.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct VectorCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
    path: Option<PathBuf>,
}

impl VectorCache {
    /// An in-memory cache with no persistence.
    pub fn in_memory(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
            path: None,
        }
    }

    /// Open the cache described by `config`, restoring any persisted state.
    /// A missing or unreadable snapshot yields an empty cache.
    pub fn open(config: &CacheConfig) -> Self {
        let ttl = config.ttl().unwrap_or(Duration::MAX);
        let mut cache = Self::in_memory(config.capacity, ttl);
        cache.path = config.path.clone();

        if let Some(path) = &cache.path {
            match load_snapshot(path) {
                Ok(Some(snap)) => {
                    let mut inner = cache.inner.lock();
                    // Entries without an access time cannot be aged; drop them.
                    for (key, vector) in snap.entries {
                        if let Some(t) = snap.access_times.get(&key) {
                            inner.access_times.insert(key.clone(), *t);
                            inner.entries.insert(key, vector);
                        }
                    }
                    info!(path = %path.display(), entries = inner.entries.len(), "loaded vector cache");
                }
                Ok(None) => debug!(path = %path.display(), "no vector cache on disk"),
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable vector cache"),
            }
        }
        cache
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    pub fn get(&self, tokens: &[String]) -> Option<Vec<f64>> {
        self.get_at(tokens, Utc::now())
    }

    /// Look up a vector, refreshing its access time on a hit. An entry idle
    /// for longer than the TTL is dropped and reported as a miss.
    pub fn get_at(&self, tokens: &[String], now: DateTime<Utc>) -> Option<Vec<f64>> {
        let key = cache_key(tokens);
        let mut inner = self.inner.lock();

        let expired = match inner.access_times.get(&key) {
            Some(last) => now - *last > self.ttl,
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if expired {
            inner.remove(&key);
            inner.misses += 1;
            return None;
        }

        let vector = inner.entries.get(&key).cloned();
        if vector.is_some() {
            inner.access_times.insert(key, now);
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        vector
    }

    pub fn put(&self, tokens: &[String], vector: Vec<f64>) {
        self.put_at(tokens, vector, Utc::now())
    }

    pub fn put_at(&self, tokens: &[String], vector: Vec<f64>, now: DateTime<Utc>) {
        let key = cache_key(tokens);
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.entries.insert(key.clone(), vector);
            inner.access_times.insert(key, now);

            if inner.entries.len() < self.capacity {
                return;
            }
            let evict = eviction_plan(&inner.access_times, self.capacity, self.ttl, now);
            for key in &evict {
                inner.remove(key);
            }
            debug!(evicted = evict.len(), remaining = inner.entries.len(), "vector cache cleanup");
            inner.snapshot()
        };
        self.persist(&snapshot);
    }

    /// Drop every entry and persist the empty cache.
    pub fn clear(&self) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.entries.clear();
            inner.access_times.clear();
            inner.snapshot()
        };
        self.persist(&snapshot);
        info!("vector cache cleared");
    }

    /// Write the current contents to disk.
    pub fn flush(&self) {
        let snapshot = self.inner.lock().snapshot();
        self.persist(&snapshot);
    }

    fn persist(&self, snapshot: &Snapshot) {
        let Some(path) = &self.path else {
            return;
        };
        match save_snapshot(path, snapshot) {
            Ok(()) => debug!(path = %path.display(), entries = snapshot.entries.len(), "saved vector cache"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to save vector cache"),
        }
    }
}

/// Hex SHA-256 of the space-joined tokens.
pub fn cache_key(tokens: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tokens.join(" ").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keys to remove so the cache ends at or under `capacity`: every entry idle
/// longer than `ttl`, then the least recently accessed survivors.
fn eviction_plan(
    access_times: &HashMap<String, DateTime<Utc>>,
    capacity: usize,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    let (mut expired, mut live): (Vec<_>, Vec<_>) = access_times
        .iter()
        .map(|(k, t)| (k.clone(), *t))
        .partition(|(_, t)| now - *t > ttl);

    if live.len() > capacity {
        live.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let excess = live.len() - capacity;
        expired.extend(live.drain(..excess));
    }
    expired.into_iter().map(|(k, _)| k).collect()
}

fn load_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let snap = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(snap))
}

fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}
