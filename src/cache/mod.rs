//! Bounded cache of parsed documents keyed by source path.
//!
//! An entry is only served while the source file's modification time
//! still equals the one recorded at insert.  Bounds (TTL and maximum
//! population) are enforced by [`DocumentCache::sweep`], which the
//! workspace runs on a background ticker via [`spawn_sweeper`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CacheConfig;
use crate::Document;

// ── Clock ────────────────────────────────────────────────────

/// Monotonic time source, injectable for tests.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("manual clock poisoned") += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().expect("manual clock poisoned")
    }
}

// ── Entries & stats ──────────────────────────────────────────

#[derive(Debug, Clone)]
struct CacheEntry {
    mtime: SystemTime,
    document: Arc<Document>,
    written_at: Instant,
    /// Insertion order; breaks ties between identical timestamps.
    seq: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed for exceeding the population bound.
    pub evictions: u64,
    /// Entries removed for exceeding the TTL.
    pub expirations: u64,
}

/// Outcome of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

// ── DocumentCache ────────────────────────────────────────────

#[derive(Debug)]
pub struct DocumentCache {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    stats: Mutex<CacheStats>,
    seq: AtomicU64,
    ttl: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl DocumentCache {
    pub fn new(ttl: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            seq: AtomicU64::new(0),
            ttl,
            max_entries,
            clock,
        }
    }

    pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.ttl(), config.max_entries, clock)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up `path`, validating against its current on-disk mtime.
    /// A missing or unreadable source is a miss.
    pub async fn get(&self, path: &Path) -> Option<Arc<Document>> {
        let mtime = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        match mtime {
            Some(mtime) => self.get_if_current(path, mtime),
            None => {
                self.stats.lock().expect("cache stats poisoned").misses += 1;
                None
            }
        }
    }

    /// Return the entry for `path` only if it was recorded with `mtime`.
    /// A hit refreshes the entry's write timestamp.
    pub fn get_if_current(&self, path: &Path, mtime: SystemTime) -> Option<Arc<Document>> {
        let now = self.clock.now();
        let seq = self.next_seq();
        let hit = {
            let mut entries = self.entries.lock().expect("document cache poisoned");
            match entries.get_mut(path) {
                Some(entry) if entry.mtime == mtime => {
                    entry.written_at = now;
                    entry.seq = seq;
                    Some(entry.document.clone())
                }
                _ => None,
            }
        };

        let mut stats = self.stats.lock().expect("cache stats poisoned");
        if hit.is_some() {
            stats.hits += 1;
            debug!(path = %path.display(), "document cache hit");
        } else {
            stats.misses += 1;
        }
        hit
    }

    /// Insert or overwrite the entry for `path`.
    pub fn put(&self, path: &Path, mtime: SystemTime, document: Arc<Document>) {
        let entry = CacheEntry {
            mtime,
            document,
            written_at: self.clock.now(),
            seq: self.next_seq(),
        };
        self.entries
            .lock()
            .expect("document cache poisoned")
            .insert(path.to_path_buf(), entry);
    }

    pub fn remove(&self, path: &Path) {
        self.entries
            .lock()
            .expect("document cache poisoned")
            .remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("document cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .expect("document cache poisoned")
            .contains_key(path)
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().expect("cache stats poisoned")
    }

    /// Drop entries older than the TTL, then evict oldest-first until at
    /// most `max_entries` remain.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("document cache poisoned");

        // Snapshot keys before removing anything.
        let mut by_age: Vec<(Instant, u64, PathBuf)> = entries
            .iter()
            .map(|(k, e)| (e.written_at, e.seq, k.clone()))
            .collect();
        by_age.sort();

        let mut report = SweepReport::default();
        let mut survivors = Vec::with_capacity(by_age.len());
        for (written_at, _, key) in by_age {
            if now.saturating_duration_since(written_at) > self.ttl {
                entries.remove(&key);
                report.expired += 1;
            } else {
                survivors.push(key);
            }
        }

        let excess = survivors.len().saturating_sub(self.max_entries);
        for key in survivors.into_iter().take(excess) {
            entries.remove(&key);
            report.evicted += 1;
        }
        drop(entries);

        if report.expired + report.evicted > 0 {
            let mut stats = self.stats.lock().expect("cache stats poisoned");
            stats.expirations += report.expired as u64;
            stats.evictions += report.evicted as u64;
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                "document cache swept"
            );
        }
        report
    }
}

/// Spawn the periodic sweep loop.  The first sweep happens one full
/// `every` after start; the loop exits once `cancel` fires.
pub fn spawn_sweeper(
    cache: Arc<DocumentCache>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("document cache sweeper stopped");
                    break;
                }
                _ = tick.tick() => {
                    cache.sweep();
                }
            }
        }
    })
}

// ── Tests ────────────────────────────────────────────────────
