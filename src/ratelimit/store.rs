//! Per-identifier attempt history and the store that owns it.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Accepted attempts for a single identifier, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptRecord {
    timestamps: VecDeque<Instant>,
}

impl AttemptRecord {
    /// Create an empty record with room for `capacity` attempts.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(capacity),
        }
    }

    /// Drop every attempt older than `window` as seen from `now`.
    ///
    /// An attempt is expired only when its age is strictly greater than the
    /// window; one exactly `window` old still counts. Returns the number of
    /// attempts removed.
    pub fn prune_expired(&mut self, now: Instant, window: Duration) -> usize {
        // Timestamps are appended in arrival order, so the expired ones form a prefix.
        let expired = self
            .timestamps
            .partition_point(|&t| now.saturating_duration_since(t) > window);
        self.timestamps.drain(..expired);
        expired
    }

    /// Record an accepted attempt.
    ///
    /// A clock that reads earlier than the newest entry is clamped to it so
    /// the sequence stays ordered.
    pub fn record(&mut self, now: Instant) {
        let at = match self.timestamps.back() {
            Some(&last) if last > now => last,
            _ => now,
        };
        self.timestamps.push_back(at);
    }

    /// The oldest attempt still held.
    pub fn oldest(&self) -> Option<Instant> {
        self.timestamps.front().copied()
    }

    /// Number of attempts held.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether no attempts are held.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Iterate over the held attempts, oldest first.
    pub fn timestamps(&self) -> impl Iterator<Item = &Instant> {
        self.timestamps.iter()
    }
}

/// Outcome of pruning the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Identifiers examined
    pub scanned: usize,
    /// Timestamps removed
    pub pruned: usize,
    /// Identifiers removed because they had no attempts left
    pub evicted: usize,
}

/// Mapping from identifier to its attempt record behind one exclusive lock.
///
/// Every read-modify-write of any record happens while holding the
/// [`StoreGuard`] returned by [`WindowStore::lock`].
#[derive(Debug, Default)]
pub struct WindowStore {
    records: Mutex<HashMap<String, AttemptRecord>>,
    record_capacity: usize,
}

impl WindowStore {
    /// Create an empty store. New records pre-allocate `record_capacity` slots.
    pub fn new(record_capacity: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            record_capacity,
        }
    }

    /// Acquire the store-wide lock.
    pub fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            records: self.records.lock(),
            record_capacity: self.record_capacity,
        }
    }
}

/// Exclusive access to a [`WindowStore`].
pub struct StoreGuard<'a> {
    records: MutexGuard<'a, HashMap<String, AttemptRecord>>,
    record_capacity: usize,
}

impl StoreGuard<'_> {
    /// Return the record for `id`, inserting an empty one if it is unseen.
    pub fn get_or_create(&mut self, id: &str) -> &mut AttemptRecord {
        let capacity = self.record_capacity;
        match self.records.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(id = %entry.key(), "Tracking new identifier");
                entry.insert(AttemptRecord::with_capacity(capacity))
            }
        }
    }

    /// The record for `id`, if one exists.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut AttemptRecord> {
        self.records.get_mut(id)
    }

    /// Prune every record. With `evict_idle`, records left empty are removed.
    pub fn sweep(&mut self, now: Instant, window: Duration, evict_idle: bool) -> SweepStats {
        let mut stats = SweepStats {
            scanned: self.records.len(),
            ..Default::default()
        };

        self.records.retain(|_, record| {
            stats.pruned += record.prune_expired(now, window);
            let keep = !(evict_idle && record.is_empty());
            if !keep {
                stats.evicted += 1;
            }
            keep
        });

        stats
    }

    /// Number of identifiers tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no identifiers are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every identifier.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
