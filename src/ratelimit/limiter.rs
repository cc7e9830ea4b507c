//! Sliding window admission check.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};

use super::clock::{Clock, SystemClock};
use super::store::{SweepStats, WindowStore};

/// Upper bound on the slots pre-allocated for a new record.
const RECORD_PREALLOC_LIMIT: usize = 32;

/// The binary outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The attempt was admitted and recorded
    Allowed,
    /// The identifier is at its cap; nothing was recorded
    Rejected,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allowed => write!(f, "ALLOW"),
            Decision::Rejected => write!(f, "DENY"),
        }
    }
}

/// Result of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionStatus {
    /// Whether the attempt was admitted
    pub decision: Decision,
    /// Admissions still available in the current window after this check
    pub remaining: usize,
    /// Time until the oldest counted attempt leaves the window, set on rejection
    pub retry_after: Option<Duration>,
}

impl AdmissionStatus {
    /// Whether the attempt was admitted.
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allowed
    }
}

/// Tracks attempts per identifier and caps admissions within a trailing window.
///
/// This struct is thread-safe and can be shared across threads and tasks.
/// Every check runs its lookup, prune, decide and append steps under the
/// store's single lock, so concurrent checks for one identifier can never
/// jointly exceed the cap.
pub struct RateLimiter {
    store: WindowStore,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter reading time from the system clock.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: WindowStore::new(config.max_attempts.min(RECORD_PREALLOC_LIMIT)),
            config,
            clock,
        })
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Check whether `id` may make another attempt now, recording it if so.
    ///
    /// Rejected attempts are never recorded. Fails only when the identifier
    /// is empty or longer than `max_identifier_len` bytes.
    pub fn check(&self, id: &str) -> Result<AdmissionStatus> {
        self.validate_identifier(id)?;

        let now = self.clock.now();
        let window = self.config.window();
        let max_attempts = self.config.max_attempts;

        let mut store = self.store.lock();
        let record = store.get_or_create(id);
        record.prune_expired(now, window);
        let count = record.len();

        trace!(id = %id, count = count, max_attempts = max_attempts, "Checking attempt");

        if count >= max_attempts {
            let retry_after = record
                .oldest()
                .map(|oldest| window.saturating_sub(now.saturating_duration_since(oldest)));
            debug!(id = %id, count = count, ?retry_after, "Attempt limit exceeded");
            return Ok(AdmissionStatus {
                decision: Decision::Rejected,
                remaining: 0,
                retry_after,
            });
        }

        record.record(now);
        Ok(AdmissionStatus {
            decision: Decision::Allowed,
            remaining: max_attempts - count - 1,
            retry_after: None,
        })
    }

    /// Check whether `id` may make another attempt now, recording it if so.
    pub fn is_allowed(&self, id: &str) -> Result<bool> {
        self.check(id).map(|status| status.is_allowed())
    }

    /// Number of attempts by `id` still inside the window.
    pub fn attempts(&self, id: &str) -> usize {
        let now = self.clock.now();
        let mut store = self.store.lock();
        store
            .get_mut(id)
            .map(|record| {
                record.prune_expired(now, self.config.window());
                record.len()
            })
            .unwrap_or(0)
    }

    /// Prune expired attempts of every identifier, evicting idle ones when
    /// `evict_idle` is set.
    pub fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let stats = self
            .store
            .lock()
            .sweep(now, self.config.window(), self.config.evict_idle);

        debug!(
            scanned = stats.scanned,
            pruned = stats.pruned,
            evicted = stats.evicted,
            "Sweep complete"
        );
        stats
    }

    /// Number of identifiers currently tracked.
    pub fn tracked_identifiers(&self) -> usize {
        self.store.lock().len()
    }

    /// Forget every identifier.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.lock().clear();
    }

    fn validate_identifier(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(TurnstileError::EmptyIdentifier);
        }
        if id.len() > self.config.max_identifier_len {
            return Err(TurnstileError::IdentifierTooLong {
                len: id.len(),
                max: self.config.max_identifier_len,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // No store access here: the caller may already hold the lock.
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
