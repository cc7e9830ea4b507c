//! Background sweep task and the handle that owns it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{LimiterConfig, MAX_CLEANUP_INTERVAL_SECS};
use crate::error::Result;

use super::limiter::{AdmissionStatus, RateLimiter};

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_INTERVAL: Duration = Duration::from_secs(MAX_CLEANUP_INTERVAL_SECS);

/// Build a limiter from `config` and start its reaper.
///
/// Must be called from within a tokio runtime.
pub fn create(config: LimiterConfig) -> Result<LimiterHandle> {
    let limiter = Arc::new(RateLimiter::new(config)?);
    let interval = limiter.config().cleanup_interval();
    Ok(LimiterHandle::spawn(limiter, interval))
}

/// A running limiter together with its reaper task.
///
/// Dropping the handle signals the reaper to stop; use
/// [`LimiterHandle::shutdown`] to also wait for it to exit.
pub struct LimiterHandle {
    limiter: Arc<RateLimiter>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LimiterHandle {
    /// Start a reaper that sweeps `limiter` every `interval`.
    ///
    /// The first sweep happens one full interval after this call. The
    /// interval is clamped to between one millisecond and one year.
    pub fn spawn(limiter: Arc<RateLimiter>, interval: Duration) -> Self {
        let interval = interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
        let (stop, stop_rx) = watch::channel(false);
        let now = Instant::now();
        let start = now.checked_add(interval).unwrap_or(now);
        let task = tokio::spawn(run_reaper(Arc::clone(&limiter), start, interval, stop_rx));

        Self {
            limiter,
            stop,
            task: Some(task),
        }
    }

    /// The shared limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// See [`RateLimiter::check`].
    pub fn check(&self, id: &str) -> Result<AdmissionStatus> {
        self.limiter.check(id)
    }

    /// See [`RateLimiter::is_allowed`].
    pub fn is_allowed(&self, id: &str) -> Result<bool> {
        self.limiter.is_allowed(id)
    }

    /// Stop the reaper and wait for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Reaper task did not exit cleanly");
            }
        }
    }
}

impl Drop for LimiterHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

async fn run_reaper(
    limiter: Arc<RateLimiter>,
    start: Instant,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Reaper started");

    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                limiter.sweep();
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    info!("Reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const INTERVAL: Duration = Duration::from_secs(300);

    fn spawn_manual(config: LimiterConfig) -> (LimiterHandle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::with_clock(config, clock.clone()).unwrap());
        (LimiterHandle::spawn(limiter, INTERVAL), clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_sweeps_after_interval() {
        let (handle, clock) = spawn_manual(LimiterConfig::default());

        assert!(handle.is_allowed("10.0.0.1").unwrap());
        clock.advance(Duration::from_secs(61));

        tokio::time::sleep(INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(handle.limiter().tracked_identifiers(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.limiter().tracked_identifiers(), 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_keeps_idle_records_when_eviction_disabled() {
        let config = LimiterConfig {
            evict_idle: false,
            ..Default::default()
        };
        let (handle, clock) = spawn_manual(config);

        handle.is_allowed("10.0.0.1").unwrap();
        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(INTERVAL * 2 + Duration::from_secs(1)).await;

        assert_eq!(handle.limiter().tracked_identifiers(), 1);
        assert_eq!(handle.limiter().attempts("10.0.0.1"), 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_reaper() {
        let (handle, clock) = spawn_manual(LimiterConfig::default());
        let limiter = Arc::clone(handle.limiter());

        limiter.is_allowed("10.0.0.1").unwrap();
        clock.advance(Duration::from_secs(61));
        drop(handle);

        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(limiter.tracked_identifiers(), 1);
    }

    #[tokio::test]
    async fn test_create_and_shutdown() {
        let handle = create(LimiterConfig::default()).unwrap();

        for _ in 0..10 {
            assert!(handle.is_allowed("10.0.0.1").unwrap());
        }
        assert!(!handle.check("10.0.0.1").unwrap().is_allowed());

        let limiter = Arc::clone(handle.limiter());
        handle.shutdown().await;

        // The limiter outlives its reaper.
        assert_eq!(limiter.attempts("10.0.0.1"), 10);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let config = LimiterConfig {
            cleanup_interval_secs: 0,
            ..Default::default()
        };
        assert!(create(config).is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_overflowing_interval() {
        let config = LimiterConfig {
            cleanup_interval_secs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            create(config),
            Err(crate::error::TurnstileError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_clamps_extreme_intervals() {
        let limiter = Arc::new(RateLimiter::new(LimiterConfig::default()).unwrap());

        let handle = LimiterHandle::spawn(Arc::clone(&limiter), Duration::MAX);
        assert!(handle.is_allowed("10.0.0.1").unwrap());
        handle.shutdown().await;

        let handle = LimiterHandle::spawn(Arc::clone(&limiter), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.shutdown().await;

        assert_eq!(limiter.attempts("10.0.0.1"), 1);
    }
}
