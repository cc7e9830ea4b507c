//! Sliding window attempt tracking and its background reaper.

mod clock;
mod limiter;
mod reaper;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{AdmissionStatus, Decision, RateLimiter};
pub use reaper::{create, LimiterHandle};
pub use store::{AttemptRecord, StoreGuard, SweepStats, WindowStore};
