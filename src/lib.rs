//! Turnstile - Sliding Window Attempt Limiter
//!
//! This crate tracks recent attempts per client identifier (for example an
//! IP address) and decides whether a new attempt may proceed, capping
//! admissions within a trailing time window. A background reaper prunes
//! expired state so memory stays bounded.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use ratelimit::{create, LimiterHandle, RateLimiter};
