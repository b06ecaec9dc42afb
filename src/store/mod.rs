//! Admission storage backends.
//!
//! Two backends implement the [`Store`] contract:
//!
//! - **Memory**: an in-process, mutex-guarded counter map for
//!   single-instance deployments (fixed-window only).
//! - **Redis**: a shared out-of-process store for deployments where
//!   several limiter instances must agree on admission state. All three
//!   algorithms run as atomic server-side scripts.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

use crate::config::Algorithm;
use crate::error::Result;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Requests remaining in the current window
    pub remaining: u64,
    /// When capacity resets
    pub reset_at: SystemTime,
}

impl Decision {
    /// An admitted request with `remaining` capacity left.
    pub fn allowed(remaining: u64, reset_at: SystemTime) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
        }
    }

    /// A denied request. Remaining capacity is zero by definition.
    pub fn denied(reset_at: SystemTime) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
        }
    }

    /// Time to wait before the next attempt can succeed.
    pub fn retry_after(&self) -> Duration {
        self.reset_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

/// Contract shared by every admission storage backend.
///
/// This trait abstracts over the in-process [`MemoryStore`] and the shared
/// [`RedisStore`] so the [`Limiter`](crate::Limiter) can route decisions
/// through either.
#[async_trait]
pub trait Store: Send + Sync {
    /// Charge one unit of capacity against `key`.
    ///
    /// Each call is a single logical unit: under concurrent callers on the
    /// same key, the number of calls returning `allowed` within any window
    /// never exceeds `max_requests`.
    async fn take(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
        algorithm: Algorithm,
    ) -> Result<Decision>;

    /// Best-effort refund of one unit of consumed capacity.
    ///
    /// Succeeds as a no-op when no outstanding charge exists, and never
    /// drives a key into negative state. Sliding-window admissions cannot
    /// be refunded; see the backend documentation.
    async fn rollback(&self, key: &str) -> Result<()>;

    /// Read-only snapshot of current consumption for `key`. No side effects.
    async fn get(&self, key: &str) -> Result<u64>;

    /// Administrative override of current consumption.
    ///
    /// Backends may reject this when an algorithm's state cannot be
    /// represented as a single scalar count.
    async fn set(&self, key: &str, value: u64, expiration: Duration) -> Result<()>;

    /// Release backend resources. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
