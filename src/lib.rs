//! Tollgate - Admission-Control Rate Limiting
//!
//! This crate decides, per caller-supplied key, whether to admit or
//! reject a unit of work against a configured policy, and reports how
//! much capacity remains and when it resets. HTTP-framework adapters
//! sit on top of the [`Limiter`]: they extract a key, call
//! [`Limiter::take`], render the [`Decision`] as response headers, and
//! optionally refund admitted work with [`Limiter::rollback`].
//!
//! Two storage backends are available: an in-process counter map for
//! single-instance deployments, and a Redis-backed store that keeps
//! several limiter instances in agreement. The Redis backend supports
//! three algorithms (fixed window, sliding window, token bucket); the
//! in-process backend is fixed-window only and refuses anything else at
//! construction.
//!
//! ```rust,no_run
//! use tollgate::{Backend, Limiter, Policy};
//!
//! # async fn example() -> tollgate::Result<()> {
//! let limiter = Limiter::new(Policy::per_minute(100), Backend::Memory).await?;
//!
//! let decision = limiter.take("client-ip").await?;
//! if decision.allowed {
//!     println!("admitted, {} remaining", decision.remaining);
//! } else {
//!     println!("rejected, retry in {:?}", decision.retry_after());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod limiter;
pub mod store;

pub use config::{Algorithm, Backend, LimiterConfig, Policy};
pub use error::{Result, TollgateError};
pub use limiter::Limiter;
pub use store::{Decision, MemoryStore, RedisStore, Store};
