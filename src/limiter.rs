//! The admission decision engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::{Algorithm, Backend, LimiterConfig, Policy};
use crate::error::{Result, TollgateError};
use crate::store::{Decision, MemoryStore, RedisStore, Store};

/// The admission decision engine.
///
/// A limiter validates its policy at construction, selects exactly one
/// storage backend for its lifetime, and routes every decision through
/// it. All correctness under concurrency is the selected store's; the
/// limiter itself holds no locks.
///
/// Limiters are cheap to share: all methods take `&self`.
pub struct Limiter {
    store: Arc<dyn Store>,
    policy: Policy,
    closed: AtomicBool,
}

impl Limiter {
    /// Create a limiter for `policy` backed by `backend`.
    ///
    /// Fails with `InvalidConfig` for a bad policy, or for a non
    /// fixed-window algorithm on the in-process backend, which supports
    /// nothing else. Fails with `StoreInit` when Redis is unreachable.
    pub async fn new(policy: Policy, backend: Backend) -> Result<Self> {
        policy.validate()?;

        let store: Arc<dyn Store> = match backend {
            Backend::Redis { url } => Arc::new(RedisStore::connect(&url).await?),
            Backend::Memory => {
                if policy.algorithm != Algorithm::FixedWindow {
                    return Err(TollgateError::InvalidConfig(format!(
                        "the in-process store only supports the fixed-window algorithm; \
                         configure a redis backend for {}",
                        policy.algorithm
                    )));
                }
                Arc::new(MemoryStore::new())
            }
        };

        Self::with_store(policy, store)
    }

    /// Create a limiter from an on-disk configuration.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self> {
        Self::new(config.policy()?, config.backend()).await
    }

    /// Create a limiter around an injected store.
    pub fn with_store(policy: Policy, store: Arc<dyn Store>) -> Result<Self> {
        policy.validate()?;
        debug!(policy = %policy.description(), algorithm = %policy.algorithm, "Creating limiter");

        Ok(Self {
            store,
            policy,
            closed: AtomicBool::new(false),
        })
    }

    /// Charge one unit of capacity against `key` and decide admission.
    ///
    /// Backend failures surface as errors, never as an assumed verdict.
    /// Callers that must bound decision latency against a slow remote
    /// store can wrap this future in `tokio::time::timeout`.
    pub async fn take(&self, key: &str) -> Result<Decision> {
        self.ensure_open()?;
        self.store
            .take(
                key,
                self.policy.max_requests,
                self.policy.window,
                self.policy.algorithm,
            )
            .await
    }

    /// Refund one unit of capacity for `key`. Best-effort; succeeds as a
    /// no-op when no charge is outstanding.
    pub async fn rollback(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.rollback(key).await
    }

    /// Close the limiter and release its store. Idempotent; later
    /// `take`/`rollback` calls fail rather than silently deciding.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing limiter");
        self.store.close().await
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TollgateError::Store("limiter is closed".to_string()));
        }
        Ok(())
    }
}
