//! In-process admission store.
//!
//! A single mutex guards the whole entry map, so every mutation is
//! totally ordered and no interleaving can admit more than
//! `max_requests` calls in a window. The protected section is short and
//! the map is bounded by the number of live keys, which keeps the
//! single-lock design adequate for single-instance deployments.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Decision, Store};
use crate::config::Algorithm;
use crate::error::{Result, TollgateError};

/// Per-key admission state.
#[derive(Debug, Clone)]
struct Entry {
    count: u64,
    expires_at: SystemTime,
}

/// In-process admission store.
///
/// Implements fixed-window counting only. The [`Limiter`](crate::Limiter)
/// refuses to pair this store with any other algorithm at construction;
/// direct callers requesting one get a store error instead of silently
/// running fixed-window semantics under another algorithm's name.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        debug!("Creating in-process admission store");
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live entries, for monitoring.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn take(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
        algorithm: Algorithm,
    ) -> Result<Decision> {
        if algorithm != Algorithm::FixedWindow {
            return Err(TollgateError::Store(format!(
                "the in-process store only supports the fixed-window algorithm, got {}",
                algorithm
            )));
        }

        let now = SystemTime::now();
        let mut entries = self.entries.lock();

        // Lazy expiry: sweep dead entries before acting on this key.
        entries.retain(|_, entry| entry.expires_at > now);

        if let Some(entry) = entries.get_mut(key) {
            if entry.count >= max_requests {
                trace!(key = %key, "Window exhausted, denying");
                return Ok(Decision::denied(entry.expires_at));
            }
            entry.count += 1;
            let remaining = max_requests - entry.count;
            trace!(key = %key, remaining = remaining, "Admitted");
            return Ok(Decision::allowed(remaining, entry.expires_at));
        }

        let expires_at = now + window;
        entries.insert(
            key.to_string(),
            Entry {
                count: 1,
                expires_at,
            },
        );
        let remaining = max_requests.saturating_sub(1);
        trace!(key = %key, remaining = remaining, "Admitted first request in window");
        Ok(Decision::allowed(remaining, expires_at))
    }

    async fn rollback(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();

        let drained = match entries.get_mut(key) {
            Some(entry) => {
                entry.count = entry.count.saturating_sub(1);
                entry.count == 0
            }
            // No outstanding charge: refunding is a successful no-op.
            None => false,
        };

        if drained {
            entries.remove(key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let entries = self.entries.lock();
        Ok(entries.get(key).map(|entry| entry.count).unwrap_or(0))
    }

    async fn set(&self, key: &str, value: u64, expiration: Duration) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                count: value,
                expires_at: SystemTime::now() + expiration,
            },
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("Clearing in-process admission store");
        self.entries.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const FIXED: Algorithm = Algorithm::FixedWindow;

    #[tokio::test]
    async fn test_remaining_decreases_then_window_resets() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(1);

        // Five admissions with remaining 4, 3, 2, 1, 0.
        for expected in (0..5).rev() {
            let decision = store.take("k", 5, window, FIXED).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        // Sixth call is denied with no remaining capacity.
        let decision = store.take("k", 5, window, FIXED).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        // After the window passes the key is admitted again.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let decision = store.take("k", 5, window, FIXED).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_denial_reports_original_window_reset() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        let first = store.take("k", 1, window, FIXED).await.unwrap();
        let denied = store.take("k", 1, window, FIXED).await.unwrap();

        assert!(!denied.allowed);
        // The reset hint is the first request's expiry, not a fresh window.
        assert_eq!(denied.reset_at, first.reset_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_takes_respect_capacity_bound() {
        let store = Arc::new(MemoryStore::new());
        let admitted = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = Arc::clone(&store);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                let decision = store
                    .take("concurrent", 100, Duration::from_secs(60), FIXED)
                    .await
                    .unwrap();
                if decision.allowed {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_rollback_refunds_one_slot() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            store.take("k", 3, window, FIXED).await.unwrap();
        }
        let denied = store.take("k", 3, window, FIXED).await.unwrap();
        assert!(!denied.allowed);

        store.rollback("k").await.unwrap();

        let decision = store.take("k", 3, window, FIXED).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_rollback_without_charge_is_a_no_op() {
        let store = MemoryStore::new();

        store.rollback("unknown").await.unwrap();
        assert_eq!(store.get("unknown").await.unwrap(), 0);
        assert_eq!(store.entry_count(), 0);

        // No negative state: the next take starts a fresh window.
        let decision = store
            .take("unknown", 5, Duration::from_secs(60), FIXED)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_rollback_to_zero_removes_the_entry() {
        let store = MemoryStore::new();

        store
            .take("k", 5, Duration::from_secs(60), FIXED)
            .await
            .unwrap();
        assert_eq!(store.entry_count(), 1);

        store.rollback("k").await.unwrap();
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_get_and_set() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        assert_eq!(store.get("k").await.unwrap(), 0);

        store.take("k", 10, window, FIXED).await.unwrap();
        store.take("k", 10, window, FIXED).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 2);

        store.set("k", 9, window).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 9);

        // One slot left after the override.
        let decision = store.take("k", 10, window, FIXED).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        store.take("a", 1, window, FIXED).await.unwrap();
        let denied = store.take("a", 1, window, FIXED).await.unwrap();
        assert!(!denied.allowed);

        let decision = store.take("b", 1, window, FIXED).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_rejects_other_algorithms() {
        let store = MemoryStore::new();

        for algorithm in [Algorithm::SlidingWindow, Algorithm::TokenBucket] {
            let result = store
                .take("k", 10, Duration::from_secs(60), algorithm)
                .await;
            assert!(matches!(result, Err(TollgateError::Store(_))));
        }
    }

    #[tokio::test]
    async fn test_close_clears_all_state() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        store.take("a", 5, window, FIXED).await.unwrap();
        store.take("b", 5, window, FIXED).await.unwrap();
        assert_eq!(store.entry_count(), 2);

        store.close().await.unwrap();
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.get("a").await.unwrap(), 0);
    }
}
