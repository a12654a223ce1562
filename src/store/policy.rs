//! Store policies: how long to wait after an empty read and which read
//! failures the dispatch loop may shrug off.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PolicyConfig;
use crate::metrics::DispatchMetrics;
use crate::notification::Message;

use super::backend::{Store, StoreError, StoreStats};
use super::backoff::{BackoffConfig, ExponentialBackoff};

/// Strategy consulted by [`PolicyStore`] around every read.
#[async_trait]
pub trait StorePolicy: Send + Sync {
    /// How long to wait after `consecutive_nulls` empty reads in a row.
    ///
    /// Must return zero for zero and must be non-decreasing.
    fn empty_wait_interval(&self, consecutive_nulls: u32) -> Duration;

    /// Decide what to do with a failed read.
    ///
    /// `true` absorbs the error and the loop keeps polling; `false` makes the
    /// wrapped read return the original error.
    async fn handle_message_error(
        &self,
        store: &dyn Store,
        error: &StoreError,
        consecutive_errors: u32,
        cancel: &CancellationToken,
    ) -> bool;
}

/// Quadratic empty-read backoff plus bounded error tolerance.
///
/// An empty run of `n` reads waits `base * n^2`, with `n` capped at
/// `max_empty_count` and the result capped at `max_wait`. Read errors are
/// absorbed `max_consecutive_errors` times in a row, each after an
/// exponential backoff delay.
#[derive(Debug, Clone)]
pub struct DefaultStorePolicy {
    base_wait: Duration,
    max_wait: Duration,
    max_empty_count: u32,
    max_consecutive_errors: u32,
    error_backoff: ExponentialBackoff,
}

impl DefaultStorePolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            base_wait: Duration::from_millis(config.empty_wait_base_ms),
            max_wait: Duration::from_millis(config.empty_wait_max_ms),
            max_empty_count: config.max_empty_count,
            max_consecutive_errors: config.max_consecutive_errors,
            error_backoff: ExponentialBackoff::with_config(BackoffConfig {
                initial_delay_ms: config.error_backoff_initial_ms,
                max_delay_ms: config.error_backoff_max_ms,
                ..Default::default()
            }),
        }
    }
}

impl Default for DefaultStorePolicy {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

#[async_trait]
impl StorePolicy for DefaultStorePolicy {
    fn empty_wait_interval(&self, consecutive_nulls: u32) -> Duration {
        let n = consecutive_nulls.min(self.max_empty_count);
        self.base_wait.saturating_mul(n.saturating_mul(n)).min(self.max_wait)
    }

    async fn handle_message_error(
        &self,
        store: &dyn Store,
        error: &StoreError,
        consecutive_errors: u32,
        cancel: &CancellationToken,
    ) -> bool {
        if matches!(error, StoreError::Closed) {
            return false;
        }

        if consecutive_errors > self.max_consecutive_errors {
            tracing::error!(
                backend = store.backend_type(),
                error = %error,
                consecutive_errors = consecutive_errors,
                "Store read failures exceeded tolerance"
            );
            return false;
        }

        let delay = self.error_backoff.delay_for(consecutive_errors);
        tracing::warn!(
            backend = store.backend_type(),
            error = %error,
            consecutive_errors = consecutive_errors,
            retry_in_ms = delay.as_millis() as u64,
            "Store read failed, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }

        true
    }
}

/// A store wrapped with a [`StorePolicy`].
///
/// Only reads go through the policy; every other call is passed straight to
/// the inner store.
pub struct PolicyStore {
    store: Arc<dyn Store>,
    policy: Arc<dyn StorePolicy>,
    consecutive_nulls: AtomicU32,
    consecutive_errors: AtomicU32,
}

impl PolicyStore {
    pub fn new(store: Arc<dyn Store>, policy: Arc<dyn StorePolicy>) -> Self {
        Self {
            store,
            policy,
            consecutive_nulls: AtomicU32::new(0),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn consecutive_nulls(&self) -> u32 {
        self.consecutive_nulls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Store for PolicyStore {
    fn backend_type(&self) -> &'static str {
        self.store.backend_type()
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.store.initialize().await
    }

    async fn add(&self, message: Message) -> Result<String, StoreError> {
        self.store.add(message).await
    }

    async fn get_next(&self, cancel: &CancellationToken) -> Result<Option<Message>, StoreError> {
        match self.store.get_next(cancel).await {
            Ok(Some(message)) => {
                self.consecutive_nulls.store(0, Ordering::Relaxed);
                self.consecutive_errors.store(0, Ordering::Relaxed);
                Ok(Some(message))
            }
            Ok(None) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                let nulls = self
                    .consecutive_nulls
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                DispatchMetrics::record_empty_poll();

                let wait = self.policy.empty_wait_interval(nulls);
                if !wait.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Ok(None)
            }
            Err(error) => {
                let errors = self
                    .consecutive_errors
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                DispatchMetrics::record_store_error();

                if self
                    .policy
                    .handle_message_error(self.store.as_ref(), &error, errors, cancel)
                    .await
                {
                    Ok(None)
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn delete(&self, message: &Message) -> Result<bool, StoreError> {
        self.store.delete(message).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.store.close().await
    }

    async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    fn fast_config() -> PolicyConfig {
        PolicyConfig {
            empty_wait_base_ms: 1,
            empty_wait_max_ms: 50,
            max_empty_count: 10,
            max_consecutive_errors: 2,
            error_backoff_initial_ms: 1,
            error_backoff_max_ms: 5,
        }
    }

    /// Store whose reads fail a fixed number of times before delegating
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Store for FlakyStore {
        fn backend_type(&self) -> &'static str {
            "flaky"
        }

        async fn add(&self, message: Message) -> Result<String, StoreError> {
            self.inner.add(message).await
        }

        async fn get_next(&self, cancel: &CancellationToken) -> Result<Option<Message>, StoreError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(StoreError::Unavailable("connection reset".to_string()));
                }
            }
            self.inner.get_next(cancel).await
        }

        async fn delete(&self, message: &Message) -> Result<bool, StoreError> {
            self.inner.delete(message).await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.inner.close().await
        }

        async fn stats(&self) -> StoreStats {
            self.inner.stats().await
        }
    }

    /// Policy that never waits and records the error counts it was shown
    #[derive(Default)]
    struct RecordingPolicy {
        absorb: bool,
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl StorePolicy for RecordingPolicy {
        fn empty_wait_interval(&self, _consecutive_nulls: u32) -> Duration {
            Duration::ZERO
        }

        async fn handle_message_error(
            &self,
            _store: &dyn Store,
            _error: &StoreError,
            consecutive_errors: u32,
            _cancel: &CancellationToken,
        ) -> bool {
            self.seen.lock().unwrap().push(consecutive_errors);
            self.absorb
        }
    }

    #[test]
    fn test_empty_wait_starts_at_zero() {
        let policy = DefaultStorePolicy::default();
        assert_eq!(policy.empty_wait_interval(0), Duration::ZERO);
        assert_eq!(policy.empty_wait_interval(1), Duration::from_millis(100));
        assert_eq!(policy.empty_wait_interval(3), Duration::from_millis(900));
    }

    #[test]
    fn test_empty_wait_non_decreasing_and_bounded() {
        let policy = DefaultStorePolicy::default();
        let mut previous = Duration::ZERO;

        for n in 0..1000 {
            let wait = policy.empty_wait_interval(n);
            assert!(wait >= previous, "wait decreased at n={}", n);
            assert!(wait <= Duration::from_secs(10));
            previous = wait;
        }

        assert_eq!(policy.empty_wait_interval(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_wait_respects_max_wait() {
        let policy = DefaultStorePolicy::new(&PolicyConfig {
            empty_wait_base_ms: 100,
            empty_wait_max_ms: 250,
            ..PolicyConfig::default()
        });

        assert_eq!(policy.empty_wait_interval(1), Duration::from_millis(100));
        assert_eq!(policy.empty_wait_interval(2), Duration::from_millis(250));
        assert_eq!(policy.empty_wait_interval(9), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_default_policy_absorbs_then_escalates() {
        let policy = DefaultStorePolicy::new(&fast_config());
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let error = StoreError::Unavailable("down".to_string());

        assert!(policy.handle_message_error(&store, &error, 1, &cancel).await);
        assert!(policy.handle_message_error(&store, &error, 2, &cancel).await);
        assert!(!policy.handle_message_error(&store, &error, 3, &cancel).await);
    }

    #[tokio::test]
    async fn test_default_policy_never_absorbs_closed() {
        let policy = DefaultStorePolicy::new(&fast_config());
        let store = MemoryStore::new();

        let absorbed = policy
            .handle_message_error(&store, &StoreError::Closed, 1, &CancellationToken::new())
            .await;
        assert!(!absorbed);
    }

    #[tokio::test]
    async fn test_policy_store_counts_empty_reads() {
        let store = PolicyStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DefaultStorePolicy::new(&fast_config())),
        );
        let cancel = CancellationToken::new();

        assert!(store.get_next(&cancel).await.unwrap().is_none());
        assert!(store.get_next(&cancel).await.unwrap().is_none());
        assert_eq!(store.consecutive_nulls(), 2);

        let message = Message::builder()
            .with_recipient(crate::notification::Recipient::new("a@example.com"))
            .build();
        store.add(message).await.unwrap();

        assert!(store.get_next(&cancel).await.unwrap().is_some());
        assert_eq!(store.consecutive_nulls(), 0);
    }

    #[tokio::test]
    async fn test_policy_store_wait_is_cancellable() {
        let store = PolicyStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DefaultStorePolicy::default()),
        );
        let cancel = CancellationToken::new();

        // Push the run length up so the next wait is long
        for _ in 0..3 {
            cancel.cancel();
            store.get_next(&cancel).await.unwrap();
        }

        let fresh = CancellationToken::new();
        let trigger = fresh.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        assert!(store.get_next(&fresh).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_policy_store_absorbed_error_reads_as_empty() {
        let policy = Arc::new(RecordingPolicy {
            absorb: true,
            ..Default::default()
        });
        let store = PolicyStore::new(
            Arc::new(FlakyStore {
                inner: MemoryStore::new(),
                failures_left: Mutex::new(2),
            }),
            policy.clone(),
        );
        let cancel = CancellationToken::new();

        assert!(store.get_next(&cancel).await.unwrap().is_none());
        assert!(store.get_next(&cancel).await.unwrap().is_none());
        assert!(store.get_next(&cancel).await.unwrap().is_none());

        assert_eq!(*policy.seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_policy_store_escalates_original_error() {
        let store = PolicyStore::new(
            Arc::new(FlakyStore {
                inner: MemoryStore::new(),
                failures_left: Mutex::new(1),
            }),
            Arc::new(RecordingPolicy::default()),
        );

        let result = store.get_next(&CancellationToken::new()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(ref msg)) if msg == "connection reset"));
    }
}
