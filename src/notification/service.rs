use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{NotifyError, Result};
use crate::metrics::DispatchMetrics;
use crate::pipeline::{panic_message, ChainOutcome, Publisher, PublisherSet, Sink, SinkChain};
use crate::store::{
    DefaultStorePolicy, MemoryStore, PolicyStore, Store, StoreError, StorePolicy, StoreStats,
};

use super::Message;

/// Lifecycle of the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Stopped,
    Running,
    Stopping,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Running,
            2 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::Running => 1,
            ServiceState::Stopping => 2,
        }
    }
}

/// How a single dispatch attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Fan-out ran (possibly with failing or no matching publishers)
    Published,
    /// Target was empty
    NoTarget,
    /// A sink removed every recipient
    NoRecipients,
    /// A sink failed or panicked
    SinkFailed,
    /// A sink changed the message id
    IdentityViolation,
    /// Something panicked outside the sink and publisher guards
    UnexpectedFailure,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Published => "published",
            DispatchOutcome::NoTarget => "no_target",
            DispatchOutcome::NoRecipients => "no_recipients",
            DispatchOutcome::SinkFailed => "sink_failed",
            DispatchOutcome::IdentityViolation => "identity_violation",
            DispatchOutcome::UnexpectedFailure => "unexpected_failure",
        }
    }
}

/// Statistics for the dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Messages accepted by `add`
    pub added: AtomicU64,
    /// Messages that completed a dispatch attempt
    pub dispatched: AtomicU64,
    /// Successful publisher calls
    pub published: AtomicU64,
    /// Failed publisher calls
    pub publish_failures: AtomicU64,
    /// Messages dropped by a failing sink
    pub sink_failures: AtomicU64,
    /// Messages dropped because a sink changed their id
    pub identity_violations: AtomicU64,
    /// Messages deleted without publishing (no target or no recipients)
    pub skipped: AtomicU64,
    /// Panics caught at the per-message boundary
    pub unexpected_failures: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            added: self.added.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            identity_violations: self.identity_violations.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            unexpected_failures: self.unexpected_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub added: u64,
    pub dispatched: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub sink_failures: u64,
    pub identity_violations: u64,
    pub skipped: u64,
    pub unexpected_failures: u64,
}

/// Everything the background loop needs, shared with the service handle
struct Dispatcher {
    store: PolicyStore,
    sinks: SinkChain,
    publishers: PublisherSet,
    stats: DispatcherStats,
    state: AtomicU8,
}

impl Dispatcher {
    fn set_state(&self, state: ServiceState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Poll the store until `cancel` fires or the policy escalates a read error
    async fn run(&self, cancel: CancellationToken) -> std::result::Result<(), StoreError> {
        tracing::info!(
            backend = self.store.backend_type(),
            sinks = self.sinks.len(),
            publishers = self.publishers.len(),
            "Dispatch loop started"
        );

        while !cancel.is_cancelled() {
            let message = match self.store.get_next(&cancel).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "Store read failed and policy gave up, dispatch loop terminating"
                    );
                    self.set_state(ServiceState::Stopped);
                    return Err(e);
                }
            };

            // The current message always finishes, even if cancel fires meanwhile
            self.dispatch(message, &cancel).await;
        }

        tracing::info!("Dispatch loop stopped");
        Ok(())
    }

    /// Process one message, then delete it whatever happened. Never fails;
    /// failures are logged.
    async fn dispatch(&self, message: Message, cancel: &CancellationToken) -> DispatchOutcome {
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(self.process(message.clone(), cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                self.stats.unexpected_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    message_id = ?message.id(),
                    panic = %panic_message(panic.as_ref()),
                    "Unexpected failure while dispatching message"
                );
                DispatchOutcome::UnexpectedFailure
            }
        };

        match self.store.delete(&message).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    message_id = ?message.id(),
                    "Message was already gone from the store"
                );
            }
            Err(e) => {
                tracing::error!(
                    message_id = ?message.id(),
                    error = %e,
                    "Failed to delete dispatched message"
                );
            }
        }

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        DispatchMetrics::record_dispatched(outcome.as_str(), started.elapsed().as_secs_f64());
        tracing::debug!(
            message_id = ?message.id(),
            outcome = outcome.as_str(),
            queued_ms = (chrono::Utc::now() - message.created_at).num_milliseconds(),
            "Message dispatched"
        );

        outcome
    }

    /// Sinks, then publishers
    async fn process(&self, message: Message, cancel: &CancellationToken) -> DispatchOutcome {
        match self.sinks.run(message, cancel).await {
            ChainOutcome::Completed {
                message: processed, ..
            } => {
                if processed.target.is_empty() {
                    tracing::debug!(
                        message_id = ?processed.id(),
                        "Message has no target, nothing to publish"
                    );
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    DispatchOutcome::NoTarget
                } else if !processed.has_recipients() {
                    tracing::warn!(
                        message_id = ?processed.id(),
                        "Sinks removed every recipient, message will not be published"
                    );
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    DispatchOutcome::NoRecipients
                } else {
                    let message_id = processed.id().map(str::to_owned);
                    let report = self.publishers.publish(processed, cancel).await;
                    self.stats
                        .published
                        .fetch_add(report.published as u64, Ordering::Relaxed);
                    self.stats
                        .publish_failures
                        .fetch_add(report.failed as u64, Ordering::Relaxed);

                    if report.attempted == 0 {
                        tracing::debug!(
                            message_id = ?message_id,
                            "No publisher accepted the message target"
                        );
                    }
                    DispatchOutcome::Published
                }
            }
            ChainOutcome::Failed { .. } => {
                self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::SinkFailed
            }
            ChainOutcome::IdentityViolation { .. } => {
                self.stats.identity_violations.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::IdentityViolation
            }
        }
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<std::result::Result<(), StoreError>>>,
}

/// Accepts messages and dispatches them from a single background task.
///
/// # Lifecycle
///
/// `Stopped → Running → Stopping → Stopped`. `stop` is terminal: it closes
/// the store and disposes the service, after which `add`, `start` and `stop`
/// all fail with [`NotifyError::Disposed`].
///
/// # Example
///
/// ```rust,ignore
/// let service = NotificationService::builder()
///     .store(Arc::new(MemoryStore::new()))
///     .publisher(LoggingPublisher::default())
///     .build();
///
/// service.start().await?;
/// let id = service.add(message).await?;
/// service.stop().await?;
/// ```
pub struct NotificationService {
    dispatcher: Arc<Dispatcher>,
    lifecycle: Mutex<Lifecycle>,
    disposed: AtomicBool,
}

impl NotificationService {
    /// Create a service from its parts. Sinks and publishers keep the given order.
    pub fn new(
        store: Arc<dyn Store>,
        policy: Arc<dyn StorePolicy>,
        sinks: Vec<Arc<dyn Sink>>,
        publishers: Vec<Arc<dyn Publisher>>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                store: PolicyStore::new(store, policy),
                sinks: SinkChain::new(sinks),
                publishers: PublisherSet::new(publishers),
                stats: DispatcherStats::default(),
                state: AtomicU8::new(ServiceState::Stopped.as_u8()),
            }),
            lifecycle: Mutex::new(Lifecycle {
                cancel: CancellationToken::new(),
                handle: None,
            }),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn builder() -> NotificationServiceBuilder {
        NotificationServiceBuilder::default()
    }

    /// Current lifecycle state. Reports `Stopped` once the loop has ended on
    /// its own after an escalated store error.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.dispatcher.state.load(Ordering::Acquire))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.dispatcher.stats.snapshot()
    }

    /// Get statistics of the underlying store
    pub async fn store_stats(&self) -> StoreStats {
        self.dispatcher.store.stats().await
    }

    fn set_state(&self, state: ServiceState) {
        self.dispatcher.set_state(state);
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(NotifyError::Disposed);
        }
        Ok(())
    }

    /// Submit a message for dispatch and return its store-assigned id.
    ///
    /// The message needs at least one recipient and must not carry an id yet.
    #[tracing::instrument(
        name = "service.add",
        skip(self, message),
        fields(priority = message.priority.as_str(), recipients = message.recipients.len())
    )]
    pub async fn add(&self, message: Message) -> Result<String> {
        self.ensure_not_disposed()?;
        message.validate()?;

        if let Some(id) = message.id() {
            return Err(NotifyError::IdAlreadyAssigned { id: id.to_string() });
        }

        let priority = message.priority;
        let id = self.dispatcher.store.add(message).await?;

        self.dispatcher.stats.added.fetch_add(1, Ordering::Relaxed);
        DispatchMetrics::record_added(priority.as_str());
        tracing::debug!(message_id = %id, "Message accepted");

        Ok(id)
    }

    /// Initialize the store and publishers, then start the dispatch loop in
    /// the background. Returns once the loop has been spawned.
    #[tracing::instrument(name = "service.start", skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.ensure_not_disposed()?;

        let mut lifecycle = self.lifecycle.lock().await;
        // A concurrent stop may have disposed the service while we waited
        self.ensure_not_disposed()?;
        if self.state() != ServiceState::Stopped || lifecycle.handle.is_some() {
            return Err(NotifyError::AlreadyRunning);
        }
        if self.dispatcher.publishers.is_empty() {
            return Err(NotifyError::NoPublishers);
        }

        self.dispatcher.store.initialize().await?;
        self.dispatcher.publishers.initialize_all().await?;

        // Set before the spawn; the loop may mark itself Stopped right away
        self.set_state(ServiceState::Running);
        let cancel = lifecycle.cancel.clone();
        let dispatcher = self.dispatcher.clone();
        lifecycle.handle = Some(tokio::spawn(async move { dispatcher.run(cancel).await }));

        tracing::info!("Notification service started");
        Ok(())
    }

    /// Wait until the store holds no queued or in-flight message.
    ///
    /// Returns early if the loop is not running.
    pub async fn wait_until_idle(&self, poll_interval: Duration) {
        while self.state() == ServiceState::Running && self.store_stats().await.total() > 0 {
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Stop the loop, wait for the in-flight message to finish, close the
    /// store and dispose the service.
    #[tracing::instrument(name = "service.stop", skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(NotifyError::Disposed);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        self.set_state(ServiceState::Stopping);
        lifecycle.cancel.cancel();

        if let Some(handle) = lifecycle.handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Dispatch loop had already terminated with an error");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch loop task failed");
                }
            }
        }

        let closed = self.dispatcher.store.close().await;
        self.set_state(ServiceState::Stopped);

        let stats = self.stats();
        tracing::info!(
            dispatched = stats.dispatched,
            published = stats.published,
            publish_failures = stats.publish_failures,
            sink_failures = stats.sink_failures,
            "Notification service stopped"
        );

        closed.map_err(NotifyError::from)
    }
}

impl Drop for NotificationService {
    fn drop(&mut self) {
        // Never leave the loop polling a store nobody owns anymore
        self.lifecycle.get_mut().cancel.cancel();
    }
}

/// Registration of the pluggable parts of a [`NotificationService`]
#[derive(Default)]
pub struct NotificationServiceBuilder {
    store: Option<Arc<dyn Store>>,
    policy: Option<Arc<dyn StorePolicy>>,
    sinks: Vec<Arc<dyn Sink>>,
    publishers: Vec<Arc<dyn Publisher>>,
}

impl NotificationServiceBuilder {
    /// Use this store (defaults to a fresh [`MemoryStore`])
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this policy (defaults to [`DefaultStorePolicy::default`])
    pub fn policy(mut self, policy: Arc<dyn StorePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Append a sink; sinks run in the order they are added
    pub fn sink(self, sink: impl Sink + 'static) -> Self {
        self.sink_arc(Arc::new(sink))
    }

    pub fn sink_arc(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Append a publisher; publishers are offered messages in the order they are added
    pub fn publisher(self, publisher: impl Publisher + 'static) -> Self {
        self.publisher_arc(Arc::new(publisher))
    }

    pub fn publisher_arc(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn build(self) -> NotificationService {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(DefaultStorePolicy::default()) as Arc<dyn StorePolicy>);

        NotificationService::new(store, policy, self.sinks, self.publishers)
    }
}
