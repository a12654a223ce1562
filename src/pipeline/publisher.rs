use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::NotifyError;
use crate::metrics::DispatchMetrics;
use crate::notification::{Message, Target};

use super::{panic_message, PublishContext, PublishError};

/// A delivery backend for one or more target channels.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Channels this publisher delivers to
    fn capability(&self) -> Target;

    /// Whether this publisher takes part in delivering `message`.
    ///
    /// Must be a pure predicate; by default the message target has to
    /// intersect the capability.
    fn can_publish(&self, message: &Message) -> bool {
        message.target.intersects(self.capability())
    }

    /// Called once before the first message is dispatched
    async fn initialize(&self) -> Result<(), PublishError> {
        Ok(())
    }

    /// Deliver the message held by `ctx`
    async fn publish(
        &self,
        ctx: &mut PublishContext,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError>;
}

/// Summary of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    /// Publishers whose `can_publish` accepted the message
    pub attempted: usize,
    /// Publishers that returned success
    pub published: usize,
    /// Publishers that returned an error or panicked
    pub failed: usize,
    /// Whether a publisher called `set_complete`
    pub completed_early: bool,
}

/// Publishers in registration order
#[derive(Clone, Default)]
pub struct PublisherSet {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl PublisherSet {
    pub fn new(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self { publishers }
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Initialize every publisher in order, stopping at the first failure
    pub async fn initialize_all(&self) -> Result<(), NotifyError> {
        for publisher in &self.publishers {
            publisher
                .initialize()
                .await
                .map_err(|source| NotifyError::PublisherInit {
                    publisher: publisher.name().to_string(),
                    source,
                })?;
            tracing::debug!(publisher = %publisher.name(), "Publisher initialized");
        }
        Ok(())
    }

    /// Offer `message` to every publisher that can handle it.
    ///
    /// A failing publisher does not stop the others; only `set_complete`
    /// ends the fan-out early.
    pub async fn publish(&self, message: Message, cancel: &CancellationToken) -> FanOutReport {
        let mut ctx = PublishContext::new(message);
        let mut report = FanOutReport::default();

        for publisher in &self.publishers {
            if !publisher.can_publish(ctx.message()) {
                continue;
            }

            report.attempted += 1;
            let result = AssertUnwindSafe(publisher.publish(&mut ctx, cancel))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {
                    report.published += 1;
                    DispatchMetrics::record_published(publisher.name());
                    tracing::debug!(
                        message_id = ?ctx.message().id(),
                        publisher = %publisher.name(),
                        "Message published"
                    );
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    DispatchMetrics::record_publish_failed(publisher.name());
                    tracing::warn!(
                        message_id = ?ctx.message().id(),
                        publisher = %publisher.name(),
                        error = %e,
                        "Publisher failed"
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    DispatchMetrics::record_publish_failed(publisher.name());
                    tracing::error!(
                        message_id = ?ctx.message().id(),
                        publisher = %publisher.name(),
                        panic = %panic_message(panic.as_ref()),
                        "Publisher panicked"
                    );
                }
            }

            if ctx.is_complete() {
                report.completed_early = true;
                tracing::debug!(
                    message_id = ?ctx.message().id(),
                    publisher = %publisher.name(),
                    "Publish marked complete, skipping remaining publishers"
                );
                break;
            }
        }

        report
    }
}
