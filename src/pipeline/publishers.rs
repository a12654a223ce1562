//! Publishers shipped with the crate.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::notification::{Message, Target};

use super::{PublishContext, PublishError, Publisher};

/// Writes every message it receives to the log instead of delivering it.
pub struct LoggingPublisher {
    capability: Target,
}

impl LoggingPublisher {
    pub fn new(capability: Target) -> Self {
        Self { capability }
    }
}

impl Default for LoggingPublisher {
    fn default() -> Self {
        Self::new(Target::all())
    }
}

#[async_trait]
impl Publisher for LoggingPublisher {
    fn name(&self) -> &str {
        "logging"
    }

    fn capability(&self) -> Target {
        self.capability
    }

    async fn publish(
        &self,
        ctx: &mut PublishContext,
        _cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let message = ctx.message();
        let recipients: Vec<&str> = message.recipients.iter().map(|r| r.address.as_str()).collect();

        tracing::info!(
            message_id = ?message.id(),
            target = ?message.target,
            priority = message.priority.as_str(),
            subject = ?message.subject,
            recipients = ?recipients,
            "Notification published"
        );

        Ok(())
    }
}

/// Forwards published messages into an mpsc channel.
///
/// Lets another task (a sender pool, a test) consume what the dispatcher
/// publishes.
pub struct ChannelPublisher {
    name: String,
    capability: Target,
    sender: mpsc::Sender<Message>,
}

impl ChannelPublisher {
    pub fn new(name: impl Into<String>, capability: Target, sender: mpsc::Sender<Message>) -> Self {
        Self {
            name: name.into(),
            capability,
            sender,
        }
    }

    /// Create a publisher together with the receiving end of its channel
    pub fn channel(
        name: impl Into<String>,
        capability: Target,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(name, capability, tx), rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Target {
        self.capability
    }

    async fn publish(
        &self,
        ctx: &mut PublishContext,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        // Prefer delivering over giving up when both are ready
        tokio::select! {
            biased;
            sent = self.sender.send(ctx.message().clone()) => {
                sent.map_err(|_| PublishError::Failed("channel receiver dropped".to_string()))
            }
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
        }
    }
}
