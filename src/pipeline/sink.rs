use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::metrics::DispatchMetrics;
use crate::notification::Message;

use super::{panic_message, SinkContext, SinkError};

/// A pipeline stage that inspects or transforms a message before delivery.
///
/// The returned message replaces the context's message for the next sink and
/// for publishing. It must keep the original id.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Process the message held by `ctx`. The default passes it through.
    async fn process(
        &self,
        ctx: &mut SinkContext,
        _cancel: &CancellationToken,
    ) -> Result<Message, SinkError> {
        Ok(ctx.message().clone())
    }
}

/// Result of running the sink chain over one message
#[derive(Debug)]
pub enum ChainOutcome {
    /// Every sink ran, or one stopped the chain. The message may be published.
    Completed {
        message: Message,
        stopped_by: Option<String>,
    },
    /// A sink returned an error or panicked
    Failed { sink: String, error: String },
    /// A sink returned a message with a different id
    IdentityViolation {
        sink: String,
        expected: Option<String>,
        actual: Option<String>,
    },
}

impl ChainOutcome {
    /// Whether publishing should follow
    pub fn is_publishable(&self) -> bool {
        matches!(self, ChainOutcome::Completed { .. })
    }
}

/// Sinks in registration order
#[derive(Clone, Default)]
pub struct SinkChain {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkChain {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Run every sink in order over `message`.
    ///
    /// Stops at the first sink that fails, panics, returns a message with a
    /// different id, or calls `stop_processing`.
    pub async fn run(&self, message: Message, cancel: &CancellationToken) -> ChainOutcome {
        let original_id = message.id().map(str::to_owned);
        let mut ctx = SinkContext::new(message);

        for sink in &self.sinks {
            let result = AssertUnwindSafe(sink.process(&mut ctx, cancel))
                .catch_unwind()
                .await;

            let processed = match result {
                Ok(Ok(processed)) => processed,
                Ok(Err(e)) => {
                    DispatchMetrics::record_sink_failure(sink.name());
                    tracing::warn!(
                        message_id = ?original_id,
                        sink = %sink.name(),
                        error = %e,
                        "Sink failed, message will not be published"
                    );
                    return ChainOutcome::Failed {
                        sink: sink.name().to_string(),
                        error: e.to_string(),
                    };
                }
                Err(panic) => {
                    let error = panic_message(panic.as_ref());
                    DispatchMetrics::record_sink_failure(sink.name());
                    tracing::error!(
                        message_id = ?original_id,
                        sink = %sink.name(),
                        panic = %error,
                        "Sink panicked, message will not be published"
                    );
                    return ChainOutcome::Failed {
                        sink: sink.name().to_string(),
                        error,
                    };
                }
            };

            if processed.id() != original_id.as_deref() {
                tracing::error!(
                    expected = ?original_id,
                    actual = ?processed.id(),
                    sink = %sink.name(),
                    "Sink changed the message id, aborting chain"
                );
                return ChainOutcome::IdentityViolation {
                    sink: sink.name().to_string(),
                    expected: original_id,
                    actual: processed.id().map(str::to_owned),
                };
            }

            ctx.set_message(processed);

            if ctx.is_stopped() {
                tracing::debug!(
                    message_id = ?original_id,
                    sink = %sink.name(),
                    "Sink chain stopped"
                );
                return ChainOutcome::Completed {
                    message: ctx.into_message(),
                    stopped_by: Some(sink.name().to_string()),
                };
            }
        }

        ChainOutcome::Completed {
            message: ctx.into_message(),
            stopped_by: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{Recipient, Target};
    use std::sync::Mutex;

    fn queued_message() -> Message {
        let mut message = Message::builder()
            .with_target(Target::EMAIL)
            .with_recipient(Recipient::new("a@example.com"))
            .with_subject("original")
            .build();
        message.assign_id("msg-1").unwrap();
        message
    }

    /// Appends its label to the subject and records that it ran
    struct LabelSink {
        label: &'static str,
        stop: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Sink for LabelSink {
        fn name(&self) -> &str {
            self.label
        }

        async fn process(
            &self,
            ctx: &mut SinkContext,
            _cancel: &CancellationToken,
        ) -> Result<Message, SinkError> {
            self.log.lock().unwrap().push(self.label);
            let mut message = ctx.message().clone();
            let subject = message.subject.take().unwrap_or_default();
            message.subject = Some(format!("{}+{}", subject, self.label));
            if self.stop {
                ctx.stop_processing();
            }
            Ok(message)
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        async fn process(
            &self,
            _ctx: &mut SinkContext,
            _cancel: &CancellationToken,
        ) -> Result<Message, SinkError> {
            Err(SinkError::Rejected("blocked address".to_string()))
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl Sink for PanickingSink {
        async fn process(
            &self,
            _ctx: &mut SinkContext,
            _cancel: &CancellationToken,
        ) -> Result<Message, SinkError> {
            panic!("template missing");
        }
    }

    /// Returns a brand-new message instead of the one it was given
    struct ReplacingSink;

    #[async_trait]
    impl Sink for ReplacingSink {
        async fn process(
            &self,
            ctx: &mut SinkContext,
            _cancel: &CancellationToken,
        ) -> Result<Message, SinkError> {
            let recipients = ctx.message().recipients.clone();
            let mut replacement = Message::builder().with_recipients(recipients).build();
            replacement.assign_id("other").unwrap();
            Ok(replacement)
        }
    }

    struct PassThrough;

    #[async_trait]
    impl Sink for PassThrough {}

    fn label(label: &'static str, stop: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Sink> {
        Arc::new(LabelSink {
            label,
            stop,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_empty_chain_passes_message_through() {
        let chain = SinkChain::default();
        let outcome = chain.run(queued_message(), &CancellationToken::new()).await;

        match outcome {
            ChainOutcome::Completed { message, stopped_by } => {
                assert_eq!(message.id(), Some("msg-1"));
                assert!(stopped_by.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_default_process_is_identity() {
        let chain = SinkChain::new(vec![Arc::new(PassThrough) as Arc<dyn Sink>]);
        let outcome = chain.run(queued_message(), &CancellationToken::new()).await;

        match outcome {
            ChainOutcome::Completed { message, .. } => {
                assert_eq!(message.subject.as_deref(), Some("original"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sinks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = SinkChain::new(vec![
            label("first", false, &log),
            label("second", false, &log),
            label("third", false, &log),
        ]);

        let outcome = chain.run(queued_message(), &CancellationToken::new()).await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        match outcome {
            ChainOutcome::Completed { message, .. } => {
                assert_eq!(message.subject.as_deref(), Some("original+first+second+third"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_processing_skips_remaining_sinks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = SinkChain::new(vec![
            label("first", false, &log),
            label("second", true, &log),
            label("third", false, &log),
        ]);

        let outcome = chain.run(queued_message(), &CancellationToken::new()).await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        match outcome {
            ChainOutcome::Completed { message, stopped_by } => {
                assert_eq!(message.subject.as_deref(), Some("original+first+second"));
                assert_eq!(stopped_by.as_deref(), Some("second"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_aborts_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = SinkChain::new(vec![Arc::new(FailingSink) as Arc<dyn Sink>, label("after", false, &log)]);

        let outcome = chain.run(queued_message(), &CancellationToken::new()).await;

        assert!(!outcome.is_publishable());
        assert!(matches!(outcome, ChainOutcome::Failed { ref error, .. } if error.contains("blocked address")));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_sink_is_contained() {
        let chain = SinkChain::new(vec![Arc::new(PanickingSink) as Arc<dyn Sink>]);

        let outcome = chain.run(queued_message(), &CancellationToken::new()).await;

        assert!(matches!(outcome, ChainOutcome::Failed { ref error, .. } if error == "template missing"));
    }

    #[tokio::test]
    async fn test_identity_change_aborts_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = SinkChain::new(vec![Arc::new(ReplacingSink) as Arc<dyn Sink>, label("after", false, &log)]);

        let outcome = chain.run(queued_message(), &CancellationToken::new()).await;

        match outcome {
            ChainOutcome::IdentityViolation { expected, actual, .. } => {
                assert_eq!(expected.as_deref(), Some("msg-1"));
                assert_eq!(actual.as_deref(), Some("other"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(log.lock().unwrap().is_empty());
    }
}
