//! Processing stages applied to every dispatched message.
//!
//! - `sink`: ordered transformation/validation steps run before delivery
//! - `publisher`: delivery backends selected by target capability
//! - `publishers`: publishers shipped with the crate

mod context;
pub mod publisher;
pub mod publishers;
pub mod sink;

use std::any::Any;

use thiserror::Error;

pub use context::{PublishContext, SinkContext};
pub use publisher::{FanOutReport, Publisher, PublisherSet};
pub use publishers::{ChannelPublisher, LoggingPublisher};
pub use sink::{ChainOutcome, Sink, SinkChain};

/// Errors returned by a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink refused the message; it will not be published
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The sink observed cancellation and gave up
    #[error("Processing cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors returned by a publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publish failed: {0}")]
    Failed(String),

    /// The publisher observed cancellation and gave up
    #[error("Publish cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
