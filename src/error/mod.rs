use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Message id already assigned: {id}")]
    IdAlreadyAssigned { id: String },

    #[error("Notification service has been disposed")]
    Disposed,

    #[error("Notification service is already running")]
    AlreadyRunning,

    #[error("At least one publisher must be registered")]
    NoPublishers,

    #[error("Publisher {publisher} failed to initialize: {source}")]
    PublisherInit {
        publisher: String,
        #[source]
        source: crate::pipeline::PublishError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl NotifyError {
    /// Whether the caller did something wrong (as opposed to a runtime failure)
    pub fn is_validation(&self) -> bool {
        matches!(self, NotifyError::Validation(_) | NotifyError::IdAlreadyAssigned { .. })
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;
