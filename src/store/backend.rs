//! Backend trait for message stores.
//!
//! A store holds messages between submission and dispatch. The dispatcher
//! only ever talks to it through [`Store`], so in-memory and durable
//! implementations are interchangeable.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::notification::Message;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed
    #[error("Store is closed")]
    Closed,

    /// Backend is temporarily unavailable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The message cannot be stored as given
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Statistics about the store backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    /// Backend type identifier
    pub backend_type: String,

    /// Messages waiting to be fetched, per priority
    pub queued_high: usize,
    pub queued_default: usize,
    pub queued_low: usize,

    /// Messages fetched but not yet deleted
    pub in_flight: usize,

    /// Whether the store has been closed
    pub closed: bool,
}

impl StoreStats {
    /// Total number of messages still held by the store
    pub fn total(&self) -> usize {
        self.queued_high + self.queued_default + self.queued_low + self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.queued_high + self.queued_default + self.queued_low
    }
}

/// Backend trait for message storage.
///
/// # Thread Safety
///
/// `add` is called concurrently from any number of producers while a single
/// dispatch loop calls `get_next` and `delete`.
///
/// # Ordering
///
/// `get_next` must never return a lower priority message while a higher
/// priority one is waiting, and must keep FIFO order within a priority.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend type identifier, used in logs and stats
    fn backend_type(&self) -> &'static str;

    /// Prepare the backend. Called once before the dispatch loop starts.
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Persist a message, assigning and returning its id.
    async fn add(&self, message: Message) -> Result<String, StoreError>;

    /// Fetch the next message to dispatch.
    ///
    /// Returns `Ok(None)` when nothing is available right now. Must return
    /// promptly once `cancel` is triggered.
    async fn get_next(&self, cancel: &CancellationToken) -> Result<Option<Message>, StoreError>;

    /// Remove a message after its dispatch attempt.
    ///
    /// Returns `false` if the store did not hold the message.
    async fn delete(&self, message: &Message) -> Result<bool, StoreError>;

    /// Release backend resources. No other call is made afterwards.
    async fn close(&self) -> Result<(), StoreError>;

    /// Get store statistics.
    async fn stats(&self) -> StoreStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_stats_totals() {
        let stats = StoreStats {
            backend_type: "memory".to_string(),
            queued_high: 1,
            queued_default: 2,
            queued_low: 3,
            in_flight: 1,
            closed: false,
        };

        assert_eq!(stats.queued(), 6);
        assert_eq!(stats.total(), 7);
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(StoreError::Closed.to_string(), "Store is closed");
        assert_eq!(
            StoreError::Unavailable("disk full".to_string()).to_string(),
            "Store unavailable: disk full"
        );
    }
}
