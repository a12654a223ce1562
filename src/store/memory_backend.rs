//! In-memory message store.
//!
//! Messages are kept in memory and will be lost on service restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::notification::{Message, Priority};

use super::backend::{Store, StoreError, StoreStats};

/// In-memory store with one FIFO queue per priority.
///
/// Queues only hold ids; the messages themselves live in a `DashMap` from
/// `add` until `delete`, so a fetched message stays visible as in-flight
/// until its dispatch attempt completes.
pub struct MemoryStore {
    /// Every message not yet deleted, keyed by id
    messages: DashMap<String, Message>,
    high: Mutex<VecDeque<String>>,
    default: Mutex<VecDeque<String>>,
    low: Mutex<VecDeque<String>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            high: Mutex::new(VecDeque::new()),
            default: Mutex::new(VecDeque::new()),
            low: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn queue(&self, priority: Priority) -> &Mutex<VecDeque<String>> {
        match priority {
            Priority::High => &self.high,
            Priority::Default => &self.default,
            Priority::Low => &self.low,
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Pop ids from one queue until one still refers to a stored message
    async fn pop_live(&self, priority: Priority) -> Option<Message> {
        let mut queue = self.queue(priority).lock().await;
        while let Some(id) = queue.pop_front() {
            if let Some(message) = self.messages.get(&id) {
                return Some(message.clone());
            }
            tracing::debug!(message_id = %id, "Skipping message deleted before dispatch");
        }
        None
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, mut message: Message) -> Result<String, StoreError> {
        self.ensure_open()?;

        let id = Uuid::new_v4().to_string();
        message
            .assign_id(id.clone())
            .map_err(|e| StoreError::InvalidMessage(e.to_string()))?;

        let priority = message.priority;
        self.messages.insert(id.clone(), message);
        self.queue(priority).lock().await.push_back(id.clone());

        tracing::debug!(
            message_id = %id,
            priority = priority.as_str(),
            "Message added to memory store"
        );

        Ok(id)
    }

    async fn get_next(&self, cancel: &CancellationToken) -> Result<Option<Message>, StoreError> {
        self.ensure_open()?;

        if cancel.is_cancelled() {
            return Ok(None);
        }

        for priority in [Priority::High, Priority::Default, Priority::Low] {
            if let Some(message) = self.pop_live(priority).await {
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    async fn delete(&self, message: &Message) -> Result<bool, StoreError> {
        let Some(id) = message.id() else {
            return Err(StoreError::InvalidMessage(
                "cannot delete a message without an id".to_string(),
            ));
        };

        Ok(self.messages.remove(id).is_some())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);

        let remaining = self.messages.len();
        if remaining > 0 {
            tracing::warn!(
                remaining = remaining,
                "Closing memory store with undelivered messages, they will be lost"
            );
        }

        Ok(())
    }

    async fn stats(&self) -> StoreStats {
        let queued_high = self.high.lock().await.len();
        let queued_default = self.default.lock().await.len();
        let queued_low = self.low.lock().await.len();
        let queued = queued_high + queued_default + queued_low;

        StoreStats {
            backend_type: self.backend_type().to_string(),
            queued_high,
            queued_default,
            queued_low,
            in_flight: self.messages.len().saturating_sub(queued),
            closed: self.closed.load(Ordering::Acquire),
        }
    }
}
