//! Notification messages and the service that dispatches them.
//!
//! `types` holds the message model, `service` owns the background loop that
//! moves messages from the store through sinks and out to publishers.

mod service;
mod types;

pub use service::{
    DispatchOutcome, DispatcherStats, DispatcherStatsSnapshot, NotificationService,
    NotificationServiceBuilder, ServiceState,
};
pub use types::{Message, MessageBuilder, Priority, Recipient, Target};
