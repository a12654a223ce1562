// Shared components
pub mod config;
pub mod error;
pub mod metrics;

// Dispatch pipeline
pub mod notification;
pub mod pipeline;
pub mod store;

pub use error::{NotifyError, Result};
pub use notification::{Message, NotificationService, Priority, Recipient, Target};
