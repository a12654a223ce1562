//! Store backend factory

use std::sync::Arc;

use crate::config::StoreConfig;

use super::backend::Store;
use super::memory_backend::MemoryStore;

/// Create a store backend based on configuration.
///
/// `"memory"` is the only backend shipped with the crate. Durable backends
/// implement [`Store`] themselves and are handed to the service builder
/// directly; any other name falls back to memory with a warning.
///
/// # Example
///
/// ```rust,ignore
/// let store = create_store(&settings.dispatcher.store);
/// ```
pub fn create_store(settings: &StoreConfig) -> Arc<dyn Store> {
    match settings.backend.as_str() {
        "memory" => {
            tracing::info!(backend = "memory", "Creating memory store");
        }
        other => {
            tracing::warn!(
                backend = %other,
                "Unknown store backend requested, falling back to memory"
            );
        }
    }
    Arc::new(MemoryStore::new())
}
