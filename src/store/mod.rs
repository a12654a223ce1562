//! Message stores.
//!
//! Pending messages live in a store between submission and dispatch.
//!
//! # Architecture
//!
//! - `Store`: backend trait, implemented by `MemoryStore` in this crate and by
//!   any durable queue or table outside it
//! - `StorePolicy`: empty-read backoff and read-error tolerance
//! - `PolicyStore`: a store wrapped with a policy, used by the dispatch loop
//!
//! Use `create_store()` to create the configured backend.

pub mod backend;
pub mod backoff;
mod factory;
pub mod memory_backend;
pub mod policy;

pub use backend::{Store, StoreError, StoreStats};
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use factory::create_store;
pub use memory_backend::MemoryStore;
pub use policy::{DefaultStorePolicy, PolicyStore, StorePolicy};
