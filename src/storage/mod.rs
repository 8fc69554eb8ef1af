//! Persistent key-value storage shared across tabs.
//!
//! - [`KeyValueStore`] - raw string storage (SQLite via [`Database`], or [`MemoryStore`])
//! - [`PersistedStore`] - typed JSON wrapper that never fails outward

mod kv;
mod persisted;
mod schema;
mod types;

pub use kv::{KeyValueStore, MemoryStore};
pub use persisted::PersistedStore;
pub use schema::Database;
pub use types::{DatabaseError, StoreError};
