//! Client-side synchronization layer for a news reader.
//!
//! - [`api`] - Backend wire types, the [`api::NewsBackend`] trait and its HTTP client
//! - [`storage`] - Persisted key-value store shared by every tab
//! - [`bus`] - Per-domain cross-tab broadcast bus
//! - [`stores`] - Liked articles, reading queue and other user state
//! - [`query`] - Paginated article cache
//! - [`ingest`] - Multi-source streaming fetch with retry
//! - [`invalidation`] - Server-push cache invalidation
//! - [`session`] - [`session::NewsSync`], one per tab

pub mod api;
pub mod bus;
pub mod config;
pub mod ingest;
pub mod invalidation;
pub mod query;
pub mod session;
pub mod storage;
pub mod stores;
mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use session::NewsSync;
