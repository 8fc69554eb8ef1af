//! Paginated article cache.
//!
//! [`QueryEngine`] keeps one entry per [`QueryKey`] holding the pages loaded so
//! far. Views mount an [`InfiniteQuery`] and read flattened [`QueryState`]s from
//! it; stale entries are served immediately and refreshed in the background.

mod engine;
mod key;

pub use engine::{InfiniteQuery, QueryConfig, QueryEngine, QueryState, QueryStatus, Refetches};
pub use key::{PageMode, QueryKey, NEWS_NAMESPACE};
