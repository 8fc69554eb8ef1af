//! Backend interface consumed by the sync layer.
//!
//! - [`types`] - Wire types: articles, pages, stream events, update messages
//! - [`http`] - [`HttpBackend`], the reqwest implementation of [`NewsBackend`]
//! - [`sse`] - Incremental `text/event-stream` decoder
//!
//! Everything above this module talks to the backend only through the
//! [`NewsBackend`] trait, so tests substitute scripted fakes.

mod error;
mod http;
pub mod sse;
mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::ApiError;
pub use http::HttpBackend;
pub use types::{
    Article, Page, PageFilter, PageParam, PageRequest, ProgressEvent, QueueKind, QueueRecord,
    StreamEvent, StreamRequest, StreamSummary, UpdateMessage,
};

/// A long-lived sequence of backend events. Dropping it closes the transport.
pub type EventStream<T> = BoxStream<'static, Result<T, ApiError>>;

#[async_trait]
pub trait NewsBackend: Send + Sync {
    /// Fetch one page; offset params go to the cached listing, cursor params to the live one.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, ApiError>;

    /// Start a multi-source streaming fetch.
    async fn stream_news(&self, request: &StreamRequest)
        -> Result<EventStream<StreamEvent>, ApiError>;

    /// Open the server-push updates channel. Items are raw JSON payloads.
    async fn open_updates(&self) -> Result<EventStream<String>, ApiError>;

    async fn like_article(&self, article_id: i64) -> Result<(), ApiError>;

    async fn unlike_article(&self, article_id: i64) -> Result<(), ApiError>;

    async fn enqueue(&self, record: &QueueRecord) -> Result<(), ApiError>;

    async fn dequeue(&self, article_url: &str) -> Result<(), ApiError>;
}
