//! Shared fixtures for integration tests.
//!
//! Each test gets its own wiremock server and its own in-memory store.

#![allow(dead_code)]

use newsync::api::{HttpBackend, NewsBackend};
use newsync::config::Config;
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

pub fn backend(server: &MockServer) -> Arc<dyn NewsBackend> {
    Arc::new(HttpBackend::new(&server.uri(), Duration::from_secs(5)).unwrap())
}

/// Config with remote sync off and a reconnect delay longer than any test.
pub fn local_config() -> Config {
    Config {
        liked_remote_sync: false,
        queue_remote_sync: false,
        reconnect_delay_secs: 3600,
        ..Config::default()
    }
}

pub fn article_json(n: usize) -> serde_json::Value {
    serde_json::json!({
        "id": n,
        "title": format!("Article {n}"),
        "url": format!("https://news.example/{n}"),
        "source": if n % 2 == 0 { "bbc" } else { "npr" },
        "category": "world",
    })
}

pub fn page_json(range: std::ops::Range<usize>, total: u64, next: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "articles": range.map(article_json).collect::<Vec<_>>(),
        "total": total,
        "limit": 50,
        "next_cursor": next,
        "prev_cursor": null,
        "has_more": next.is_some(),
    })
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
