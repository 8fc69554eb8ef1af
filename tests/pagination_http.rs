//! Integration tests for the paginated cache over HTTP: offset and cursor
//! listings, error reporting, and server-push invalidation.

mod common;

use common::{backend, eventually, page_json};
use newsync::api::PageFilter;
use newsync::invalidation::{InvalidationReceiver, InvalidationTarget, ReceiverConfig};
use newsync::query::{PageMode, QueryConfig, QueryEngine, QueryKey, QueryStatus};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_cached_page(server: &MockServer, offset: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/news/page/cached"))
        .and(query_param("offset", offset))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_offset_listing_loads_every_page() {
    let server = MockServer::start().await;
    mount_cached_page(&server, "0", page_json(0..50, 120, Some("50"))).await;
    mount_cached_page(&server, "50", page_json(50..100, 120, Some("100"))).await;
    mount_cached_page(&server, "100", page_json(100..120, 120, None)).await;

    let engine = QueryEngine::new(backend(&server), QueryConfig::default());
    let query = engine.query(QueryKey::news(PageMode::Offset, &PageFilter::default(), 50));

    let state = query.fetch().await;
    assert_eq!(state.articles.len(), 50);
    assert!(state.has_next_page);

    query.fetch_next_page().await;
    let state = query.fetch_next_page().await;

    assert_eq!(state.status, QueryStatus::Ready);
    assert_eq!(state.articles.len(), 120);
    assert_eq!(state.total, 120);
    assert_eq!(state.page_count, 3);
    assert!(!state.has_next_page);
    assert_eq!(state.articles[119].url, "https://news.example/119");
}

#[tokio::test]
async fn test_cursor_listing_follows_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/page"))
        .and(query_param_is_missing("cursor"))
        .and(query_param("category", "world"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_json(0..2, 3, Some("tok-2"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/news/page"))
        .and(query_param("cursor", "tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_json(2..3, 3, None)))
        .expect(1)
        .mount(&server)
        .await;

    let engine = QueryEngine::new(backend(&server), QueryConfig::default());
    let filter = PageFilter {
        category: Some("world".into()),
        ..Default::default()
    };
    let query = engine.query(QueryKey::news(PageMode::Cursor, &filter, 2));

    query.fetch().await;
    let state = query.fetch_next_page().await;
    assert_eq!(state.articles.len(), 3);
    assert!(!state.has_next_page);

    // Nothing further to load
    let state = query.fetch_next_page().await;
    assert_eq!(state.articles.len(), 3);
}

#[tokio::test]
async fn test_server_error_reported_on_first_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let engine = QueryEngine::new(backend(&server), QueryConfig::default());
    let query = engine.query(QueryKey::news(PageMode::Offset, &PageFilter::default(), 50));
    let state = query.fetch().await;

    assert_eq!(state.status, QueryStatus::Idle);
    assert!(state.articles.is_empty());
    assert!(state.error.unwrap().contains("500"));
}

#[tokio::test]
async fn test_invalidate_event_refetches_mounted_listing() {
    let server = MockServer::start().await;
    mount_cached_page(&server, "0", page_json(0..3, 3, None)).await;

    let engine = QueryEngine::new(backend(&server), QueryConfig::default());
    let query = engine.query(QueryKey::news(PageMode::Offset, &PageFilter::default(), 50));
    query.fetch().await;

    Mock::given(method("GET"))
        .and(path("/updates/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "data: {\"type\":\"connected\"}\n\n\
             data: {\"type\":\"invalidate\",\"id\":1,\"timestamp\":\"2024-05-01T10:00:00Z\",\"reason\":\"refresh\"}\n\n",
        ))
        .mount(&server)
        .await;

    let target: Arc<dyn InvalidationTarget> = Arc::new(engine.clone());
    let config = ReceiverConfig {
        reconnect_delay: std::time::Duration::from_secs(3600),
    };
    let receiver = InvalidationReceiver::spawn(backend(&server), target, config);

    let page_requests = || {
        let server = &server;
        async move {
            server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .filter(|r| r.url.path() == "/news/page/cached")
                .count()
        }
    };

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while page_requests().await < 2 {
        assert!(tokio::time::Instant::now() < deadline, "listing was not refetched");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    eventually("refetch to settle", || !query.state().is_fetching).await;
    let state = query.state();
    assert!(!state.is_stale);
    assert_eq!(state.articles.len(), 3);

    receiver.shutdown().await;
}
