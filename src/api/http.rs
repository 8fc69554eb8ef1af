use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::sse;
use super::types::{
    Article, Page, PageParam, PageRequest, ProgressEvent, QueueRecord, StreamEvent,
    StreamRequest, StreamSummary,
};
use super::{ApiError, EventStream, NewsBackend};

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// [`NewsBackend`] over HTTP + server-sent events.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpBackend {
    /// Build a backend rooted at `base_url` (e.g. `http://localhost:8000/`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Self::with_client(client, base_url, timeout)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }
        // Url::join replaces the last segment unless the path ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Offset-mode listing backed by the server-side article cache.
    pub async fn fetch_cached_news_paginated(
        &self,
        request: &PageRequest,
    ) -> Result<Page, ApiError> {
        let url = self.page_url("news/page/cached", request)?;
        self.get_json(url).await
    }

    /// Cursor-mode listing straight from the live store.
    pub async fn fetch_live_news_paginated(&self, request: &PageRequest) -> Result<Page, ApiError> {
        let url = self.page_url("news/page", request)?;
        self.get_json(url).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    fn page_url(&self, path: &str, request: &PageRequest) -> Result<Url, ApiError> {
        let mut url = self.endpoint(path)?;
        let filter = &request.filter;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &request.limit.to_string());
            match &request.param {
                PageParam::Offset(offset) => {
                    query.append_pair("offset", &offset.to_string());
                }
                PageParam::Cursor(Some(cursor)) => {
                    query.append_pair("cursor", cursor);
                }
                PageParam::Cursor(None) => {}
            }
            if let Some(category) = &filter.category {
                query.append_pair("category", category);
            }
            if let Some(source) = &filter.source {
                query.append_pair("source", source);
            }
            // Multi-source selection is only understood by the cached listing
            if matches!(request.param, PageParam::Offset(_)) && !filter.sources.is_empty() {
                query.append_pair("sources", &filter.sources.join(","));
            }
            if let Some(search) = &filter.search {
                query.append_pair("search", search);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ApiError::Timeout)??;

        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status().as_u16()));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        tracing::debug!(url = %url, "GET");
        let response = self.send(self.client.get(url)).await?;
        let bytes = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn open_event_stream(&self, url: Url) -> Result<EventStream<sse::SseEvent>, ApiError> {
        tracing::debug!(url = %url, "Opening event stream");
        let request = self
            .client
            .get(url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        let response = self.send(request).await?;
        Ok(sse::decode(response.bytes_stream()))
    }
}

#[async_trait]
impl NewsBackend for HttpBackend {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, ApiError> {
        match request.param {
            PageParam::Offset(_) => self.fetch_cached_news_paginated(request).await,
            PageParam::Cursor(_) => self.fetch_live_news_paginated(request).await,
        }
    }

    async fn stream_news(
        &self,
        request: &StreamRequest,
    ) -> Result<EventStream<StreamEvent>, ApiError> {
        let mut url = self.endpoint("news/stream")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("use_cache", if request.use_cache { "true" } else { "false" });
            if let Some(category) = &request.category {
                query.append_pair("category", category);
            }
        }

        let events = self.open_event_stream(url).await?;
        let mut assembler = StreamAssembler::default();
        let mut finished = false;

        Ok(events
            .map(move |event| {
                if finished {
                    return Vec::new();
                }
                let result = event.and_then(|event| assembler.apply(&event.data));
                match result {
                    Ok(events) => {
                        finished = events.iter().any(|e| matches!(e, StreamEvent::Done(_)));
                        events.into_iter().map(Ok).collect()
                    }
                    Err(e) => {
                        finished = true;
                        vec![Err(e)]
                    }
                }
            })
            .flat_map(stream::iter)
            .boxed())
    }

    async fn open_updates(&self) -> Result<EventStream<String>, ApiError> {
        let url = self.endpoint("updates/stream")?;
        let events = self.open_event_stream(url).await?;
        Ok(events.map(|event| event.map(|e| e.data)).boxed())
    }

    async fn like_article(&self, article_id: i64) -> Result<(), ApiError> {
        let url = self.endpoint("api/liked")?;
        let body = serde_json::to_vec(&serde_json::json!({ "article_id": article_id }))?;
        self.send(
            self.client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )
        .await?;
        Ok(())
    }

    async fn unlike_article(&self, article_id: i64) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/liked/{article_id}"))?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn enqueue(&self, record: &QueueRecord) -> Result<(), ApiError> {
        let url = self.endpoint("api/queue/add")?;
        let body = serde_json::to_vec(record)?;
        self.send(
            self.client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )
        .await?;
        Ok(())
    }

    async fn dequeue(&self, article_url: &str) -> Result<(), ApiError> {
        let mut url = self.endpoint("api/queue/url/")?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(article_url);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, ApiError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(ApiError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ApiError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

// ============================================================================
// Stream payload decoding
// ============================================================================

#[derive(Deserialize)]
struct StreamPayload {
    status: String,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    articles: Vec<serde_json::Value>,
    #[serde(default)]
    progress: Option<RawProgress>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawProgress {
    #[serde(default)]
    completed: usize,
    #[serde(default)]
    total: usize,
}

/// Translates the stream endpoint's status payloads into [`StreamEvent`]s and
/// keeps the running summary reported on completion.
#[derive(Default)]
struct StreamAssembler {
    summary: StreamSummary,
}

impl StreamAssembler {
    fn apply(&mut self, data: &str) -> Result<Vec<StreamEvent>, ApiError> {
        let payload: StreamPayload = serde_json::from_str(data)?;
        if payload.stream_id.is_some() {
            self.summary.stream_id = payload.stream_id.clone();
        }

        let progress = payload.progress.as_ref().map(|p| {
            StreamEvent::Progress(ProgressEvent {
                completed: p.completed,
                total: p.total,
                message: payload.message.clone(),
            })
        });

        let mut events = Vec::new();
        match payload.status.as_str() {
            "starting" => {
                tracing::debug!(stream_id = ?payload.stream_id, "Stream started");
            }
            "cache_data" | "source_complete" => {
                let source = payload
                    .source
                    .clone()
                    .unwrap_or_else(|| "cache".to_string());
                let articles = parse_articles(&payload.articles, &source);
                self.summary.articles.extend(articles.iter().cloned());
                if !self.summary.sources.contains(&source) {
                    self.summary.sources.push(source.clone());
                }
                events.extend(progress);
                events.push(StreamEvent::SourceComplete { source, articles });
            }
            "source_error" => {
                let source = payload.source.unwrap_or_else(|| "unknown".to_string());
                let error = payload.error.unwrap_or_default();
                self.summary.errors.push(format!("{source}: {error}"));
                events.extend(progress);
                events.push(StreamEvent::SourceError { source, error });
            }
            "complete" => {
                events.extend(progress);
                events.push(StreamEvent::Done(std::mem::take(&mut self.summary)));
            }
            "error" => {
                let reason = payload
                    .error
                    .or(payload.message)
                    .unwrap_or_else(|| "stream failed".to_string());
                return Err(ApiError::Backend(reason));
            }
            other => {
                tracing::debug!(status = %other, "Ignoring unknown stream status");
            }
        }
        Ok(events)
    }
}

/// Decode articles one by one so a single bad record doesn't drop the batch.
fn parse_articles(values: &[serde_json::Value], source: &str) -> Vec<Article> {
    let mut skipped = 0usize;
    let articles: Vec<Article> = values
        .iter()
        .filter_map(|v| match serde_json::from_value::<Article>(v.clone()) {
            Ok(article) => Some(article),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .collect();
    if skipped > 0 {
        tracing::warn!(source = %source, skipped = skipped, "Skipped malformed articles in stream");
    }
    articles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{PageFilter, QueueKind};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn page_json(urls: &[&str], total: u64, next: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "articles": urls.iter().map(|u| serde_json::json!({"title": u, "url": u, "source": "A"})).collect::<Vec<_>>(),
            "total": total,
            "limit": 50,
            "next_cursor": next,
            "prev_cursor": null,
            "has_more": next.is_some(),
        })
    }

    #[tokio::test]
    async fn test_cached_page_sends_offset_and_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news/page/cached"))
            .and(query_param("limit", "50"))
            .and(query_param("offset", "0"))
            .and(query_param("category", "technology"))
            .and(query_param("sources", "bbc,npr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_json(
                &["https://x/1", "https://x/2"],
                100,
                Some("50"),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let request = PageRequest {
            limit: 50,
            param: PageParam::Offset(0),
            filter: PageFilter {
                category: Some("technology".into()),
                sources: vec!["bbc".into(), "npr".into()],
                ..Default::default()
            },
        };
        let page = backend(&server).fetch_page(&request).await.unwrap();
        assert_eq!(page.articles.len(), 2);
        assert_eq!(page.total, 100);
        assert_eq!(page.next_cursor.as_deref(), Some("50"));
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_live_page_sends_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news/page"))
            .and(query_param("cursor", "tok-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_json(
                &["https://x/3"],
                3,
                None,
            )))
            .mount(&server)
            .await;

        let request = PageRequest {
            limit: 2,
            param: PageParam::Cursor(Some("tok-2".into())),
            filter: PageFilter::default(),
        };
        let page = backend(&server).fetch_page(&request).await.unwrap();
        assert!(!page.has_more);
        assert_eq!(page.articles[0].url, "https://x/3");
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let request = PageRequest {
            limit: 10,
            param: PageParam::Offset(0),
            filter: PageFilter::default(),
        };
        match backend(&server).fetch_page(&request).await {
            Err(ApiError::HttpStatus(503)) => {}
            other => panic!("Expected HttpStatus(503), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_page_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let request = PageRequest {
            limit: 10,
            param: PageParam::Offset(0),
            filter: PageFilter::default(),
        };
        assert!(matches!(
            backend(&server).fetch_page(&request).await,
            Err(ApiError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_news_maps_events() {
        let body = concat!(
            "data: {\"status\":\"starting\",\"stream_id\":\"stream_1\"}\n\n",
            ": keepalive\n\n",
            "data: {\"status\":\"source_complete\",\"source\":\"BBC\",\"articles\":[{\"title\":\"a\",\"link\":\"https://bbc/a\",\"source\":\"BBC\"}],\"progress\":{\"completed\":1,\"total\":2,\"percentage\":50.0}}\n\n",
            "data: {\"status\":\"source_error\",\"source\":\"NPR\",\"error\":\"timeout\",\"progress\":{\"completed\":2,\"total\":2}}\n\n",
            "data: {\"status\":\"complete\",\"progress\":{\"completed\":2,\"total\":2,\"percentage\":100}}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news/stream"))
            .and(query_param("use_cache", "false"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let request = StreamRequest {
            use_cache: false,
            category: None,
        };
        let events: Vec<StreamEvent> = backend(&server)
            .stream_news(&request)
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 6);
        assert!(matches!(&events[0], StreamEvent::Progress(p) if p.completed == 1 && p.total == 2));
        match &events[1] {
            StreamEvent::SourceComplete { source, articles } => {
                assert_eq!(source, "BBC");
                assert_eq!(articles[0].url, "https://bbc/a");
            }
            other => panic!("Expected SourceComplete, got {:?}", other),
        }
        assert!(matches!(&events[3], StreamEvent::SourceError { source, .. } if source == "NPR"));
        match &events[5] {
            StreamEvent::Done(summary) => {
                assert_eq!(summary.stream_id.as_deref(), Some("stream_1"));
                assert_eq!(summary.sources, vec!["BBC".to_string()]);
                assert_eq!(summary.articles.len(), 1);
                assert_eq!(summary.errors, vec!["NPR: timeout".to_string()]);
            }
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_error_status_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"status\":\"error\",\"message\":\"Too many active streams (5).\"}\n\n",
            ))
            .mount(&server)
            .await;

        let mut events = backend(&server)
            .stream_news(&StreamRequest::default())
            .await
            .unwrap();
        match events.next().await {
            Some(Err(ApiError::Backend(msg))) => assert!(msg.contains("Too many")),
            other => panic!("Expected backend error, got {:?}", other),
        }
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_updates_stream_yields_payloads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/updates/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "id: 0\nretry: 5000\ndata: {\"type\":\"connected\"}\n\nid: 1\ndata: {\"type\":\"invalidate\",\"id\":1,\"timestamp\":\"t\"}\n\n",
            ))
            .mount(&server)
            .await;

        let payloads: Vec<String> = backend(&server)
            .open_updates()
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(payloads.len(), 2);
        assert!(payloads[1].contains("invalidate"));
    }

    #[tokio::test]
    async fn test_like_and_unlike_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/liked"))
            .and(body_json(serde_json::json!({"article_id": 7})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/liked/7"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend(&server);
        backend.like_article(7).await.unwrap();
        let err = backend.unlike_article(7).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_queue_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/queue/add"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/queue/url/https:%2F%2Fx%2Fa"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend(&server);
        let article = Article::new("https://x/a", "A", "src");
        backend
            .enqueue(&QueueRecord::for_article(&article, QueueKind::Permanent))
            .await
            .unwrap();
        backend.dequeue("https://x/a").await.unwrap();
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let backend = HttpBackend::new("http://localhost:8000/api-root", Duration::from_secs(1))
            .unwrap();
        assert_eq!(backend.base_url().as_str(), "http://localhost:8000/api-root/");
        assert_eq!(
            backend.endpoint("news/page").unwrap().as_str(),
            "http://localhost:8000/api-root/news/page"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(matches!(
            HttpBackend::new("not a url", Duration::from_secs(1)),
            Err(ApiError::InvalidUrl(_))
        ));
    }
}
