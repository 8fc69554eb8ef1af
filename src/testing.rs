//! Scripted [`NewsBackend`] for unit tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{
    ApiError, Article, EventStream, NewsBackend, Page, PageRequest, QueueKind, QueueRecord,
    StreamEvent, StreamRequest,
};

type PageHandler = Box<dyn FnMut(&PageRequest) -> Result<Page, ApiError> + Send>;

pub(crate) fn article(n: usize) -> Article {
    let mut article = Article::new(
        format!("https://news.example/{n}"),
        format!("Article {n}"),
        if n % 2 == 0 { "bbc" } else { "npr" },
    );
    article.id = Some(n as i64);
    article
}

pub(crate) fn page(range: std::ops::Range<usize>, total: u64, next: Option<&str>) -> Page {
    Page {
        articles: range.map(article).collect(),
        total,
        limit: 50,
        next_cursor: next.map(str::to_string),
        prev_cursor: None,
        has_more: next.is_some(),
    }
}

/// One scripted call to `stream_news` or `open_updates`.
pub(crate) enum Script<T> {
    /// Fail to connect.
    Refuse(ApiError),
    /// Deliver these items, then end the stream.
    Items(Vec<Result<T, ApiError>>),
    /// Deliver these items, then stay open without further items.
    ItemsThenHang(Vec<Result<T, ApiError>>),
}

impl<T: Send + 'static> Script<T> {
    fn into_stream(self) -> Result<EventStream<T>, ApiError> {
        match self {
            Script::Refuse(e) => Err(e),
            Script::Items(items) => Ok(stream::iter(items).boxed()),
            Script::ItemsThenHang(items) => {
                Ok(stream::iter(items).chain(stream::pending()).boxed())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Mutation {
    Like(i64),
    Unlike(i64),
    Enqueue(String, QueueKind),
    Dequeue(String),
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    pages: Mutex<Option<PageHandler>>,
    page_delays: Mutex<VecDeque<Duration>>,
    requests: Mutex<Vec<PageRequest>>,
    streams: Mutex<VecDeque<Script<StreamEvent>>>,
    stream_requests: Mutex<Vec<StreamRequest>>,
    stream_times: Mutex<Vec<tokio::time::Instant>>,
    updates: Mutex<VecDeque<Script<String>>>,
    update_opens: AtomicUsize,
    mutations: Mutex<Vec<Mutation>>,
    mutation_failure: Mutex<Option<u16>>,
    mutation_panics: AtomicBool,
    mutation_delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_page<F>(&self, handler: F)
    where
        F: FnMut(&PageRequest) -> Result<Page, ApiError> + Send + 'static,
    {
        *self.pages.lock().unwrap() = Some(Box::new(handler));
    }

    /// Delay the next page responses, one entry per call.
    pub fn delay_pages(&self, delays: impl IntoIterator<Item = Duration>) {
        self.page_delays.lock().unwrap().extend(delays);
    }

    pub fn page_requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn page_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn push_stream(&self, script: Script<StreamEvent>) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn stream_requests(&self) -> Vec<StreamRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    /// When each `stream_news` call was made.
    pub fn stream_times(&self) -> Vec<tokio::time::Instant> {
        self.stream_times.lock().unwrap().clone()
    }

    pub fn push_updates(&self, script: Script<String>) {
        self.updates.lock().unwrap().push_back(script);
    }

    pub fn update_opens(&self) -> usize {
        self.update_opens.load(Ordering::SeqCst)
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn fail_mutations(&self, status: Option<u16>) {
        *self.mutation_failure.lock().unwrap() = status;
    }

    pub fn panic_mutations(&self, panic: bool) {
        self.mutation_panics.store(panic, Ordering::SeqCst);
    }

    pub fn delay_mutations(&self, delay: Option<Duration>) {
        *self.mutation_delay.lock().unwrap() = delay;
    }

    async fn mutate(&self, mutation: Mutation) -> Result<(), ApiError> {
        // Behavior is fixed when the call is made, not when it settles
        self.mutations.lock().unwrap().push(mutation);
        let delay = *self.mutation_delay.lock().unwrap();
        let panics = self.mutation_panics.load(Ordering::SeqCst);
        let failure = *self.mutation_failure.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if panics {
            panic!("backend blew up");
        }
        match failure {
            Some(status) => Err(ApiError::HttpStatus(status)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NewsBackend for FakeBackend {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        // Responses are decided in call order, then delivered after the delay
        let result = match self.pages.lock().unwrap().as_mut() {
            Some(handler) => handler(request),
            None => Err(ApiError::HttpStatus(404)),
        };
        let delay = self.page_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn stream_news(
        &self,
        request: &StreamRequest,
    ) -> Result<EventStream<StreamEvent>, ApiError> {
        self.stream_requests.lock().unwrap().push(request.clone());
        self.stream_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            Some(script) => script.into_stream(),
            None => Err(ApiError::HttpStatus(503)),
        }
    }

    async fn open_updates(&self) -> Result<EventStream<String>, ApiError> {
        self.update_opens.fetch_add(1, Ordering::SeqCst);
        let script = self.updates.lock().unwrap().pop_front();
        match script {
            Some(script) => script.into_stream(),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn like_article(&self, article_id: i64) -> Result<(), ApiError> {
        self.mutate(Mutation::Like(article_id)).await
    }

    async fn unlike_article(&self, article_id: i64) -> Result<(), ApiError> {
        self.mutate(Mutation::Unlike(article_id)).await
    }

    async fn enqueue(&self, record: &QueueRecord) -> Result<(), ApiError> {
        self.mutate(Mutation::Enqueue(
            record.article_url.clone(),
            record.queue_type,
        ))
        .await
    }

    async fn dequeue(&self, article_url: &str) -> Result<(), ApiError> {
        self.mutate(Mutation::Dequeue(article_url.to_string())).await
    }
}
