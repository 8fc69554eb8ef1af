use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::api::{
    ApiError, Article, EventStream, NewsBackend, ProgressEvent, StreamEvent, StreamRequest,
    StreamSummary,
};

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamStatus {
    #[default]
    Idle,
    Starting,
    Loading,
    /// Waiting before retry number `n` (1-based).
    Retrying(u32),
    Complete,
    Error,
    Cancelled,
}

impl StreamStatus {
    /// Whether a session is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamStatus::Starting | StreamStatus::Loading | StreamStatus::Retrying(_)
        )
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Idle => f.write_str("idle"),
            StreamStatus::Starting => f.write_str("starting"),
            StreamStatus::Loading => f.write_str("loading"),
            StreamStatus::Retrying(n) => write!(f, "retrying-{n}"),
            StreamStatus::Complete => f.write_str("complete"),
            StreamStatus::Error => f.write_str("error"),
            StreamStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Aggregate progress across sources. Never decreases within a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u8,
    pub message: Option<String>,
}

impl StreamProgress {
    /// Fold a raw progress event in, keeping counters monotonic.
    fn advance(&mut self, event: ProgressEvent) {
        self.completed = self.completed.max(event.completed);
        self.total = self.total.max(event.total);
        let percentage = if self.total == 0 {
            0
        } else {
            (self.completed.min(self.total) * 100 / self.total) as u8
        };
        self.percentage = self.percentage.max(percentage);
        if event.message.is_some() {
            self.message = event.message;
        }
    }
}

/// Updates delivered to the caller of [`StreamController::start`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Status(StreamStatus),
    Progress(StreamProgress),
    /// A source finished. Carries the full accumulated article list.
    Articles {
        source: String,
        articles: Arc<Vec<Article>>,
    },
    SourceFailed {
        source: String,
        error: String,
    },
    /// Always the last update of a session.
    Finished(StreamOutcome),
}

/// Terminal result of a session. Partial results survive errors and cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub status: StreamStatus,
    pub articles: Arc<Vec<Article>>,
    pub sources: Vec<String>,
    pub errors: Vec<String>,
    pub stream_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    pub status: StreamStatus,
    pub progress: StreamProgress,
    pub articles: Arc<Vec<Article>>,
    /// Sources that completed, in first-completion order.
    pub sources: Vec<String>,
    pub errors: Vec<String>,
    pub retry_count: u32,
    pub stream_id: Option<String>,
    pub last_error: Option<String>,
}

impl StreamSnapshot {
    fn outcome(&self) -> StreamOutcome {
        StreamOutcome {
            status: self.status,
            articles: Arc::clone(&self.articles),
            sources: self.sources.clone(),
            errors: self.errors.clone(),
            stream_id: self.stream_id.clone(),
            error: self.last_error.clone(),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Default)]
struct ControllerState {
    /// Incremented per start; tasks from older sessions may not touch the snapshot.
    session: u64,
    cancel: Option<CancellationToken>,
    snapshot: StreamSnapshot,
    seen_urls: HashSet<String>,
}

struct ControllerInner {
    backend: Arc<dyn NewsBackend>,
    policy: Arc<dyn BackoffPolicy>,
    state: Mutex<ControllerState>,
}

impl ControllerInner {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives one multi-source streaming fetch at a time.
#[derive(Clone)]
pub struct StreamController {
    inner: Arc<ControllerInner>,
}

impl StreamController {
    pub fn new(backend: Arc<dyn NewsBackend>) -> Self {
        Self::with_policy(backend, Arc::new(ExponentialBackoff::default()))
    }

    pub fn with_policy(backend: Arc<dyn NewsBackend>, policy: Arc<dyn BackoffPolicy>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                backend,
                policy,
                state: Mutex::new(ControllerState::default()),
            }),
        }
    }

    /// Start a session and return its update channel.
    ///
    /// Returns `None` while another session is in flight. Must be called within a
    /// Tokio runtime.
    pub fn start(&self, request: StreamRequest) -> Option<mpsc::UnboundedReceiver<StreamUpdate>> {
        let mut state = self.inner.lock();
        if state.snapshot.status.is_active() {
            tracing::info!(status = %state.snapshot.status, "Stream already in flight, ignoring start");
            return None;
        }

        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        state.cancel = Some(token.clone());
        state.session += 1;
        state.snapshot = StreamSnapshot {
            status: StreamStatus::Starting,
            ..Default::default()
        };
        state.seen_urls.clear();

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamUpdate::Status(StreamStatus::Starting));

        tracing::info!(
            session = state.session,
            use_cache = request.use_cache,
            category = ?request.category,
            "Starting news stream"
        );

        let session = Session {
            inner: Arc::clone(&self.inner),
            id: state.session,
            token,
            tx,
        };
        tokio::spawn(session.run(request));
        Some(rx)
    }

    /// Abort the current session. No further progress or article updates are sent.
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        if state.snapshot.status.is_active() {
            tracing::info!(session = state.session, "News stream cancelled");
            state.snapshot.status = StreamStatus::Cancelled;
        }
    }

    /// Cancel and clear everything back to idle.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        state.session += 1;
        state.snapshot = StreamSnapshot::default();
        state.seen_urls.clear();
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.inner.lock().snapshot.clone()
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.lock().snapshot.status
    }
}

// ============================================================================
// Session task
// ============================================================================

enum Attempt {
    Completed(StreamSummary),
    Failed(ApiError),
    Cancelled,
}

struct Session {
    inner: Arc<ControllerInner>,
    id: u64,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<StreamUpdate>,
}

impl Session {
    async fn run(self, request: StreamRequest) {
        let policy = Arc::clone(&self.inner.policy);
        let mut retry: u32 = 0;

        let status = loop {
            match self.attempt(&request).await {
                Attempt::Completed(summary) => {
                    self.complete(summary);
                    break StreamStatus::Complete;
                }
                Attempt::Cancelled => break StreamStatus::Cancelled,
                Attempt::Failed(e) => {
                    if self.token.is_cancelled() {
                        break StreamStatus::Cancelled;
                    }
                    self.record_error(&e);

                    if !e.is_retryable() || retry >= policy.max_retries() {
                        tracing::error!(
                            session = self.id,
                            error = %e,
                            retries = retry,
                            "News stream failed"
                        );
                        break StreamStatus::Error;
                    }

                    let delay = policy.delay(retry);
                    retry += 1;
                    tracing::warn!(
                        session = self.id,
                        error = %e,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "News stream failed, retrying after delay"
                    );
                    self.emit(|state| {
                        state.snapshot.status = StreamStatus::Retrying(retry);
                        state.snapshot.retry_count = retry;
                        vec![StreamUpdate::Status(StreamStatus::Retrying(retry))]
                    });

                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break StreamStatus::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.finish(status);
    }

    /// One connection to the streaming endpoint, until it completes or fails.
    async fn attempt(&self, request: &StreamRequest) -> Attempt {
        let connect = self.inner.backend.stream_news(request);
        let mut events: EventStream<StreamEvent> = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Attempt::Cancelled,
            result = connect => match result {
                Ok(events) => events,
                Err(e) => return Attempt::Failed(e),
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Attempt::Cancelled,
                next = events.next() => next,
            };

            match next {
                None => return Attempt::Failed(ApiError::StreamClosed),
                Some(Err(e)) => return Attempt::Failed(e),
                Some(Ok(StreamEvent::Progress(event))) => self.progress(event),
                Some(Ok(StreamEvent::SourceComplete { source, articles })) => {
                    self.source_complete(source, articles)
                }
                Some(Ok(StreamEvent::SourceError { source, error })) => {
                    tracing::warn!(session = self.id, source = %source, error = %error, "Source failed");
                    self.emit(|state| {
                        state.snapshot.errors.push(format!("{source}: {error}"));
                        vec![StreamUpdate::SourceFailed { source, error }]
                    });
                }
                Some(Ok(StreamEvent::Done(summary))) => return Attempt::Completed(summary),
            }
        }
    }

    fn progress(&self, event: ProgressEvent) {
        self.emit(|state| {
            let mut updates = Vec::with_capacity(2);
            if state.snapshot.status != StreamStatus::Loading {
                state.snapshot.status = StreamStatus::Loading;
                updates.push(StreamUpdate::Status(StreamStatus::Loading));
            }
            state.snapshot.progress.advance(event);
            updates.push(StreamUpdate::Progress(state.snapshot.progress.clone()));
            updates
        });
    }

    fn source_complete(&self, source: String, articles: Vec<Article>) {
        tracing::debug!(session = self.id, source = %source, count = articles.len(), "Source complete");
        self.emit(|state| {
            merge_articles(state, articles);
            if !state.snapshot.sources.contains(&source) {
                state.snapshot.sources.push(source.clone());
            }
            vec![StreamUpdate::Articles {
                source,
                articles: Arc::clone(&state.snapshot.articles),
            }]
        });
    }

    fn complete(&self, summary: StreamSummary) {
        self.emit(|state| {
            merge_articles(state, summary.articles);
            for source in summary.sources {
                if !state.snapshot.sources.contains(&source) {
                    state.snapshot.sources.push(source);
                }
            }
            for error in summary.errors {
                if !state.snapshot.errors.contains(&error) {
                    state.snapshot.errors.push(error);
                }
            }
            state.snapshot.stream_id = summary.stream_id;
            state.snapshot.retry_count = 0;
            state.snapshot.last_error = None;
            Vec::new()
        });
    }

    fn record_error(&self, error: &ApiError) {
        let message = error.to_string();
        self.emit(|state| {
            state.snapshot.last_error = Some(message);
            Vec::new()
        });
    }

    /// Apply `f` and send its updates, unless this session was cancelled or replaced.
    ///
    /// The check and the sends happen under the controller lock, so nothing is
    /// sent once `cancel` has returned.
    fn emit<F>(&self, f: F)
    where
        F: FnOnce(&mut ControllerState) -> Vec<StreamUpdate>,
    {
        let mut state = self.inner.lock();
        if state.session != self.id || self.token.is_cancelled() {
            return;
        }
        for update in f(&mut state) {
            let _ = self.tx.send(update);
        }
    }

    fn finish(self, status: StreamStatus) {
        let mut state = self.inner.lock();
        // A cancel that lands after the last attempt still wins
        let status = if self.token.is_cancelled() {
            StreamStatus::Cancelled
        } else {
            status
        };
        let current = state.session == self.id;

        let outcome = if current {
            state.snapshot.status = status;
            if status != StreamStatus::Cancelled {
                state.cancel = None;
            }
            state.snapshot.outcome()
        } else {
            StreamOutcome {
                status,
                articles: Arc::new(Vec::new()),
                sources: Vec::new(),
                errors: Vec::new(),
                stream_id: None,
                error: None,
            }
        };

        tracing::info!(
            session = self.id,
            status = %status,
            articles = outcome.articles.len(),
            sources = outcome.sources.len(),
            "News stream finished"
        );

        let _ = self.tx.send(StreamUpdate::Status(status));
        let _ = self.tx.send(StreamUpdate::Finished(outcome));
    }
}

/// Append articles whose URL has not been seen in this session.
fn merge_articles(state: &mut ControllerState, articles: Vec<Article>) {
    let fresh: Vec<Article> = articles
        .into_iter()
        .filter(|article| state.seen_urls.insert(article.url.clone()))
        .collect();
    if !fresh.is_empty() {
        Arc::make_mut(&mut state.snapshot.articles).extend(fresh);
    }
}
