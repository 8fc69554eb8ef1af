//! Per-tab session object.
//!
//! A [`NewsSync`] owns everything one client instance needs: the query engine,
//! the stream controller, every user-state store, and the background tasks that
//! keep them in sync with other tabs and with the backend. Tabs on one machine
//! share a [`KeyValueStore`] and a [`ChangeFeed`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{NewsBackend, PageFilter, StreamRequest};
use crate::bus::{BusContext, ChangeFeed, SyncBus, TabId};
use crate::config::Config;
use crate::ingest::{StreamController, StreamUpdate};
use crate::invalidation::{InvalidationReceiver, InvalidationTarget};
use crate::query::{InfiniteQuery, PageMode, QueryEngine, QueryKey};
use crate::storage::{KeyValueStore, PersistedStore};
use crate::stores::{
    DigestScheduleStore, FavoriteSourcesStore, LikedStore, Notices, ReadingHistoryStore,
    ReadingQueueStore, SourceFilterStore,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Background work owned by a started session.
struct Running {
    listeners: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    receiver: InvalidationReceiver,
}

pub struct NewsSync {
    config: Config,
    backend: Arc<dyn NewsBackend>,
    tab: TabId,
    feed: ChangeFeed,
    notices: Notices,
    engine: QueryEngine,
    stream: StreamController,
    liked: LikedStore,
    queue: ReadingQueueStore,
    sources: SourceFilterStore,
    favorites: FavoriteSourcesStore,
    history: ReadingHistoryStore,
    digest: DigestScheduleStore,
    running: Mutex<Option<Running>>,
}

impl NewsSync {
    pub fn new(
        config: Config,
        backend: Arc<dyn NewsBackend>,
        store: Arc<dyn KeyValueStore>,
        feed: ChangeFeed,
    ) -> Self {
        let tab = TabId::next();
        let ctx = BusContext {
            store: PersistedStore::new(store),
            feed: Some(feed.clone()),
            tab,
        };
        let notices = Notices::new();
        let remote = |enabled: bool| enabled.then(|| Arc::clone(&backend));

        let engine = QueryEngine::new(Arc::clone(&backend), config.query_config());
        let stream =
            StreamController::with_policy(Arc::clone(&backend), Arc::new(config.backoff()));

        tracing::debug!(tab = %tab, "Creating session");

        Self {
            liked: LikedStore::new(
                SyncBus::new(ctx.clone()),
                remote(config.liked_remote_sync),
                notices.clone(),
            ),
            queue: ReadingQueueStore::new(
                SyncBus::new(ctx.clone()),
                remote(config.queue_remote_sync),
                notices.clone(),
            ),
            sources: SourceFilterStore::new(SyncBus::new(ctx.clone())),
            favorites: FavoriteSourcesStore::new(SyncBus::new(ctx.clone())),
            history: ReadingHistoryStore::new(SyncBus::new(ctx.clone())),
            digest: DigestScheduleStore::new(SyncBus::new(ctx)),
            config,
            backend,
            tab,
            feed,
            notices,
            engine,
            stream,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hydrate every store from storage and start the background tasks.
    ///
    /// Calling it again while started only re-runs the (already completed)
    /// hydration.
    pub async fn start(&self) {
        tokio::join!(
            self.liked.bus().load(),
            self.queue.bus().load(),
            self.sources.bus().load(),
            self.favorites.bus().load(),
            self.history.bus().load(),
            self.digest.bus().load(),
        );

        let mut running = self.running();
        if running.is_some() {
            return;
        }

        let listeners = vec![
            self.liked.bus().listen(&self.feed),
            self.queue.bus().listen(&self.feed),
            self.sources.bus().listen(&self.feed),
            self.favorites.bus().listen(&self.feed),
            self.history.bus().listen(&self.feed),
            self.digest.bus().listen(&self.feed),
        ];

        let engine = self.engine.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let swept = engine.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "Swept unused cache entries");
                }
            }
        });

        let target: Arc<dyn InvalidationTarget> = Arc::new(self.engine.clone());
        let receiver = InvalidationReceiver::spawn(
            Arc::clone(&self.backend),
            target,
            self.config.receiver_config(),
        );

        tracing::info!(tab = %self.tab, "Session started");
        *running = Some(Running {
            listeners,
            sweeper,
            receiver,
        });
    }

    pub fn is_started(&self) -> bool {
        self.running().is_some()
    }

    /// Stop background tasks and cancel any stream in flight.
    pub async fn shutdown(&self) {
        self.stream.cancel();
        let running = self.running().take();
        if let Some(running) = running {
            for listener in running.listeners {
                listener.abort();
            }
            running.sweeper.abort();
            running.receiver.shutdown().await;
            tracing::info!(tab = %self.tab, "Session shut down");
        }
    }

    /// Enable or disable the server-push updates connection.
    pub fn set_live_updates(&self, enabled: bool) {
        if let Some(running) = self.running().as_ref() {
            running.receiver.set_enabled(enabled);
        }
    }

    /// Mount the news listing for `filter`, narrowed by the selected sources.
    pub fn news_query(&self, mode: PageMode, filter: &PageFilter) -> InfiniteQuery {
        let filter = self.sources.page_filter(filter);
        self.engine
            .query(QueryKey::news(mode, &filter, self.config.page_size))
    }

    /// Start a streaming fetch using the configured cache preference.
    pub fn start_stream(
        &self,
        category: Option<String>,
    ) -> Option<mpsc::UnboundedReceiver<StreamUpdate>> {
        self.stream.start(StreamRequest {
            use_cache: self.config.use_cache,
            category,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    pub fn notices(&self) -> &Notices {
        &self.notices
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn stream(&self) -> &StreamController {
        &self.stream
    }

    pub fn liked(&self) -> &LikedStore {
        &self.liked
    }

    pub fn queue(&self) -> &ReadingQueueStore {
        &self.queue
    }

    pub fn sources(&self) -> &SourceFilterStore {
        &self.sources
    }

    pub fn favorites(&self) -> &FavoriteSourcesStore {
        &self.favorites
    }

    pub fn history(&self) -> &ReadingHistoryStore {
        &self.history
    }

    pub fn digest(&self) -> &DigestScheduleStore {
        &self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::QueueKind;
    use crate::storage::MemoryStore;
    use crate::testing::{article, page, FakeBackend, Mutation};
    use pretty_assertions::assert_eq;

    fn session(backend: &Arc<FakeBackend>, store: &Arc<MemoryStore>, feed: &ChangeFeed) -> NewsSync {
        let backend: Arc<dyn NewsBackend> = backend.clone();
        let store: Arc<dyn KeyValueStore> = store.clone();
        NewsSync::new(Config::default(), backend, store, feed.clone())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_hydrates_from_storage() {
        let backend = FakeBackend::new();
        let store = Arc::new(MemoryStore::new());
        store.set("likedArticleIds", "[3,1]").await.unwrap();
        store.set("digestScheduleTime", "\"06:30\"").await.unwrap();

        let feed = ChangeFeed::new();
        let tab = session(&backend, &store, &feed);
        tab.start().await;

        assert_eq!(tab.liked().liked().into_iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(tab.digest().get().as_str(), "06:30");
        assert!(tab.is_started());
        tab.shutdown().await;
        assert!(!tab.is_started());
    }

    #[tokio::test]
    async fn test_mutations_reach_other_tab() {
        let backend = FakeBackend::new();
        let store = Arc::new(MemoryStore::new());
        let feed = ChangeFeed::new();
        let a = session(&backend, &store, &feed);
        let b = session(&backend, &store, &feed);
        a.start().await;
        b.start().await;

        assert!(a.liked().toggle_liked(7).await.is_applied());
        assert!(a
            .queue()
            .add_to_queue(article(2), QueueKind::Permanent)
            .await
            .is_applied());
        a.sources().toggle("bbc").await;
        settle().await;

        assert!(b.liked().is_liked(7));
        assert!(b.queue().contains("https://news.example/2"));
        assert!(b.sources().is_selected("bbc"));
        assert_eq!(
            backend.mutations(),
            vec![
                Mutation::Like(7),
                Mutation::Enqueue("https://news.example/2".into(), QueueKind::Permanent)
            ]
        );

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_sync_can_be_disabled() {
        let backend = FakeBackend::new();
        let store = Arc::new(MemoryStore::new());
        let config = Config {
            liked_remote_sync: false,
            ..Config::default()
        };
        let dyn_backend: Arc<dyn NewsBackend> = backend.clone();
        let dyn_store: Arc<dyn KeyValueStore> = store.clone();
        let tab = NewsSync::new(config, dyn_backend, dyn_store, ChangeFeed::new());

        assert!(tab.liked().toggle_liked(1).await.is_applied());
        assert!(backend.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_news_query_applies_source_selection() {
        let backend = FakeBackend::new();
        backend.on_page(|_| Ok(page(0..2, 2, None)));
        let tab = session(&backend, &Arc::new(MemoryStore::new()), &ChangeFeed::new());
        tab.sources().toggle("npr").await;

        let query = tab.news_query(PageMode::Offset, &PageFilter::default());
        let state = query.fetch().await;

        assert_eq!(state.articles.len(), 2);
        let requests = backend.page_requests();
        assert_eq!(requests[0].filter.sources, vec!["npr".to_string()]);
        assert_eq!(requests[0].limit, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stream_uses_configured_cache_preference() {
        let backend = FakeBackend::new();
        let tab = session(&backend, &Arc::new(MemoryStore::new()), &ChangeFeed::new());

        let mut rx = tab.start_stream(Some("world".into())).unwrap();
        while rx.recv().await.is_some() {}

        assert_eq!(
            backend.stream_requests()[0],
            StreamRequest {
                use_cache: true,
                category: Some("world".into())
            }
        );
    }
}
