use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::key::{PageMode, QueryKey};
use crate::api::{ApiError, Article, NewsBackend, Page, PageParam};
use crate::util::catch_panic;

// ============================================================================
// Configuration and observable state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Age after which cached pages are refreshed in the background.
    pub stale_time: Duration,
    /// How long an unmounted entry is kept after its last use.
    pub gc_time: Duration,
    /// Upper bound on cached keys. Mounted or loading entries are never evicted.
    pub max_entries: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            gc_time: Duration::from_secs(5 * 60),
            max_entries: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    LoadingFirstPage,
    Ready,
    LoadingNextPage,
}

/// Snapshot of one paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub status: QueryStatus,
    /// All loaded pages flattened, first occurrence of each URL kept.
    pub articles: Vec<Article>,
    pub total: u64,
    pub page_count: usize,
    pub has_next_page: bool,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub error: Option<String>,
}

impl QueryState {
    fn disabled() -> Self {
        Self {
            status: QueryStatus::Idle,
            articles: Vec::new(),
            total: 0,
            page_count: 0,
            has_next_page: false,
            is_fetching: false,
            is_stale: false,
            error: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::LoadingFirstPage
    }
}

// ============================================================================
// Cache entries
// ============================================================================

type LoadDone = Shared<BoxFuture<'static, ()>>;

struct Pending {
    id: u64,
    done: LoadDone,
}

struct CacheEntry {
    key: QueryKey,
    pages: Vec<Page>,
    params: Vec<PageParam>,
    fetched_at: Option<Instant>,
    last_used: Instant,
    invalidated: bool,
    /// Bumped by every full refresh. Responses from older generations are dropped.
    generation: u64,
    status: QueryStatus,
    error: Option<String>,
    observers: usize,
    pending: Option<Pending>,
}

impl CacheEntry {
    fn new(key: QueryKey) -> Self {
        Self {
            key,
            pages: Vec::new(),
            params: Vec::new(),
            fetched_at: None,
            last_used: Instant::now(),
            invalidated: false,
            generation: 0,
            status: QueryStatus::Idle,
            error: None,
            observers: 0,
            pending: None,
        }
    }

    fn is_stale(&self, stale_time: Duration) -> bool {
        self.invalidated
            || self
                .fetched_at
                .map_or(true, |fetched| fetched.elapsed() >= stale_time)
    }

    fn is_collectable(&self) -> bool {
        self.observers == 0 && self.pending.is_none()
    }

    fn has_next_page(&self) -> bool {
        next_param(self.key.mode, &self.pages).is_some()
    }

    fn state(&self, stale_time: Duration) -> QueryState {
        let mut seen = HashSet::new();
        let articles = self
            .pages
            .iter()
            .flat_map(|page| page.articles.iter())
            .filter(|article| seen.insert(article.url.as_str()))
            .cloned()
            .collect();

        QueryState {
            status: self.status,
            articles,
            total: self.pages.last().map_or(0, |page| page.total),
            page_count: self.pages.len(),
            has_next_page: self.has_next_page(),
            is_fetching: self.pending.is_some(),
            is_stale: !self.pages.is_empty() && self.is_stale(stale_time),
            error: self.error.clone(),
        }
    }
}

/// Parameter for the page after `pages`, or `None` when the listing is exhausted.
///
/// Offset mode trusts `next_cursor` when it parses as a number and otherwise
/// continues from the count of articles fetched so far.
fn next_param(mode: PageMode, pages: &[Page]) -> Option<PageParam> {
    let last = pages.last()?;
    if !last.has_more {
        return None;
    }
    match mode {
        PageMode::Offset => {
            let fetched: u64 = pages.iter().map(|page| page.articles.len() as u64).sum();
            let offset = last
                .next_cursor
                .as_deref()
                .and_then(|cursor| cursor.parse::<u64>().ok())
                .unwrap_or(fetched);
            Some(PageParam::Offset(offset))
        }
        PageMode::Cursor => last
            .next_cursor
            .clone()
            .map(|cursor| PageParam::Cursor(Some(cursor))),
    }
}

// ============================================================================
// Engine
// ============================================================================

enum LoadPlan {
    /// Reload from the first page, up to this many pages.
    Refresh { pages: usize },
    /// Append the page at `index`.
    NextPage { param: PageParam, index: usize },
}

enum Fetched {
    Replace(Vec<Page>, Vec<PageParam>),
    Append(Page, PageParam, usize),
}

struct EngineState {
    entries: LruCache<String, CacheEntry>,
}

struct EngineInner {
    backend: Arc<dyn NewsBackend>,
    config: QueryConfig,
    state: Mutex<EngineState>,
    next_load: AtomicU64,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed, TTL-based cache of paginated article listings.
///
/// Each key has at most one load in flight; callers asking for the same key
/// while it loads await the same spawned task. Loads keep running when the
/// caller that started them goes away.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

/// Background refetches started by [`QueryEngine::invalidate`].
pub struct Refetches {
    loads: Vec<LoadDone>,
}

impl Refetches {
    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    /// Wait until every refetch has settled.
    pub async fn settled(self) {
        futures::future::join_all(self.loads).await;
    }
}

impl QueryEngine {
    pub fn new(backend: Arc<dyn NewsBackend>, config: QueryConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend,
                config,
                state: Mutex::new(EngineState {
                    entries: LruCache::unbounded(),
                }),
                next_load: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Mount an enabled query for `key`.
    pub fn query(&self, key: QueryKey) -> InfiniteQuery {
        self.query_with(key, true)
    }

    /// Mount a query. A disabled query never touches the backend.
    pub fn query_with(&self, key: QueryKey, enabled: bool) -> InfiniteQuery {
        let hash = key.cache_hash();
        if enabled {
            let mut state = self.inner.lock();
            self.sweep_locked(&mut state);
            self.entry(&mut state, &hash, &key).observers += 1;
        }
        tracing::debug!(key = %key.description(), enabled, "Query mounted");
        InfiniteQuery {
            engine: self.clone(),
            key,
            hash,
            enabled,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.lock().entries.contains(&key.cache_hash())
    }

    /// Current state for `key` without mounting it or marking it used.
    pub fn peek(&self, key: &QueryKey) -> Option<QueryState> {
        let state = self.inner.lock();
        state
            .entries
            .peek(&key.cache_hash())
            .map(|entry| entry.state(self.inner.config.stale_time))
    }

    /// Mark every entry in `namespace` stale and refetch the mounted ones.
    ///
    /// Unmounted entries refetch on their next read regardless of age.
    pub fn invalidate(&self, namespace: &str) -> Refetches {
        let mut state = self.inner.lock();
        let mut mounted = Vec::new();
        for (hash, entry) in state.entries.iter_mut() {
            if entry.key.namespace == namespace {
                entry.invalidated = true;
                if entry.observers > 0 {
                    mounted.push((hash.clone(), entry.pages.len().max(1)));
                }
            }
        }

        let loads: Vec<LoadDone> = mounted
            .into_iter()
            .filter_map(|(hash, pages)| {
                start_load(&self.inner, &mut state, &hash, LoadPlan::Refresh { pages })
            })
            .collect();

        tracing::info!(namespace, refetching = loads.len(), "Cache namespace invalidated");
        Refetches { loads }
    }

    /// Set the image of every cached article with `url`. Returns how many were patched.
    pub fn patch_image(&self, url: &str, image: &str) -> usize {
        let mut state = self.inner.lock();
        let mut patched = 0;
        for (_, entry) in state.entries.iter_mut() {
            for article in entry
                .pages
                .iter_mut()
                .flat_map(|page| page.articles.iter_mut())
                .filter(|article| article.url == url)
            {
                article.image = Some(image.to_string());
                patched += 1;
            }
        }
        patched
    }

    /// Drop unmounted entries unused for longer than `gc_time`. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut state = self.inner.lock();
        self.sweep_locked(&mut state)
    }

    fn sweep_locked(&self, state: &mut EngineState) -> usize {
        let gc_time = self.inner.config.gc_time;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_collectable() && entry.last_used.elapsed() >= gc_time)
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &expired {
            if let Some(entry) = state.entries.pop(hash) {
                tracing::debug!(key = %entry.key.description(), "Collected idle cache entry");
            }
        }
        expired.len()
    }

    /// Get or create the entry for `hash`, marking it used.
    fn entry<'a>(
        &self,
        state: &'a mut EngineState,
        hash: &str,
        key: &QueryKey,
    ) -> &'a mut CacheEntry {
        if !state.entries.contains(hash) {
            self.evict_for_insert(state);
        }
        let entry = state
            .entries
            .get_or_insert_mut(hash.to_string(), || CacheEntry::new(key.clone()));
        entry.last_used = Instant::now();
        entry
    }

    fn evict_for_insert(&self, state: &mut EngineState) {
        let excess = (state.entries.len() + 1).saturating_sub(self.inner.config.max_entries);
        if excess == 0 {
            return;
        }
        let victims: Vec<String> = state
            .entries
            .iter()
            .rev()
            .filter(|(_, entry)| entry.is_collectable())
            .take(excess)
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in victims {
            if let Some(entry) = state.entries.pop(&hash) {
                tracing::debug!(key = %entry.key.description(), "Evicted least recently used entry");
            }
        }
    }

    fn unmount(&self, hash: &str) {
        let mut state = self.inner.lock();
        if let Some(entry) = state.entries.peek_mut(hash) {
            entry.observers = entry.observers.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}

/// Begin a load for `hash` on a spawned task and record it as the entry's pending load.
///
/// A refresh supersedes whatever was in flight by bumping the generation.
fn start_load(
    inner: &Arc<EngineInner>,
    state: &mut EngineState,
    hash: &str,
    plan: LoadPlan,
) -> Option<LoadDone> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            tracing::warn!("No async runtime available, skipping page load");
            return None;
        }
    };
    let entry = state.entries.peek_mut(hash)?;

    match &plan {
        LoadPlan::Refresh { .. } => {
            entry.generation += 1;
            entry.status = if entry.pages.is_empty() {
                QueryStatus::LoadingFirstPage
            } else {
                QueryStatus::Ready
            };
        }
        LoadPlan::NextPage { .. } => entry.status = QueryStatus::LoadingNextPage,
    }

    let id = inner.next_load.fetch_add(1, Ordering::Relaxed);
    let task = run_load(
        Arc::clone(inner),
        hash.to_string(),
        entry.key.clone(),
        entry.generation,
        id,
        plan,
    );
    let done: LoadDone = runtime.spawn(task).map(|_| ()).boxed().shared();
    entry.pending = Some(Pending {
        id,
        done: done.clone(),
    });
    Some(done)
}

async fn fetch_pages(
    backend: &dyn NewsBackend,
    key: &QueryKey,
    count: usize,
) -> Result<Fetched, ApiError> {
    let mut pages = Vec::new();
    let mut params = Vec::new();
    let mut param = Some(key.first_param());

    while pages.len() < count {
        let Some(current) = param.take() else {
            break;
        };
        let page = backend
            .fetch_page(&key.request(current.clone()))
            .await?
            .normalize();
        pages.push(page);
        params.push(current);
        param = next_param(key.mode, &pages);
    }
    Ok(Fetched::Replace(pages, params))
}

async fn run_load(
    inner: Arc<EngineInner>,
    hash: String,
    key: QueryKey,
    generation: u64,
    id: u64,
    plan: LoadPlan,
) {
    let load = async {
        match plan {
            LoadPlan::Refresh { pages } => fetch_pages(inner.backend.as_ref(), &key, pages).await,
            LoadPlan::NextPage { param, index } => inner
                .backend
                .fetch_page(&key.request(param.clone()))
                .await
                .map(|page| Fetched::Append(page.normalize(), param, index)),
        }
    };
    let fetched = match catch_panic(load).await {
        Ok(fetched) => fetched,
        Err(panic) => Err(ApiError::Backend(format!("page load panicked: {panic}"))),
    };

    let stale_time = inner.config.stale_time;
    let mut state = inner.lock();
    let Some(entry) = state.entries.peek_mut(&hash) else {
        tracing::debug!(key = %key.description(), "Entry gone before response arrived");
        return;
    };
    if entry.generation != generation {
        tracing::debug!(
            key = %key.description(),
            generation,
            current = entry.generation,
            "Dropping superseded response"
        );
        return;
    }

    match fetched {
        Ok(Fetched::Replace(pages, params)) => {
            entry.pages = pages;
            entry.params = params;
            entry.fetched_at = Some(Instant::now());
            entry.invalidated = false;
            entry.error = None;
            entry.status = QueryStatus::Ready;
        }
        Ok(Fetched::Append(page, param, index)) => {
            if entry.pages.len() == index {
                entry.pages.push(page);
                entry.params.push(param);
                entry.error = None;
            } else {
                tracing::debug!(key = %key.description(), index, "Dropping out-of-order page");
            }
            entry.status = QueryStatus::Ready;
        }
        Err(e) => {
            tracing::warn!(key = %key.description(), error = %e, "Page fetch failed");
            entry.error = Some(e.to_string());
            entry.status = if entry.pages.is_empty() {
                QueryStatus::Idle
            } else {
                QueryStatus::Ready
            };
        }
    }

    if entry.pending.as_ref().is_some_and(|pending| pending.id == id) {
        entry.pending = None;
    }
    tracing::trace!(
        key = %key.description(),
        pages = entry.pages.len(),
        last_param = ?entry.params.last(),
        stale = entry.is_stale(stale_time),
        "Load settled"
    );
}

// ============================================================================
// Mounted query handle
// ============================================================================

/// A mounted, paginated view of one [`QueryKey`].
///
/// While an enabled handle exists its entry counts as mounted: it is refetched on
/// invalidation and is exempt from collection. Dropping the handle unmounts it.
pub struct InfiniteQuery {
    engine: QueryEngine,
    key: QueryKey,
    hash: String,
    enabled: bool,
}

impl InfiniteQuery {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            let mut state = self.engine.inner.lock();
            self.engine.entry(&mut state, &self.hash, &self.key).observers += 1;
        } else {
            self.engine.unmount(&self.hash);
        }
    }

    /// Cached state without triggering any load.
    pub fn state(&self) -> QueryState {
        if !self.enabled {
            return QueryState::disabled();
        }
        let stale_time = self.engine.inner.config.stale_time;
        let mut state = self.engine.inner.lock();
        self.engine
            .entry(&mut state, &self.hash, &self.key)
            .state(stale_time)
    }

    /// Cached state, never blocking. Missing or stale data is refreshed in the background.
    ///
    /// A first page that failed to load is not retried here; use [`fetch`](Self::fetch)
    /// or [`refetch`](Self::refetch).
    pub fn read(&self) -> QueryState {
        if !self.enabled {
            return QueryState::disabled();
        }
        let inner = &self.engine.inner;
        let stale_time = inner.config.stale_time;
        let mut state = inner.lock();

        let entry = self.engine.entry(&mut state, &self.hash, &self.key);
        let failed_first_page = entry.pages.is_empty() && entry.error.is_some();
        let refresh = entry.pending.is_none() && entry.is_stale(stale_time) && !failed_first_page;
        let pages = entry.pages.len().max(1);

        if refresh {
            tracing::debug!(key = %self.key.description(), "Revalidating in background");
            start_load(inner, &mut state, &self.hash, LoadPlan::Refresh { pages });
        }
        self.engine
            .entry(&mut state, &self.hash, &self.key)
            .state(stale_time)
    }

    /// Fresh state: waits for any load in flight and loads when data is missing,
    /// stale or invalidated.
    pub async fn fetch(&self) -> QueryState {
        if !self.enabled {
            return QueryState::disabled();
        }
        let inner = &self.engine.inner;
        let stale_time = inner.config.stale_time;
        let mut joined = false;

        loop {
            let (done, started) = {
                let mut state = inner.lock();
                self.engine.sweep_locked(&mut state);
                let entry = self.engine.entry(&mut state, &self.hash, &self.key);
                let pages = entry.pages.len().max(1);

                if let Some(pending) = &entry.pending {
                    (Some(pending.done.clone()), false)
                } else if !entry.is_stale(stale_time) || joined {
                    (None, false)
                } else {
                    let done =
                        start_load(inner, &mut state, &self.hash, LoadPlan::Refresh { pages });
                    (done, true)
                }
            };

            match done {
                None => break,
                Some(done) => {
                    done.await;
                    if started || joined {
                        break;
                    }
                    joined = true;
                }
            }
        }
        self.state()
    }

    /// Load the page after the last loaded one. Loads the first page if nothing is cached.
    pub async fn fetch_next_page(&self) -> QueryState {
        if !self.enabled {
            return QueryState::disabled();
        }
        let inner = &self.engine.inner;
        let done = {
            let mut state = inner.lock();
            let entry = self.engine.entry(&mut state, &self.hash, &self.key);

            if let Some(pending) = &entry.pending {
                Some(pending.done.clone())
            } else if entry.pages.is_empty() {
                start_load(inner, &mut state, &self.hash, LoadPlan::Refresh { pages: 1 })
            } else {
                match next_param(entry.key.mode, &entry.pages) {
                    Some(param) => {
                        let index = entry.pages.len();
                        tracing::debug!(key = %self.key.description(), ?param, "Fetching next page");
                        start_load(
                            inner,
                            &mut state,
                            &self.hash,
                            LoadPlan::NextPage { param, index },
                        )
                    }
                    None => None,
                }
            }
        };

        if let Some(done) = done {
            done.await;
        }
        self.state()
    }

    pub fn has_next_page(&self) -> bool {
        self.enabled && self.state().has_next_page
    }

    /// Reload every loaded page from the first, superseding any load in flight.
    pub async fn refetch(&self) -> QueryState {
        if !self.enabled {
            return QueryState::disabled();
        }
        let inner = &self.engine.inner;
        let done = {
            let mut state = inner.lock();
            let pages = self
                .engine
                .entry(&mut state, &self.hash, &self.key)
                .pages
                .len()
                .max(1);
            start_load(inner, &mut state, &self.hash, LoadPlan::Refresh { pages })
        };
        if let Some(done) = done {
            done.await;
        }
        self.state()
    }
}

impl Drop for InfiniteQuery {
    fn drop(&mut self) {
        if self.enabled {
            self.engine.unmount(&self.hash);
        }
    }
}
