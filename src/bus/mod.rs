//! Cross-tab synchronized state.
//!
//! Each logical domain (liked set, reading queue, source filter, ...) gets one
//! [`SyncBus`]. The bus owns the in-memory snapshot for the tab, fans changes out
//! to in-tab subscribers, writes them through to the shared [`PersistedStore`] and
//! announces them on the [`ChangeFeed`] so other tabs can pick them up.
//!
//! The in-memory snapshot is authoritative within a tab. The persisted copy is a
//! last-writer-wins replica used for propagation and for hydrating new tabs.

mod change;

pub use change::{ChangeFeed, StorageChange, TabId};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::storage::PersistedStore;

/// A synchronized piece of state with its own storage key.
pub trait Domain: Send + Sync + 'static {
    const KEY: &'static str;
    type Value: Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Where a tab's buses persist and announce their writes.
#[derive(Clone)]
pub struct BusContext {
    pub store: PersistedStore,
    pub feed: Option<ChangeFeed>,
    pub tab: TabId,
}

type Callback<V> = Arc<dyn Fn(&V) + Send + Sync>;

struct Inner<D: Domain> {
    snapshot: Mutex<D::Value>,
    subscribers: Mutex<BTreeMap<u64, Callback<D::Value>>>,
    next_subscriber: AtomicU64,
    loaded: OnceCell<()>,
    /// Set once the snapshot has been written locally or from another tab, so a
    /// late hydration never overwrites newer state.
    touched: AtomicBool,
    /// Serializes storage writes so the replica ends on the latest snapshot.
    persist: tokio::sync::Mutex<()>,
    ctx: BusContext,
    _domain: PhantomData<D>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-tab broadcast bus for one [`Domain`].
pub struct SyncBus<D: Domain> {
    inner: Arc<Inner<D>>,
}

impl<D: Domain> Clone for SyncBus<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Domain> SyncBus<D> {
    pub fn new(ctx: BusContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshot: Mutex::new(D::Value::default()),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscriber: AtomicU64::new(0),
                loaded: OnceCell::new(),
                touched: AtomicBool::new(false),
                persist: tokio::sync::Mutex::new(()),
                ctx,
                _domain: PhantomData,
            }),
        }
    }

    pub fn key(&self) -> &'static str {
        D::KEY
    }

    /// Current snapshot.
    pub fn get(&self) -> D::Value {
        lock(&self.inner.snapshot).clone()
    }

    /// Register a callback invoked with every new snapshot.
    ///
    /// The callback runs on the task that caused the change, without any bus lock
    /// held, so it may call back into the bus.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&D::Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).insert(id, Arc::new(callback));

        let weak: Weak<Inner<D>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.subscribers).remove(&id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Replace the snapshot, notify subscribers, then persist and announce.
    pub async fn set(&self, next: D::Value) {
        self.inner.touched.store(true, Ordering::Release);
        self.replace(next);
        self.persist().await;
    }

    /// Read-modify-write on the current snapshot. Returns the value that was set.
    ///
    /// `f` runs under the snapshot lock, so concurrent updates never lose each
    /// other's changes.
    pub async fn update<F>(&self, f: F) -> D::Value
    where
        F: FnOnce(&mut D::Value),
    {
        self.inner.touched.store(true, Ordering::Release);
        let value = {
            let mut snapshot = lock(&self.inner.snapshot);
            f(&mut snapshot);
            snapshot.clone()
        };
        self.notify(&value);
        self.persist().await;
        value
    }

    /// Write the snapshot current at write time, not the one that triggered it.
    async fn persist(&self) {
        let _guard = self.inner.persist.lock().await;
        let current = self.get();
        let ctx = &self.inner.ctx;
        if let Some(raw) = ctx.store.write(D::KEY, &current).await {
            if let Some(feed) = &ctx.feed {
                feed.publish(StorageChange {
                    key: D::KEY.to_string(),
                    value: Some(raw),
                    origin: ctx.tab,
                });
            }
        }
    }

    /// Hydrate from storage, once per bus. Concurrent callers share the same load.
    ///
    /// Skipped when the snapshot was already written, since anything in storage is
    /// then older than what this tab holds.
    pub async fn load(&self) -> D::Value {
        self.inner
            .loaded
            .get_or_init(|| async {
                let stored: D::Value = self.inner.ctx.store.read(D::KEY).await;
                if self.inner.touched.load(Ordering::Acquire) {
                    tracing::debug!(key = D::KEY, "Snapshot already written, skipping hydration");
                    return;
                }
                tracing::debug!(key = D::KEY, tab = %self.inner.ctx.tab, "Hydrated from storage");
                self.replace(stored);
            })
            .await;
        self.get()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.initialized()
    }

    /// Apply a storage change made by another tab.
    ///
    /// Returns `true` when the snapshot changed. Changes for other keys, changes
    /// originating from this tab and unparseable values are ignored.
    pub fn apply_external(&self, change: &StorageChange) -> bool {
        if change.key != D::KEY || change.origin == self.inner.ctx.tab {
            return false;
        }

        let value = match &change.value {
            None => D::Value::default(),
            Some(raw) => match serde_json::from_str::<D::Value>(raw) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        key = D::KEY,
                        origin = %change.origin,
                        error = %e,
                        "Ignoring unparseable storage change"
                    );
                    return false;
                }
            },
        };

        self.inner.touched.store(true, Ordering::Release);
        if *lock(&self.inner.snapshot) == value {
            return false;
        }
        self.replace(value);
        true
    }

    /// Spawn a task applying every change announced on `feed`.
    pub fn listen(&self, feed: &ChangeFeed) -> JoinHandle<()> {
        let mut rx = feed.subscribe();
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        bus.apply_external(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(key = D::KEY, skipped, "Change feed lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn replace(&self, value: D::Value) {
        *lock(&self.inner.snapshot) = value.clone();
        self.notify(&value);
    }

    fn notify(&self, value: &D::Value) {
        let callbacks: Vec<Callback<D::Value>> =
            lock(&self.inner.subscribers).values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }
}

/// Handle returned by [`SyncBus::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
