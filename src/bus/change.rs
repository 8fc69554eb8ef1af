use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 256;

static NEXT_TAB: AtomicU64 = AtomicU64::new(1);

/// Identity of one client instance sharing the persisted store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(u64);

impl TabId {
    /// Allocate an id unique within this process.
    pub fn next() -> Self {
        Self(NEXT_TAB.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// A write to the shared store, as observed by other tabs.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    /// Serialized new value, `None` when the key was removed.
    pub value: Option<String>,
    pub origin: TabId,
}

/// Storage-change notifications shared by every tab attached to one store.
///
/// This stands in for the host's "storage changed" event. Tests create one feed
/// and hand it to several sessions to simulate multiple tabs.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<StorageChange>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Announce a write. Having no listeners is not an error.
    pub fn publish(&self, change: StorageChange) {
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
