use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{apply_optimistic, MutationOutcome, Notices};
use crate::api::{Article, NewsBackend, QueueKind, QueueRecord};
use crate::bus::{Domain, Subscription, SyncBus};

/// An article saved for later reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub article: Article,
    #[serde(default)]
    pub kind: QueueKind,
    pub added_at: DateTime<Utc>,
}

pub struct QueueDomain;

impl Domain for QueueDomain {
    const KEY: &'static str = "readingQueue";
    /// Newest first, unique by article URL.
    type Value = Vec<QueueItem>;
}

/// Reading queue with optimistic remote write-through.
#[derive(Clone)]
pub struct ReadingQueueStore {
    bus: SyncBus<QueueDomain>,
    remote: Option<Arc<dyn NewsBackend>>,
    notices: Notices,
}

impl ReadingQueueStore {
    pub fn new(
        bus: SyncBus<QueueDomain>,
        remote: Option<Arc<dyn NewsBackend>>,
        notices: Notices,
    ) -> Self {
        Self {
            bus,
            remote,
            notices,
        }
    }

    pub fn bus(&self) -> &SyncBus<QueueDomain> {
        &self.bus
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.bus.get()
    }

    pub fn len(&self) -> usize {
        self.bus.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bus.get().is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.bus.get().iter().any(|item| item.article.url == url)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<QueueItem>) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    /// Put `article` at the front of the queue.
    ///
    /// Adding an article whose URL is already queued changes nothing and posts an
    /// informational notice.
    pub async fn add_to_queue(&self, article: Article, kind: QueueKind) -> MutationOutcome {
        if self.contains(&article.url) {
            tracing::debug!(url = %article.url, "Article already queued");
            self.notices.info(format!("\"{}\" is already in queue", article.title));
            return MutationOutcome::AlreadyPresent;
        }

        let record = QueueRecord::for_article(&article, kind);
        let url = article.url.clone();
        let item = QueueItem {
            article,
            kind,
            added_at: Utc::now(),
        };

        let remote = self.remote.as_ref().map(|backend| {
            let backend = Arc::clone(backend);
            async move { backend.enqueue(&record).await }
        });

        apply_optimistic(
            &self.bus,
            &self.notices,
            |items: &mut Vec<QueueItem>| items.insert(0, item),
            |items: &mut Vec<QueueItem>| items.retain(|item| item.article.url != url),
            "add to reading queue",
            remote,
        )
        .await
    }

    /// Remove the item with `url`. A missing URL is a no-op with a notice.
    ///
    /// Every remote failure rolls back, 404 included: the backend answers 404
    /// for routes it cannot match, so it does not prove the item is gone.
    pub async fn remove_from_queue(&self, url: &str) -> MutationOutcome {
        let Some(removed) = self
            .bus
            .get()
            .into_iter()
            .find(|item| item.article.url == url)
        else {
            tracing::debug!(url = %url, "Article not in queue");
            self.notices.info("Article is not in the reading queue");
            return MutationOutcome::NotFound;
        };

        let remote = self.remote.as_ref().map(|backend| {
            let backend = Arc::clone(backend);
            let url = url.to_string();
            async move { backend.dequeue(&url).await }
        });

        apply_optimistic(
            &self.bus,
            &self.notices,
            |items: &mut Vec<QueueItem>| items.retain(|item| item.article.url != url),
            move |items: &mut Vec<QueueItem>| restore(items, removed),
            "remove from reading queue",
            remote,
        )
        .await
    }
}

/// Put a removed item back in newest-first position, unless it was re-added.
fn restore(items: &mut Vec<QueueItem>, removed: QueueItem) {
    if items.iter().any(|item| item.article.url == removed.article.url) {
        return;
    }
    let index = items
        .iter()
        .position(|item| item.added_at < removed.added_at)
        .unwrap_or(items.len());
    items.insert(index, removed);
}
