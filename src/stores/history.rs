use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::Article;
use crate::bus::{Domain, SyncBus};

pub const MAX_HISTORY_ENTRIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub url: String,
    pub title: String,
    pub source: String,
    pub read_at: DateTime<Utc>,
}

pub struct ReadingHistoryDomain;

impl Domain for ReadingHistoryDomain {
    const KEY: &'static str = "thesis_reading_history";
    type Value = Vec<HistoryEntry>;
}

/// Recently read articles, newest first.
#[derive(Clone)]
pub struct ReadingHistoryStore {
    bus: SyncBus<ReadingHistoryDomain>,
}

impl ReadingHistoryStore {
    pub fn new(bus: SyncBus<ReadingHistoryDomain>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &SyncBus<ReadingHistoryDomain> {
        &self.bus
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.bus.get()
    }

    /// Record a read. Re-reading moves the entry to the front.
    pub async fn record(&self, article: &Article) {
        let entry = HistoryEntry {
            url: article.url.clone(),
            title: article.title.clone(),
            source: article.source.clone(),
            read_at: Utc::now(),
        };
        self.bus
            .update(move |history| {
                history.retain(|e| e.url != entry.url);
                history.insert(0, entry);
                history.truncate(MAX_HISTORY_ENTRIES);
            })
            .await;
    }

    pub async fn clear(&self) {
        self.bus.set(Vec::new()).await;
    }
}
