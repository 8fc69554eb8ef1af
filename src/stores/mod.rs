//! User state stores built on the [`SyncBus`](crate::bus::SyncBus).
//!
//! - [`LikedStore`], [`ReadingQueueStore`] - optimistic updates with remote write-through
//! - [`SourceFilterStore`], [`FavoriteSourcesStore`], [`ReadingHistoryStore`],
//!   [`DigestScheduleStore`] - local-only preferences shared across tabs
//!
//! Mutations never return errors. They report a [`MutationOutcome`] and post a
//! [`Notice`] for anything the user should see.

mod digest;
mod history;
mod liked;
mod queue;
mod sources;

pub use digest::{DigestScheduleDomain, DigestScheduleStore, DigestTime, InvalidDigestTime};
pub use history::{HistoryEntry, ReadingHistoryDomain, ReadingHistoryStore, MAX_HISTORY_ENTRIES};
pub use liked::{LikedDomain, LikedSet, LikedStore};
pub use queue::{QueueDomain, QueueItem, ReadingQueueStore};
pub use sources::{
    FavoriteSourcesDomain, FavoriteSourcesStore, SourceFilterDomain, SourceFilterStore,
    SourceSelection,
};

use tokio::sync::broadcast;

use crate::bus::{Domain, SyncBus};
use crate::util::catch_panic;

const NOTICE_CAPACITY: usize = 64;

// ============================================================================
// Notices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A transient user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Fan-out hub for [`Notice`]s. Clones share the same channel.
#[derive(Clone)]
pub struct Notices {
    tx: broadcast::Sender<Notice>,
}

impl Notices {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.post(NoticeLevel::Info, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.post(NoticeLevel::Error, message.into());
    }

    fn post(&self, level: NoticeLevel, message: String) {
        let _ = self.tx.send(Notice { level, message });
    }
}

impl Default for Notices {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Mutation outcomes
// ============================================================================

/// How an optimistic mutation settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Local state changed and, where enabled, the remote write succeeded.
    Applied,
    /// The item was already present; nothing changed.
    AlreadyPresent,
    /// The item to remove was not present; nothing changed.
    NotFound,
    /// The remote write failed and local state was restored.
    RolledBack { reason: String },
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied)
    }
}

/// Apply a change locally, run the remote write, and undo just that change if
/// the write fails or panics.
///
/// Both `apply` and `revert` run against the snapshot current at that moment,
/// so mutations that settle in between are kept.
async fn apply_optimistic<D, A, R, F>(
    bus: &SyncBus<D>,
    notices: &Notices,
    apply: A,
    revert: R,
    action: &str,
    remote: Option<F>,
) -> MutationOutcome
where
    D: Domain,
    A: FnOnce(&mut D::Value),
    R: FnOnce(&mut D::Value),
    F: std::future::Future<Output = Result<(), crate::api::ApiError>>,
{
    bus.update(apply).await;

    let Some(remote) = remote else {
        return MutationOutcome::Applied;
    };

    let reason = match catch_panic(remote).await {
        Ok(Ok(())) => return MutationOutcome::Applied,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("unexpected failure: {panic}"),
    };

    tracing::warn!(key = D::KEY, action, error = %reason, "Remote write failed, rolling back");
    bus.update(revert).await;
    notices.error(format!("Could not {action}: {reason}"));
    MutationOutcome::RolledBack { reason }
}
