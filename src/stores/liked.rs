use std::collections::BTreeSet;
use std::sync::Arc;

use super::{apply_optimistic, MutationOutcome, Notices};
use crate::api::NewsBackend;
use crate::bus::{Domain, Subscription, SyncBus};

pub type LikedSet = BTreeSet<i64>;

pub struct LikedDomain;

impl Domain for LikedDomain {
    const KEY: &'static str = "likedArticleIds";
    type Value = LikedSet;
}

/// Liked article ids with optimistic remote write-through.
#[derive(Clone)]
pub struct LikedStore {
    bus: SyncBus<LikedDomain>,
    remote: Option<Arc<dyn NewsBackend>>,
    notices: Notices,
}

impl LikedStore {
    /// `remote: None` keeps likes local to the persisted store.
    pub fn new(
        bus: SyncBus<LikedDomain>,
        remote: Option<Arc<dyn NewsBackend>>,
        notices: Notices,
    ) -> Self {
        Self {
            bus,
            remote,
            notices,
        }
    }

    pub fn bus(&self) -> &SyncBus<LikedDomain> {
        &self.bus
    }

    pub fn liked(&self) -> LikedSet {
        self.bus.get()
    }

    pub fn is_liked(&self, article_id: i64) -> bool {
        self.bus.get().contains(&article_id)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LikedSet) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    /// Flip membership of `article_id`.
    ///
    /// The new set is visible immediately. Unliking something the backend has
    /// already forgotten counts as success.
    pub async fn toggle_liked(&self, article_id: i64) -> MutationOutcome {
        let liking = !self.is_liked(article_id);

        tracing::debug!(article_id, liking, "Toggling liked article");

        let remote = self.remote.as_ref().map(|backend| {
            let backend = Arc::clone(backend);
            async move {
                if liking {
                    backend.like_article(article_id).await
                } else {
                    match backend.unlike_article(article_id).await {
                        Err(e) if e.is_not_found() => Ok(()),
                        other => other,
                    }
                }
            }
        });

        let action = if liking { "like article" } else { "unlike article" };
        apply_optimistic(
            &self.bus,
            &self.notices,
            |set: &mut LikedSet| set_liked(set, article_id, liking),
            |set: &mut LikedSet| set_liked(set, article_id, !liking),
            action,
            remote,
        )
        .await
    }
}

fn set_liked(set: &mut LikedSet, article_id: i64, liked: bool) {
    if liked {
        set.insert(article_id);
    } else {
        set.remove(&article_id);
    }
}
