use std::collections::BTreeSet;

use crate::api::{Article, PageFilter};
use crate::bus::{Domain, Subscription, SyncBus};

/// Selected source names. Empty means every source is shown.
pub type SourceSelection = BTreeSet<String>;

pub struct SourceFilterDomain;

impl Domain for SourceFilterDomain {
    const KEY: &'static str = "selectedSourceIds";
    type Value = SourceSelection;
}

pub struct FavoriteSourcesDomain;

impl Domain for FavoriteSourcesDomain {
    const KEY: &'static str = "favoriteSourceIds";
    type Value = BTreeSet<String>;
}

/// Source filter shared across tabs.
#[derive(Clone)]
pub struct SourceFilterStore {
    bus: SyncBus<SourceFilterDomain>,
}

impl SourceFilterStore {
    pub fn new(bus: SyncBus<SourceFilterDomain>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &SyncBus<SourceFilterDomain> {
        &self.bus
    }

    pub fn selected(&self) -> SourceSelection {
        self.bus.get()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SourceSelection) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    /// Add or remove `source` from the selection. Returns whether it is now selected.
    pub async fn toggle(&self, source: &str) -> bool {
        let next = self
            .bus
            .update(|selection| {
                if !selection.remove(source) {
                    selection.insert(source.to_string());
                }
            })
            .await;
        next.contains(source)
    }

    pub async fn select_only(&self, source: &str) {
        self.bus.set([source.to_string()].into_iter().collect()).await;
    }

    pub async fn clear(&self) {
        self.bus.set(SourceSelection::new()).await;
    }

    /// Whether `source` passes the filter. Everything passes an empty selection.
    pub fn is_selected(&self, source: &str) -> bool {
        let selection = self.bus.get();
        selection.is_empty() || selection.contains(source)
    }

    pub fn matches(&self, article: &Article) -> bool {
        self.is_selected(&article.source)
    }

    pub fn filter(&self, articles: &[Article]) -> Vec<Article> {
        let selection = self.bus.get();
        if selection.is_empty() {
            return articles.to_vec();
        }
        articles
            .iter()
            .filter(|a| selection.contains(&a.source))
            .cloned()
            .collect()
    }

    /// Apply the selection to a page filter's multi-source parameter.
    pub fn page_filter(&self, base: &PageFilter) -> PageFilter {
        let mut filter = base.clone();
        filter.sources = self.bus.get().into_iter().collect();
        filter.normalized()
    }
}

/// Favorite source names.
#[derive(Clone)]
pub struct FavoriteSourcesStore {
    bus: SyncBus<FavoriteSourcesDomain>,
}

impl FavoriteSourcesStore {
    pub fn new(bus: SyncBus<FavoriteSourcesDomain>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &SyncBus<FavoriteSourcesDomain> {
        &self.bus
    }

    pub fn favorites(&self) -> BTreeSet<String> {
        self.bus.get()
    }

    pub fn is_favorite(&self, source: &str) -> bool {
        self.bus.get().contains(source)
    }

    pub async fn toggle(&self, source: &str) -> bool {
        let next = self
            .bus
            .update(|favorites| {
                if !favorites.remove(source) {
                    favorites.insert(source.to_string());
                }
            })
            .await;
        next.contains(source)
    }
}
