use sha2::{Digest, Sha256};

use crate::api::{PageFilter, PageParam, PageRequest};

/// Namespace holding every article listing.
pub const NEWS_NAMESPACE: &str = "news";

/// How a listing advances between pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageMode {
    /// Cache-backed listing, numeric offsets.
    Offset,
    /// Live listing, opaque server cursors.
    Cursor,
}

/// Identity of one paginated result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub namespace: String,
    pub mode: PageMode,
    pub filter: PageFilter,
    pub page_size: u32,
}

impl QueryKey {
    /// Article listing key. The filter is normalized so equivalent filters share an entry.
    pub fn news(mode: PageMode, filter: &PageFilter, page_size: u32) -> Self {
        Self {
            namespace: NEWS_NAMESPACE.to_string(),
            mode,
            filter: filter.normalized(),
            page_size: page_size.max(1),
        }
    }

    /// Stable, fixed-length key for the cache map.
    pub fn cache_hash(&self) -> String {
        let filter = &self.filter;
        let input = format!(
            "{}|{:?}|category={}|source={}|sources={}|search={}|size={}",
            self.namespace,
            self.mode,
            filter.category.as_deref().unwrap_or(""),
            filter.source.as_deref().unwrap_or(""),
            filter.sources.join(","),
            filter.search.as_deref().unwrap_or(""),
            self.page_size,
        );
        let hash = Sha256::digest(input.as_bytes());
        format!("{:x}", hash)
    }

    pub fn first_param(&self) -> PageParam {
        match self.mode {
            PageMode::Offset => PageParam::Offset(0),
            PageMode::Cursor => PageParam::Cursor(None),
        }
    }

    pub fn request(&self, param: PageParam) -> PageRequest {
        PageRequest {
            limit: self.page_size,
            param,
            filter: self.filter.clone(),
        }
    }

    /// Short human-readable label for logs.
    pub fn description(&self) -> String {
        let mut parts = vec![format!("{} ({:?})", self.namespace, self.mode)];
        if let Some(category) = &self.filter.category {
            parts.push(format!("category {category}"));
        }
        if let Some(source) = &self.filter.source {
            parts.push(format!("source {source}"));
        }
        if !self.filter.sources.is_empty() {
            parts.push(format!("sources {}", self.filter.sources.join(",")));
        }
        if let Some(search) = &self.filter.search {
            parts.push(format!("search '{search}'"));
        }
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_filters_share_hash() {
        let a = QueryKey::news(
            PageMode::Offset,
            &PageFilter {
                sources: vec!["npr".into(), "bbc".into()],
                search: Some(" climate ".into()),
                ..Default::default()
            },
            50,
        );
        let b = QueryKey::news(
            PageMode::Offset,
            &PageFilter {
                sources: vec!["bbc".into(), "npr".into(), "npr".into()],
                search: Some("climate".into()),
                ..Default::default()
            },
            50,
        );
        assert_eq!(a.cache_hash(), b.cache_hash());
        assert_eq!(a.cache_hash().len(), 64);
    }

    #[test]
    fn test_mode_and_size_distinguish_keys() {
        let filter = PageFilter::default();
        let offset = QueryKey::news(PageMode::Offset, &filter, 50);
        let cursor = QueryKey::news(PageMode::Cursor, &filter, 50);
        let smaller = QueryKey::news(PageMode::Offset, &filter, 20);
        assert_ne!(offset.cache_hash(), cursor.cache_hash());
        assert_ne!(offset.cache_hash(), smaller.cache_hash());
    }

    #[test]
    fn test_first_param_by_mode() {
        let filter = PageFilter::default();
        assert_eq!(
            QueryKey::news(PageMode::Offset, &filter, 50).first_param(),
            PageParam::Offset(0)
        );
        assert_eq!(
            QueryKey::news(PageMode::Cursor, &filter, 50).first_param(),
            PageParam::Cursor(None)
        );
    }

    #[test]
    fn test_description() {
        let key = QueryKey::news(
            PageMode::Cursor,
            &PageFilter {
                category: Some("world".into()),
                ..Default::default()
            },
            50,
        );
        assert_eq!(key.description(), "news (Cursor), category world");
    }
}
