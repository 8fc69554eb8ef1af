use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// Articles
// ============================================================================

/// A news article as delivered by the backend.
///
/// Identity is the remote `url`, which is stable across sources. Articles are
/// replaced wholesale; the only field ever patched in place is `image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawArticle")]
pub struct Article {
    /// Backend row id, required for liking. Absent for articles that only exist in a stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub url: String,
    pub source: String,
    pub country: Option<String>,
    pub credibility: Option<String>,
    pub bias: Option<String>,
    pub summary: Option<String>,
    pub image: Option<String>,
    pub published: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub language: Option<String>,
    pub translated: bool,
}

impl Article {
    /// Minimal article with the given identity, used by callers that only know a URL.
    pub fn new(url: impl Into<String>, title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            url: url.into(),
            source: source.into(),
            country: None,
            credibility: None,
            bias: None,
            summary: None,
            image: None,
            published: None,
            category: DEFAULT_CATEGORY.to_string(),
            tags: Vec::new(),
            language: None,
            translated: false,
        }
    }
}

const DEFAULT_CATEGORY: &str = "general";

/// Wire shape accepted for articles.
///
/// The streaming endpoint still emits the legacy `link`/`description` names while
/// the paginated endpoints use `url`/`summary`; both are accepted.
#[derive(Deserialize)]
struct RawArticle {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, alias = "credibility_tier")]
    credibility: Option<String>,
    #[serde(default, alias = "bias_rating")]
    bias: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "image_url")]
    image: Option<String>,
    #[serde(default, alias = "published_at")]
    published: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    translated: bool,
}

impl TryFrom<RawArticle> for Article {
    type Error = String;

    fn try_from(raw: RawArticle) -> Result<Self, Self::Error> {
        let url = raw
            .url
            .or(raw.link)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| "article has no url".to_string())?;

        Ok(Article {
            id: raw.id,
            title: raw.title,
            url,
            source: raw.source,
            country: raw.country,
            credibility: raw.credibility,
            bias: raw.bias,
            summary: raw.summary.or(raw.description),
            image: raw.image.filter(|i| !i.is_empty()),
            published: raw.published,
            category: raw
                .category
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            tags: raw.tags,
            language: raw.language,
            translated: raw.translated,
        })
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// One page of a paginated article listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub articles: Vec<Article>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub limit: u32,
    /// Offset (as a string) in offset mode, opaque token in cursor mode.
    #[serde(default, deserialize_with = "cursor_token")]
    pub next_cursor: Option<String>,
    #[serde(default, deserialize_with = "cursor_token")]
    pub prev_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl Page {
    /// Enforce `has_more == next_cursor.is_some()`.
    ///
    /// A page claiming more results without a cursor is treated as the last page,
    /// and a cursor on a final page is dropped.
    pub fn normalize(mut self) -> Self {
        if self.has_more != self.next_cursor.is_some() {
            tracing::debug!(
                has_more = self.has_more,
                next_cursor = ?self.next_cursor,
                "Page cursor disagrees with has_more, treating as final page"
            );
            self.has_more = false;
            self.next_cursor = None;
        }
        self
    }
}

/// Accept `null`, a string, or a number for cursor fields.
fn cursor_token<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "unexpected cursor value: {other}"
            )))
        }
    })
}

/// Filter parameters shared by both pagination modes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PageFilter {
    pub category: Option<String>,
    pub source: Option<String>,
    /// Multi-source selection, sent comma-joined. Empty means no source filter.
    pub sources: Vec<String>,
    pub search: Option<String>,
}

impl PageFilter {
    /// Canonical form: trimmed text, empty strings dropped, sources sorted and deduplicated.
    pub fn normalized(&self) -> Self {
        fn clean(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        let mut sources: Vec<String> = self
            .sources
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        sources.sort();
        sources.dedup();

        Self {
            category: clean(&self.category),
            source: clean(&self.source),
            sources,
            search: clean(&self.search),
        }
    }
}

/// Page position requested from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageParam {
    /// Cache-backed listing, numeric offset.
    Offset(u64),
    /// Live listing, opaque cursor (`None` for the first page).
    Cursor(Option<String>),
}

/// A single paginated fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub limit: u32,
    pub param: PageParam,
    pub filter: PageFilter,
}

// ============================================================================
// Streaming
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub use_cache: bool,
    pub category: Option<String>,
}

/// Raw progress counters reported by the streaming endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub message: Option<String>,
}

/// Everything a streaming fetch reports, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress(ProgressEvent),
    SourceComplete { source: String, articles: Vec<Article> },
    SourceError { source: String, error: String },
    Done(StreamSummary),
}

/// Final resolution of a streaming fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub articles: Vec<Article>,
    pub sources: Vec<String>,
    pub errors: Vec<String>,
    pub stream_id: Option<String>,
}

// ============================================================================
// Server push
// ============================================================================

/// A message on the updates channel. Only `invalidate` is acted upon.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

// ============================================================================
// Mutations
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    #[default]
    Daily,
    Permanent,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Daily => f.write_str("daily"),
            QueueKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Body of a reading-queue add request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueRecord {
    pub article_id: Option<i64>,
    pub article_title: String,
    pub article_url: String,
    pub article_source: String,
    pub article_image: Option<String>,
    pub queue_type: QueueKind,
}

impl QueueRecord {
    pub fn for_article(article: &Article, kind: QueueKind) -> Self {
        Self {
            article_id: article.id,
            article_title: article.title.clone(),
            article_url: article.url.clone(),
            article_source: article.source.clone(),
            article_image: article.image.clone(),
            queue_type: kind,
        }
    }
}
