//! Core domain types shared by the crawl, extraction and chunking stages.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// FetchResult
// ---------------------------------------------------------------------------

/// Outcome of fetching one URL. Never an error: failures are encoded in `status`/`error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    /// HTTP status, or one of the sentinels below.
    pub status: u16,
    /// Decoded response body (empty for sentinel results).
    pub body: String,
    /// Response headers, lowercased names.
    pub headers: BTreeMap<String, String>,
    /// URL after redirects.
    pub final_url: String,
    /// Failure reason, if any.
    pub error: Option<String>,
    /// Number of network attempts made (0 when robots.txt blocked the URL).
    pub attempts: u32,
}

impl FetchResult {
    /// Status used when every attempt failed at the transport level.
    pub const NETWORK_FAILURE: u16 = 0;
    /// Status used when robots.txt disallows the URL.
    pub const ROBOTS_BLOCKED: u16 = 403;

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Synthetic result for a URL disallowed by robots.txt.
    pub fn robots_blocked(url: &str) -> Self {
        Self {
            status: Self::ROBOTS_BLOCKED,
            body: String::new(),
            headers: BTreeMap::new(),
            final_url: url.to_string(),
            error: Some("Blocked by robots.txt".into()),
            attempts: 0,
        }
    }

    /// Synthetic result after retries are exhausted.
    pub fn network_failure(url: &str, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: Self::NETWORK_FAILURE,
            body: String::new(),
            headers: BTreeMap::new(),
            final_url: url.to_string(),
            error: Some(error.into()),
            attempts,
        }
    }

    /// Value of the `content-type` header, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// OrderedMap / ContextSnapshot
// ---------------------------------------------------------------------------

/// A small insertion-ordered string map. Serializes as a JSON/TOML map in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedMap(Vec<(String, String)>);

/// Heading path active when a block was produced, outermost first.
/// Keys are `h0`..`h6` for headings and `pseudo` for pseudo-headers and callouts.
pub type ContextSnapshot = OrderedMap;

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, v)| v.as_str())
    }

    /// Values joined with `sep`, e.g. `"Inscrição > Documentos"`.
    pub fn joined(&self, sep: &str) -> String {
        self.values().collect::<Vec<_>>().join(sep)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for OrderedMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for OrderedMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderedMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor;

        impl<'de> Visitor<'de> for OrderedMapVisitor {
            type Value = OrderedMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<OrderedMap, A::Error> {
                let mut map = OrderedMap::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor)
    }
}

// ---------------------------------------------------------------------------
// ContentBlock
// ---------------------------------------------------------------------------

/// Extraction confidence attached to blocks and chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Structural summary of a table, produced at extraction time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub columns: usize,
}

impl TableSummary {
    /// Plain-text rendering used when the raw markup cannot be turned into entities.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        if !self.headers.is_empty() {
            lines.push(self.headers.join(" | "));
        }
        for row in &self.rows {
            lines.push(row.join(" | "));
        }
        lines.join("\n")
    }
}

/// Variant-specific payload of a [`ContentBlock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    /// Prose. `atomic` blocks were produced under a pseudo-header and must not be split.
    Text { atomic: bool },
    /// `•`-prefixed items, one per line.
    List { ordered: bool },
    /// `content` holds the raw table markup.
    Table { summary: TableSummary },
    /// `content` holds the absolute embed URL.
    Iframe,
}

/// A typed unit of page content with the section context it was found under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(flatten)]
    pub kind: BlockKind,
    pub content: String,
    pub context: ContextSnapshot,
    pub source_url: String,
    pub confidence: Confidence,
}

impl ContentBlock {
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, BlockKind::Text { atomic: true })
    }
}

// ---------------------------------------------------------------------------
// SemanticChunk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    TableEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Html,
    Iframe,
}

/// Metadata persisted alongside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub source_url: String,
    pub source_type: SourceType,
    pub entity_type: String,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub context: ContextSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_value: Option<String>,
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub attributes: OrderedMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iframe_src: Option<String>,
}

impl ChunkMetadata {
    /// Metadata for a chunk without table or iframe fields.
    pub fn new(
        chunk_type: ChunkType,
        source_url: impl Into<String>,
        entity_type: impl Into<String>,
        confidence: Confidence,
        context: ContextSnapshot,
    ) -> Self {
        Self {
            chunk_type,
            source_url: source_url.into(),
            source_type: SourceType::Html,
            entity_type: entity_type.into(),
            confidence,
            context,
            key_field: None,
            key_value: None,
            attributes: OrderedMap::new(),
            table_context: None,
            iframe_src: None,
        }
    }
}

/// The persisted unit: content-addressed text plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChunk {
    /// Lowercase hex SHA-256 of `"{source_url}:{text}"`.
    pub hash: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

// ---------------------------------------------------------------------------
// SourceDocument
// ---------------------------------------------------------------------------

/// A crawled page as handed to persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub url: String,
    pub normalized_url: String,
    pub title: String,
    pub source_type: String,
}
