//! Core data models persisted by the store.
//!
//! These types describe the entities in §3 of the design: collections,
//! content-addressed documents, chunks, tags, links, and the auxiliary rows
//! the store maintains alongside them.

use chrono::{DateTime, Utc};

/// A configured collection of source files.
#[derive(Debug, Clone)]
pub struct Collection {
    pub name: String,
    pub root: String,
    pub glob_pattern: String,
    pub include_exts: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub update_cmd: Option<String>,
    pub language_hint: Option<String>,
}

/// A single tracked source file, identified by `(collection, rel_path)`.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub docid: String,
    pub uri: String,
    pub collection: String,
    pub rel_path: String,
    pub source_hash: String,
    pub source_mime: String,
    pub source_ext: String,
    pub source_size: i64,
    pub source_mtime: i64,
    pub title: Option<String>,
    pub mirror_hash: Option<String>,
    pub converter_id: Option<String>,
    pub converter_version: Option<String>,
    pub language_hint: Option<String>,
    pub active: bool,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub ingest_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write-once Markdown content, addressed by the hash of the converter's
/// output (`mirror_hash`).
#[derive(Debug, Clone)]
pub struct Content {
    pub mirror_hash: String,
    pub markdown: String,
    pub created_at: DateTime<Utc>,
}

/// A single chunk of a content blob's Markdown.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub mirror_hash: String,
    pub seq: i64,
    pub pos: i64,
    pub text: String,
    pub start_line: i64,
    pub end_line: i64,
    pub language: Option<String>,
    pub token_count: Option<i64>,
}

/// A full-text search hit, joined back to its owning document.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub document: Document,
    pub mirror_hash: String,
    pub seq: i64,
    pub snippet: String,
    pub score: f64,
}

/// A vector search hit, joined back to its owning document.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub document: Document,
    pub mirror_hash: String,
    pub seq: i64,
    pub score: f32,
}

/// Source of a tag assignment; multiple sources collapse onto one row per
/// `(document_id, tag)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    Frontmatter,
    Body,
    User,
}

impl TagSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagSource::Frontmatter => "frontmatter",
            TagSource::Body => "body",
            TagSource::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "frontmatter" => Some(TagSource::Frontmatter),
            "body" => Some(TagSource::Body),
            "user" => Some(TagSource::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub document_id: i64,
    pub tag: String,
    pub source: TagSource,
}

/// Kind of a parsed link reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Wiki,
    Markdown,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Wiki => "wiki",
            LinkType::Markdown => "markdown",
        }
    }
}

/// Source of a link row, distinguishing extractor output from user-authored
/// entries (the latter are preserved across re-parses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    Parsed,
    User,
}

impl LinkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkSource::Parsed => "parsed",
            LinkSource::User => "user",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Link {
    pub source_document_id: i64,
    pub ordinal: i64,
    pub target_ref: String,
    pub target_ref_norm: String,
    pub target_anchor: Option<String>,
    pub target_collection: Option<String>,
    pub link_type: LinkType,
    pub link_text: Option<String>,
    pub start_line: i64,
    pub start_col: i64,
    pub end_line: i64,
    pub end_col: i64,
    pub source: LinkSource,
}

/// A link resolved against the current document set.
#[derive(Debug, Clone)]
pub struct ResolvedLink {
    pub link: Link,
    pub target_document_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct IngestError {
    pub collection: String,
    pub rel_path: String,
    pub code: String,
    pub message: String,
    pub details_json: Option<String>,
    pub at: DateTime<Utc>,
}

/// An entry in the model cache manifest (see `model_cache`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelCacheEntry {
    pub uri: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub path: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub cached_at: DateTime<Utc>,
}
