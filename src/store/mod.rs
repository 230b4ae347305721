//! The store port: every persistence operation the sync pipeline, search,
//! model cache bookkeeping, and link resolver need, expressed as a trait so
//! the rest of the crate depends on a capability set rather than a concrete
//! database. [`sqlite::SqliteStore`] is the only implementation today.

pub mod sqlite;

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::links::ResolutionCandidate;
use crate::models::{
    Chunk, Collection, Document, FtsHit, IngestError, Link, LinkSource, ResolvedLink, Tag,
    TagSource, VectorHit,
};

/// A document as discovered by the walker/sync pipeline, before it has been
/// assigned a database row.
#[derive(Debug, Clone)]
pub struct NewDocument {
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
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub ingest_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FtsSearchOptions {
    pub collection: Option<String>,
    pub limit: i64,
    pub tags_all: Vec<String>,
    pub tags_any: Vec<String>,
    pub lang: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BacklogItem {
    pub mirror_hash: String,
    pub seq: i64,
    pub text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStatus {
    pub documents: i64,
    pub active_documents: i64,
    pub contents: i64,
    pub chunks: i64,
    pub ingest_errors: i64,
}

/// The current schema version and the list of migrations applied to reach
/// it, returned by `open`/`migrate`.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub current_version: i64,
    pub fts_tokenizer: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn migrate(&self, fts_tokenizer: &str) -> CoreResult<MigrationReport>;

    async fn upsert_collection(&self, collection: &Collection) -> CoreResult<()>;

    async fn get_document(&self, id: i64) -> CoreResult<Option<Document>>;
    async fn get_document_by_docid(&self, docid: &str) -> CoreResult<Option<Document>>;
    async fn get_document_by_uri(&self, uri: &str) -> CoreResult<Option<Document>>;
    async fn get_document_by_path(
        &self,
        collection: &str,
        rel_path: &str,
    ) -> CoreResult<Option<Document>>;
    async fn list_documents(
        &self,
        collection: Option<&str>,
        active_only: bool,
    ) -> CoreResult<Vec<Document>>;

    /// Insert or update a document keyed on `(collection, rel_path)`. Returns
    /// `(row_id, docid)`.
    async fn upsert_document(&self, doc: &NewDocument) -> CoreResult<(i64, String)>;

    /// Mark every active document in `collection` whose `rel_path` is not in
    /// `seen_rel_paths` as inactive. Returns the number affected.
    async fn mark_inactive(
        &self,
        collection: &str,
        seen_rel_paths: &std::collections::HashSet<String>,
    ) -> CoreResult<i64>;

    async fn upsert_content(&self, mirror_hash: &str, markdown: &str) -> CoreResult<()>;
    async fn get_content(&self, mirror_hash: &str) -> CoreResult<Option<String>>;

    async fn replace_chunks(&self, mirror_hash: &str, chunks: &[Chunk]) -> CoreResult<()>;
    async fn get_chunks(&self, mirror_hash: &str) -> CoreResult<Vec<Chunk>>;

    async fn rebuild_fts_for_hash(&self, mirror_hash: &str) -> CoreResult<()>;
    async fn search_fts(&self, query: &str, opts: FtsSearchOptions) -> CoreResult<Vec<FtsHit>>;

    async fn record_error(&self, err: &IngestError) -> CoreResult<()>;
    async fn get_recent_errors(
        &self,
        collection: Option<&str>,
        limit: i64,
    ) -> CoreResult<Vec<IngestError>>;

    async fn cleanup_orphans(&self) -> CoreResult<i64>;

    async fn set_doc_tags(
        &self,
        document_id: i64,
        tags: &[String],
        source: TagSource,
    ) -> CoreResult<()>;
    async fn get_tags_for_doc(&self, document_id: i64) -> CoreResult<Vec<Tag>>;
    async fn get_tag_counts(
        &self,
        collection: Option<&str>,
        prefix: Option<&str>,
    ) -> CoreResult<Vec<(String, i64)>>;

    async fn set_doc_links(
        &self,
        document_id: i64,
        links: &[crate::links::ParsedLink],
        source: LinkSource,
    ) -> CoreResult<()>;
    async fn get_links_for_doc(&self, document_id: i64) -> CoreResult<Vec<Link>>;
    async fn resolution_candidates(
        &self,
        collection: Option<&str>,
    ) -> CoreResult<Vec<ResolutionCandidate>>;
    async fn resolve_links_for_doc(&self, document_id: i64) -> CoreResult<Vec<ResolvedLink>>;
    async fn get_backlinks_for_doc(
        &self,
        document_id: i64,
        collection: Option<&str>,
    ) -> CoreResult<Vec<Link>>;

    async fn upsert_vectors(
        &self,
        mirror_hash: &str,
        model: &str,
        vectors: &[(i64, Vec<f32>)],
    ) -> CoreResult<()>;
    async fn delete_vectors_for_mirror(&self, mirror_hash: &str, model: &str) -> CoreResult<()>;
    async fn search_nearest(
        &self,
        model: &str,
        query_vec: &[f32],
        limit: i64,
    ) -> CoreResult<Vec<VectorHit>>;
    async fn count_vectors(&self, model: &str) -> CoreResult<i64>;
    async fn get_backlog(
        &self,
        model: &str,
        limit: i64,
        after: Option<(String, i64)>,
    ) -> CoreResult<Vec<BacklogItem>>;

    async fn get_status(&self) -> CoreResult<StoreStatus>;
}
