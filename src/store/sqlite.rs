//! SQLite implementation of the [`Store`] port.
//!
//! Schema, migrations, and queries live together here because SQLite's
//! FTS5 virtual tables and the plain tables around them are tightly
//! coupled — keeping the table DDL next to the queries that assume its
//! shape makes that coupling visible.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::links::{ParsedLink, ResolutionCandidate};
use crate::models::{
    Chunk, Collection, Document, FtsHit, IngestError, Link, LinkSource, LinkType, ResolvedLink,
    Tag, TagSource, VectorHit,
};

use super::{
    BacklogItem, FtsSearchOptions, MigrationReport, NewDocument, Store, StoreStatus,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &std::path::Path) -> CoreResult<Self> {
        let pool = crate::db::connect_path(db_path).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        docid: row.get("docid"),
        uri: row.get("uri"),
        collection: row.get("collection"),
        rel_path: row.get("rel_path"),
        source_hash: row.get("source_hash"),
        source_mime: row.get("source_mime"),
        source_ext: row.get("source_ext"),
        source_size: row.get("source_size"),
        source_mtime: row.get("source_mtime"),
        title: row.get("title"),
        mirror_hash: row.get("mirror_hash"),
        converter_id: row.get("converter_id"),
        converter_version: row.get("converter_version"),
        language_hint: row.get("language_hint"),
        active: row.get::<i64, _>("active") != 0,
        last_error_code: row.get("last_error_code"),
        last_error_message: row.get("last_error_message"),
        ingest_version: row.get("ingest_version"),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")),
    }
}

const DOCUMENT_COLUMNS: &str = "documents.id, documents.docid, documents.uri, documents.collection, \
    documents.rel_path, documents.source_hash, documents.source_mime, documents.source_ext, \
    documents.source_size, documents.source_mtime, documents.title, documents.mirror_hash, \
    documents.converter_id, documents.converter_version, documents.language_hint, documents.active, \
    documents.last_error_code, documents.last_error_message, documents.ingest_version, \
    documents.created_at, documents.updated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn migrate(&self, fts_tokenizer: &str) -> CoreResult<MigrationReport> {
        let mut applied = Vec::new();

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        let existing_tokenizer: Option<String> =
            sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'fts_tokenizer'")
                .fetch_optional(&self.pool)
                .await?;

        if let Some(existing) = &existing_tokenizer {
            if existing != fts_tokenizer {
                return Err(CoreError::new(
                    ErrorCode::MigrationFailed,
                    format!(
                        "store was opened with fts_tokenizer='{existing}', cannot reopen with '{fts_tokenizer}'"
                    ),
                ));
            }
        } else {
            sqlx::query("INSERT INTO schema_meta (key, value) VALUES ('fts_tokenizer', ?)")
                .bind(fts_tokenizer)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                root TEXT NOT NULL,
                glob_pattern TEXT NOT NULL,
                include_exts TEXT NOT NULL DEFAULT '[]',
                exclude_globs TEXT NOT NULL DEFAULT '[]',
                update_cmd TEXT,
                language_hint TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("collections".to_string());

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                docid TEXT NOT NULL,
                uri TEXT NOT NULL,
                collection TEXT NOT NULL,
                rel_path TEXT NOT NULL,
                source_hash TEXT NOT NULL,
                source_mime TEXT NOT NULL,
                source_ext TEXT NOT NULL,
                source_size INTEGER NOT NULL,
                source_mtime INTEGER NOT NULL,
                title TEXT,
                mirror_hash TEXT,
                converter_id TEXT,
                converter_version TEXT,
                language_hint TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                last_error_code TEXT,
                last_error_message TEXT,
                ingest_version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(collection, rel_path)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("documents".to_string());

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_docid ON documents(docid)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_mirror_hash ON documents(mirror_hash)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_collection_active ON documents(collection, active)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS content (
                mirror_hash TEXT PRIMARY KEY,
                markdown TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("content".to_string());

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chunks (
                mirror_hash TEXT NOT NULL,
                seq INTEGER NOT NULL,
                pos INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                language TEXT,
                token_count INTEGER,
                created_at TEXT NOT NULL,
                PRIMARY KEY (mirror_hash, seq)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("chunks".to_string());

        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
        )
        .fetch_one(&self.pool)
        .await?;

        if !fts_exists {
            sqlx::query(&format!(
                r#"CREATE VIRTUAL TABLE chunks_fts USING fts5(
                    mirror_hash UNINDEXED,
                    seq UNINDEXED,
                    text,
                    tokenize = '{fts_tokenizer}'
                )"#,
            ))
            .execute(&self.pool)
            .await?;
            applied.push("chunks_fts".to_string());
        }

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS vectors (
                mirror_hash TEXT NOT NULL,
                seq INTEGER NOT NULL,
                model TEXT NOT NULL,
                embedding BLOB NOT NULL,
                embedded_at TEXT NOT NULL,
                PRIMARY KEY (mirror_hash, seq, model)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("vectors".to_string());

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tags (
                document_id INTEGER NOT NULL,
                tag TEXT NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (document_id, tag)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("tags".to_string());
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS links (
                source_document_id INTEGER NOT NULL,
                ordinal INTEGER NOT NULL,
                target_ref TEXT NOT NULL,
                target_ref_norm TEXT NOT NULL,
                target_anchor TEXT,
                target_collection TEXT,
                link_type TEXT NOT NULL,
                link_text TEXT,
                start_line INTEGER NOT NULL,
                start_col INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                end_col INTEGER NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (source_document_id, source, ordinal)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("links".to_string());
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_target_ref_norm ON links(target_ref_norm)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ingest_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                rel_path TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT NOT NULL,
                details_json TEXT,
                at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        applied.push("ingest_errors".to_string());

        let current_version: i64 = applied.len() as i64;

        Ok(MigrationReport {
            applied,
            current_version,
            fts_tokenizer: fts_tokenizer.to_string(),
        })
    }

    async fn upsert_collection(&self, c: &Collection) -> CoreResult<()> {
        sqlx::query(
            r#"INSERT INTO collections (name, root, glob_pattern, include_exts, exclude_globs, update_cmd, language_hint)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 root = excluded.root,
                 glob_pattern = excluded.glob_pattern,
                 include_exts = excluded.include_exts,
                 exclude_globs = excluded.exclude_globs,
                 update_cmd = excluded.update_cmd,
                 language_hint = excluded.language_hint"#,
        )
        .bind(&c.name)
        .bind(&c.root)
        .bind(&c.glob_pattern)
        .bind(serde_json::to_string(&c.include_exts).unwrap_or_default())
        .bind(serde_json::to_string(&c.exclude_globs).unwrap_or_default())
        .bind(&c.update_cmd)
        .bind(&c.language_hint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: i64) -> CoreResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn get_document_by_docid(&self, docid: &str) -> CoreResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE docid = ?"
        ))
        .bind(docid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn get_document_by_uri(&self, uri: &str) -> CoreResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE uri = ?"
        ))
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn get_document_by_path(
        &self,
        collection: &str,
        rel_path: &str,
    ) -> CoreResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ? AND rel_path = ?"
        ))
        .bind(collection)
        .bind(rel_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn list_documents(
        &self,
        collection: Option<&str>,
        active_only: bool,
    ) -> CoreResult<Vec<Document>> {
        let mut sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE 1=1");
        if collection.is_some() {
            sql.push_str(" AND collection = ?");
        }
        if active_only {
            sql.push_str(" AND active = 1");
        }
        sql.push_str(" ORDER BY rel_path ASC");

        let mut query = sqlx::query(&sql);
        if let Some(c) = collection {
            query = query.bind(c);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn upsert_document(&self, doc: &NewDocument) -> CoreResult<(i64, String)> {
        let docid = crate::uri::docid_from_source_hash(&doc.source_hash);
        let uri = crate::uri::build_uri(&doc.collection, &doc.rel_path);
        let now = now_rfc3339();

        sqlx::query(
            r#"INSERT INTO documents (
                docid, uri, collection, rel_path, source_hash, source_mime, source_ext,
                source_size, source_mtime, title, mirror_hash, converter_id, converter_version,
                language_hint, active, last_error_code, last_error_message, ingest_version,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, rel_path) DO UPDATE SET
                docid = excluded.docid,
                uri = excluded.uri,
                source_hash = excluded.source_hash,
                source_mime = excluded.source_mime,
                source_ext = excluded.source_ext,
                source_size = excluded.source_size,
                source_mtime = excluded.source_mtime,
                title = excluded.title,
                mirror_hash = excluded.mirror_hash,
                converter_id = excluded.converter_id,
                converter_version = excluded.converter_version,
                language_hint = excluded.language_hint,
                active = 1,
                last_error_code = excluded.last_error_code,
                last_error_message = excluded.last_error_message,
                ingest_version = excluded.ingest_version,
                updated_at = excluded.updated_at"#,
        )
        .bind(&docid)
        .bind(&uri)
        .bind(&doc.collection)
        .bind(&doc.rel_path)
        .bind(&doc.source_hash)
        .bind(&doc.source_mime)
        .bind(&doc.source_ext)
        .bind(doc.source_size)
        .bind(doc.source_mtime)
        .bind(&doc.title)
        .bind(&doc.mirror_hash)
        .bind(&doc.converter_id)
        .bind(&doc.converter_version)
        .bind(&doc.language_hint)
        .bind(&doc.last_error_code)
        .bind(&doc.last_error_message)
        .bind(doc.ingest_version)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM documents WHERE collection = ? AND rel_path = ?")
                .bind(&doc.collection)
                .bind(&doc.rel_path)
                .fetch_one(&self.pool)
                .await?;

        Ok((id, docid))
    }

    async fn mark_inactive(
        &self,
        collection: &str,
        seen_rel_paths: &HashSet<String>,
    ) -> CoreResult<i64> {
        let rows = sqlx::query("SELECT id, rel_path FROM documents WHERE collection = ? AND active = 1")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let mut count = 0i64;
        let now = now_rfc3339();
        for row in rows {
            let id: i64 = row.get("id");
            let rel_path: String = row.get("rel_path");
            if !seen_rel_paths.contains(&rel_path) {
                sqlx::query("UPDATE documents SET active = 0, updated_at = ? WHERE id = ?")
                    .bind(&now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn upsert_content(&self, mirror_hash: &str, markdown: &str) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO content (mirror_hash, markdown, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(mirror_hash) DO NOTHING",
        )
        .bind(mirror_hash)
        .bind(markdown)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_content(&self, mirror_hash: &str) -> CoreResult<Option<String>> {
        let v = sqlx::query_scalar("SELECT markdown FROM content WHERE mirror_hash = ?")
            .bind(mirror_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(v)
    }

    async fn replace_chunks(&self, mirror_hash: &str, chunks: &[Chunk]) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE mirror_hash = ?")
            .bind(mirror_hash)
            .execute(&mut *tx)
            .await?;

        let now = now_rfc3339();
        for c in chunks {
            sqlx::query(
                r#"INSERT INTO chunks (mirror_hash, seq, pos, text, start_line, end_line, language, token_count, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(mirror_hash)
            .bind(c.seq)
            .bind(c.pos)
            .bind(&c.text)
            .bind(c.start_line)
            .bind(c.end_line)
            .bind(&c.language)
            .bind(c.token_count)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_chunks(&self, mirror_hash: &str) -> CoreResult<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT mirror_hash, seq, pos, text, start_line, end_line, language, token_count \
             FROM chunks WHERE mirror_hash = ? ORDER BY seq ASC",
        )
        .bind(mirror_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Chunk {
                mirror_hash: row.get("mirror_hash"),
                seq: row.get("seq"),
                pos: row.get("pos"),
                text: row.get("text"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                language: row.get("language"),
                token_count: row.get("token_count"),
            })
            .collect())
    }

    async fn rebuild_fts_for_hash(&self, mirror_hash: &str) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE mirror_hash = ?")
            .bind(mirror_hash)
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query("SELECT seq, text FROM chunks WHERE mirror_hash = ? ORDER BY seq ASC")
            .bind(mirror_hash)
            .fetch_all(&mut *tx)
            .await?;

        for row in rows {
            let seq: i64 = row.get("seq");
            let text: String = row.get("text");
            sqlx::query("INSERT INTO chunks_fts (mirror_hash, seq, text) VALUES (?, ?, ?)")
                .bind(mirror_hash)
                .bind(seq)
                .bind(text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search_fts(&self, query: &str, opts: FtsSearchOptions) -> CoreResult<Vec<FtsHit>> {
        let limit = if opts.limit > 0 { opts.limit } else { 20 };

        let mut sql = format!(
            r#"SELECT {DOCUMENT_COLUMNS}, chunks_fts.mirror_hash AS fts_mirror_hash, chunks_fts.seq AS fts_seq,
                 snippet(chunks_fts, 2, '[', ']', '...', 12) AS snippet,
                 bm25(chunks_fts) AS rank
               FROM chunks_fts
               JOIN documents ON documents.mirror_hash = chunks_fts.mirror_hash
               WHERE chunks_fts MATCH ? AND documents.active = 1"#
        );

        if opts.collection.is_some() {
            sql.push_str(" AND documents.collection = ?");
        }
        if !opts.tags_all.is_empty() {
            for _ in &opts.tags_all {
                sql.push_str(
                    " AND documents.id IN (SELECT document_id FROM tags WHERE tag = ?)",
                );
            }
        }
        if !opts.tags_any.is_empty() {
            sql.push_str(" AND documents.id IN (SELECT document_id FROM tags WHERE tag IN (");
            sql.push_str(&vec!["?"; opts.tags_any.len()].join(","));
            sql.push_str("))");
        }
        if opts.lang.is_some() {
            sql.push_str(" AND EXISTS (SELECT 1 FROM chunks WHERE chunks.mirror_hash = chunks_fts.mirror_hash AND chunks.seq = chunks_fts.seq AND chunks.language = ?)");
        }

        sql.push_str(" ORDER BY rank ASC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(query);
        if let Some(c) = &opts.collection {
            q = q.bind(c);
        }
        for t in &opts.tags_all {
            q = q.bind(t);
        }
        for t in &opts.tags_any {
            q = q.bind(t);
        }
        if let Some(l) = &opts.lang {
            q = q.bind(l);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                FtsHit {
                    document: row_to_document(row),
                    mirror_hash: row.get("fts_mirror_hash"),
                    seq: row.get("fts_seq"),
                    snippet: row.get("snippet"),
                    score: -rank,
                }
            })
            .collect())
    }

    async fn record_error(&self, err: &IngestError) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO ingest_errors (collection, rel_path, code, message, details_json, at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&err.collection)
        .bind(&err.rel_path)
        .bind(&err.code)
        .bind(&err.message)
        .bind(&err.details_json)
        .bind(err.at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_recent_errors(
        &self,
        collection: Option<&str>,
        limit: i64,
    ) -> CoreResult<Vec<IngestError>> {
        let mut sql =
            "SELECT collection, rel_path, code, message, details_json, at FROM ingest_errors WHERE 1=1"
                .to_string();
        if collection.is_some() {
            sql.push_str(" AND collection = ?");
        }
        sql.push_str(" ORDER BY at DESC LIMIT ?");

        let mut q = sqlx::query(&sql);
        if let Some(c) = collection {
            q = q.bind(c);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| IngestError {
                collection: row.get("collection"),
                rel_path: row.get("rel_path"),
                code: row.get("code"),
                message: row.get("message"),
                details_json: row.get("details_json"),
                at: parse_ts(&row.get::<String, _>("at")),
            })
            .collect())
    }

    async fn cleanup_orphans(&self) -> CoreResult<i64> {
        let rows = sqlx::query(
            r#"SELECT mirror_hash FROM content WHERE mirror_hash NOT IN
               (SELECT mirror_hash FROM documents WHERE active = 1 AND mirror_hash IS NOT NULL)"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut count = 0i64;
        for row in rows {
            let hash: String = row.get("mirror_hash");
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM chunks_fts WHERE mirror_hash = ?")
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE mirror_hash = ?")
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM vectors WHERE mirror_hash = ?")
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM content WHERE mirror_hash = ?")
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            count += 1;
        }
        Ok(count)
    }

    async fn set_doc_tags(
        &self,
        document_id: i64,
        tags: &[String],
        source: TagSource,
    ) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tags WHERE document_id = ? AND source = ?")
            .bind(document_id)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;

        for tag in tags {
            sqlx::query(
                "INSERT INTO tags (document_id, tag, source) VALUES (?, ?, ?) \
                 ON CONFLICT(document_id, tag) DO UPDATE SET source = excluded.source",
            )
            .bind(document_id)
            .bind(tag)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_tags_for_doc(&self, document_id: i64) -> CoreResult<Vec<Tag>> {
        let rows = sqlx::query("SELECT document_id, tag, source FROM tags WHERE document_id = ? ORDER BY tag ASC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Tag {
                document_id: row.get("document_id"),
                tag: row.get("tag"),
                source: TagSource::parse(&row.get::<String, _>("source"))
                    .unwrap_or(TagSource::Body),
            })
            .collect())
    }

    async fn get_tag_counts(
        &self,
        collection: Option<&str>,
        prefix: Option<&str>,
    ) -> CoreResult<Vec<(String, i64)>> {
        let mut sql = r#"SELECT tags.tag AS tag, COUNT(DISTINCT tags.document_id) AS cnt
               FROM tags JOIN documents ON documents.id = tags.document_id
               WHERE documents.active = 1"#
            .to_string();
        if collection.is_some() {
            sql.push_str(" AND documents.collection = ?");
        }
        if prefix.is_some() {
            sql.push_str(" AND tags.tag LIKE ?");
        }
        sql.push_str(" GROUP BY tags.tag ORDER BY cnt DESC, tags.tag ASC");

        let mut q = sqlx::query(&sql);
        if let Some(c) = collection {
            q = q.bind(c);
        }
        if let Some(p) = prefix {
            q = q.bind(format!("{p}%"));
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("tag"), row.get("cnt")))
            .collect())
    }

    async fn set_doc_links(
        &self,
        document_id: i64,
        links: &[ParsedLink],
        source: LinkSource,
    ) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM links WHERE source_document_id = ? AND source = ?")
            .bind(document_id)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;

        for (ordinal, link) in links.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO links (
                    source_document_id, ordinal, target_ref, target_ref_norm, target_anchor,
                    target_collection, link_type, link_text, start_line, start_col, end_line,
                    end_col, source
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(document_id)
            .bind(ordinal as i64)
            .bind(&link.target_ref)
            .bind(&link.target_ref_norm)
            .bind(&link.target_anchor)
            .bind(&link.target_collection)
            .bind(link.link_type.as_str())
            .bind(&link.link_text)
            .bind(link.start_line)
            .bind(link.start_col)
            .bind(link.end_line)
            .bind(link.end_col)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_links_for_doc(&self, document_id: i64) -> CoreResult<Vec<Link>> {
        let rows = sqlx::query(
            r#"SELECT source_document_id, ordinal, target_ref, target_ref_norm, target_anchor,
                      target_collection, link_type, link_text, start_line, start_col, end_line,
                      end_col, source
               FROM links WHERE source_document_id = ? ORDER BY ordinal ASC"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_link).collect())
    }

    async fn resolution_candidates(
        &self,
        collection: Option<&str>,
    ) -> CoreResult<Vec<ResolutionCandidate>> {
        let mut sql = "SELECT id, docid, collection, rel_path, title FROM documents WHERE active = 1".to_string();
        if collection.is_some() {
            sql.push_str(" AND collection = ?");
        }
        let mut q = sqlx::query(&sql);
        if let Some(c) = collection {
            q = q.bind(c);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| ResolutionCandidate {
                document_id: row.get("id"),
                docid: row.get("docid"),
                collection: row.get("collection"),
                rel_path: row.get("rel_path"),
                title: row.get("title"),
            })
            .collect())
    }

    async fn resolve_links_for_doc(&self, document_id: i64) -> CoreResult<Vec<ResolvedLink>> {
        let links = self.get_links_for_doc(document_id).await?;
        let doc = self
            .get_document(document_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("unknown document id {document_id}")))?;

        let mut by_collection: std::collections::HashMap<Option<String>, Vec<ResolutionCandidate>> =
            std::collections::HashMap::new();

        let mut resolved = Vec::with_capacity(links.len());
        for link in links {
            let collection_key = link.target_collection.clone().or(Some(doc.collection.clone()));
            let candidates = match by_collection.entry(collection_key.clone()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let c = self
                        .resolution_candidates(collection_key.as_deref())
                        .await?;
                    e.insert(c)
                }
            };

            let target_document_id = match link.link_type {
                LinkType::Markdown => {
                    let resolved_path =
                        crate::links::resolve_markdown_path(&doc.rel_path, &link.target_ref_norm);
                    resolved_path.and_then(|p| {
                        crate::links::resolve_markdown_link(candidates, &p, &doc.collection)
                    })
                }
                LinkType::Wiki => crate::links::resolve_wiki_link(
                    candidates,
                    &link.target_ref_norm,
                    link.target_collection.as_deref().or(Some(&doc.collection)),
                ),
            };

            resolved.push(ResolvedLink {
                link,
                target_document_id,
            });
        }

        Ok(resolved)
    }

    async fn get_backlinks_for_doc(
        &self,
        document_id: i64,
        collection: Option<&str>,
    ) -> CoreResult<Vec<Link>> {
        let doc = self
            .get_document(document_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("unknown document id {document_id}")))?;

        let mut candidate_refs = vec![doc.rel_path.to_lowercase()];
        if let Some(title) = &doc.title {
            candidate_refs.push(crate::links::normalize_wiki_ref(title));
        }
        candidate_refs.push(crate::links::normalize_wiki_ref(
            doc.rel_path.rsplit('/').next().unwrap_or(&doc.rel_path),
        ));

        let mut sql = r#"SELECT links.source_document_id, links.ordinal, links.target_ref,
                   links.target_ref_norm, links.target_anchor, links.target_collection,
                   links.link_type, links.link_text, links.start_line, links.start_col,
                   links.end_line, links.end_col, links.source
               FROM links
               JOIN documents ON documents.id = links.source_document_id
               WHERE documents.active = 1 AND links.source = 'parsed'
                 AND links.target_ref_norm IN ("#
            .to_string();
        sql.push_str(&vec!["?"; candidate_refs.len()].join(","));
        sql.push(')');
        if collection.is_some() {
            sql.push_str(" AND documents.collection = ?");
        }
        sql.push_str(" ORDER BY links.source_document_id ASC, links.ordinal ASC");

        let mut q = sqlx::query(&sql);
        for r in &candidate_refs {
            q = q.bind(r);
        }
        if let Some(c) = collection {
            q = q.bind(c);
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_link).collect())
    }

    async fn upsert_vectors(
        &self,
        mirror_hash: &str,
        model: &str,
        vectors: &[(i64, Vec<f32>)],
    ) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = now_rfc3339();
        for (seq, vec) in vectors {
            sqlx::query(
                r#"INSERT INTO vectors (mirror_hash, seq, model, embedding, embedded_at)
                   VALUES (?, ?, ?, ?, ?)
                   ON CONFLICT(mirror_hash, seq, model) DO UPDATE SET
                     embedding = excluded.embedding, embedded_at = excluded.embedded_at"#,
            )
            .bind(mirror_hash)
            .bind(seq)
            .bind(model)
            .bind(vec_to_blob(vec))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_vectors_for_mirror(&self, mirror_hash: &str, model: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM vectors WHERE mirror_hash = ? AND model = ?")
            .bind(mirror_hash)
            .bind(model)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search_nearest(
        &self,
        model: &str,
        query_vec: &[f32],
        limit: i64,
    ) -> CoreResult<Vec<VectorHit>> {
        let rows = sqlx::query(&format!(
            r#"SELECT vectors.mirror_hash AS vec_mirror_hash, vectors.seq AS vec_seq,
                      vectors.embedding AS vec_embedding, {DOCUMENT_COLUMNS}
               FROM vectors
               JOIN documents ON documents.mirror_hash = vectors.mirror_hash AND documents.active = 1
               WHERE vectors.model = ?"#
        ))
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vec_embedding");
                let vec = blob_to_vec(&blob);
                let score = cosine_similarity(query_vec, &vec);
                VectorHit {
                    document: row_to_document(row),
                    mirror_hash: row.get("vec_mirror_hash"),
                    seq: row.get("vec_seq"),
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit.max(0) as usize);
        Ok(scored)
    }

    async fn count_vectors(&self, model: &str) -> CoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE model = ?")
            .bind(model)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn get_backlog(
        &self,
        model: &str,
        limit: i64,
        after: Option<(String, i64)>,
    ) -> CoreResult<Vec<BacklogItem>> {
        let mut sql = r#"SELECT chunks.mirror_hash AS mirror_hash, chunks.seq AS seq, chunks.text AS text,
                      chunks.created_at AS created_at
               FROM chunks
               JOIN documents ON documents.mirror_hash = chunks.mirror_hash
               LEFT JOIN vectors ON vectors.mirror_hash = chunks.mirror_hash
                 AND vectors.seq = chunks.seq AND vectors.model = ?
               WHERE documents.active = 1
                 AND (vectors.embedded_at IS NULL OR vectors.embedded_at < chunks.created_at)"#
            .to_string();

        if after.is_some() {
            sql.push_str(" AND (chunks.mirror_hash, chunks.seq) > (?, ?)");
        }
        sql.push_str(" ORDER BY chunks.mirror_hash ASC, chunks.seq ASC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(model);
        if let Some((h, s)) = &after {
            q = q.bind(h).bind(s);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| BacklogItem {
                mirror_hash: row.get("mirror_hash"),
                seq: row.get("seq"),
                text: row.get("text"),
                created_at: parse_ts(&row.get::<String, _>("created_at")),
            })
            .collect())
    }

    async fn get_status(&self) -> CoreResult<StoreStatus> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let active_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE active = 1")
            .fetch_one(&self.pool)
            .await?;
        let contents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let ingest_errors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_errors")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStatus {
            documents,
            active_documents,
            contents,
            chunks,
            ingest_errors,
        })
    }
}

fn row_to_link(row: &sqlx::sqlite::SqliteRow) -> Link {
    Link {
        source_document_id: row.get("source_document_id"),
        ordinal: row.get("ordinal"),
        target_ref: row.get("target_ref"),
        target_ref_norm: row.get("target_ref_norm"),
        target_anchor: row.get("target_anchor"),
        target_collection: row.get("target_collection"),
        link_type: if row.get::<String, _>("link_type") == "wiki" {
            LinkType::Wiki
        } else {
            LinkType::Markdown
        },
        link_text: row.get("link_text"),
        start_line: row.get("start_line"),
        start_col: row.get("start_col"),
        end_line: row.get("end_line"),
        end_col: row.get("end_col"),
        source: if row.get::<String, _>("source") == "user" {
            LinkSource::User
        } else {
            LinkSource::Parsed
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TagSource;

    async fn open_test_store() -> SqliteStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.migrate("unicode61").await.unwrap();
        store
    }

    fn sample_doc(rel_path: &str, hash_seed: u8) -> NewDocument {
        NewDocument {
            collection: "notes".to_string(),
            rel_path: rel_path.to_string(),
            source_hash: format!("{:064x}", hash_seed as u64),
            source_mime: "text/markdown".to_string(),
            source_ext: "md".to_string(),
            source_size: 100,
            source_mtime: 0,
            title: None,
            mirror_hash: Some(format!("mirror-{hash_seed}")),
            converter_id: Some("identity".to_string()),
            converter_version: Some("1".to_string()),
            language_hint: None,
            last_error_code: None,
            last_error_message: None,
            ingest_version: 1,
        }
    }

    #[tokio::test]
    async fn upsert_document_roundtrips_docid_and_uri() {
        let store = open_test_store().await;
        let doc = sample_doc("hello.md", 1);
        let (id, docid) = store.upsert_document(&doc).await.unwrap();
        let fetched = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(fetched.docid, docid);
        assert_eq!(fetched.uri, "gno://notes/hello.md");
        assert!(fetched.active);
    }

    #[tokio::test]
    async fn content_upsert_is_write_once() {
        let store = open_test_store().await;
        store.upsert_content("h1", "original").await.unwrap();
        store.upsert_content("h1", "different").await.unwrap();
        assert_eq!(store.get_content("h1").await.unwrap().unwrap(), "original");
    }

    #[tokio::test]
    async fn fts_search_finds_chunk_token() {
        let store = open_test_store().await;
        let doc = sample_doc("hello.md", 2);
        let mirror_hash = doc.mirror_hash.clone().unwrap();
        store.upsert_document(&doc).await.unwrap();
        store.upsert_content(&mirror_hash, "hello world").await.unwrap();

        let chunk = Chunk {
            mirror_hash: mirror_hash.clone(),
            seq: 0,
            pos: 0,
            text: "hello world".to_string(),
            start_line: 1,
            end_line: 1,
            language: Some("en".to_string()),
            token_count: Some(2),
        };
        store.replace_chunks(&mirror_hash, &[chunk]).await.unwrap();
        store.rebuild_fts_for_hash(&mirror_hash).await.unwrap();

        let hits = store
            .search_fts("hello", FtsSearchOptions { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].mirror_hash, mirror_hash);
    }

    #[tokio::test]
    async fn mark_inactive_excludes_seen_paths() {
        let store = open_test_store().await;
        let doc = sample_doc("a.md", 3);
        store.upsert_document(&doc).await.unwrap();

        let mut seen = HashSet::new();
        seen.insert("b.md".to_string());
        let n = store.mark_inactive("notes", &seen).await.unwrap();
        assert_eq!(n, 1);

        let fetched = store.get_document_by_path("notes", "a.md").await.unwrap().unwrap();
        assert!(!fetched.active);
    }

    #[tokio::test]
    async fn tag_sources_collapse_into_union() {
        let store = open_test_store().await;
        let doc = sample_doc("a.md", 4);
        let (id, _) = store.upsert_document(&doc).await.unwrap();

        store
            .set_doc_tags(id, &["alpha".to_string()], TagSource::Frontmatter)
            .await
            .unwrap();
        store
            .set_doc_tags(id, &["beta".to_string()], TagSource::User)
            .await
            .unwrap();

        let tags = store.get_tags_for_doc(id).await.unwrap();
        let names: Vec<_> = tags.iter().map(|t| t.tag.clone()).collect();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
