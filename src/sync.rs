//! Collection synchronization.
//!
//! Walks each configured collection, converts and chunks new or changed
//! files, extracts tags and links, and reconciles the store so that
//! documents no longer present on disk are marked inactive. Embedding
//! generation is not performed here: the embed scheduler drains the
//! resulting vector backlog asynchronously once a sync completes.

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::chunk::{self, ChunkParams};
use crate::config::{CollectionConfig, Config};
use crate::converter::{self, ConvertInput};
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::links;
use crate::models::{Collection, IngestError, LinkSource, TagSource};
use crate::store::{NewDocument, Store};
use crate::tags;
use crate::uri::source_hash;
use crate::walker::{self, SkipReason, WalkEntry};

/// Bumped whenever conversion, chunking, or extraction semantics change in a
/// way that should force re-processing of previously-ingested documents even
/// though their source bytes are untouched.
pub const INGEST_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Processed,
    Repaired,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub collection: String,
    pub processed: usize,
    pub repaired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deactivated: i64,
}

/// Sync a single configured collection: run its `update_cmd` (if configured
/// and `sync.git_pull` is enabled), walk the filesystem, process changed
/// files up to `sync.concurrency` at a time, then reconcile deletions.
pub async fn sync_collection(
    store: Arc<dyn Store>,
    config: &Config,
    collection_config: &CollectionConfig,
) -> CoreResult<SyncReport> {
    if config.sync.git_pull {
        if let Some(cmd) = &collection_config.update_cmd {
            run_update_cmd(cmd, &collection_config.root)?;
        }
    }

    store
        .upsert_collection(&Collection {
            name: collection_config.name.clone(),
            root: collection_config.root.display().to_string(),
            glob_pattern: collection_config.glob_pattern.clone(),
            include_exts: collection_config.include_exts.clone(),
            exclude_globs: collection_config.exclude_globs.clone(),
            update_cmd: collection_config.update_cmd.clone(),
            language_hint: collection_config.language_hint.clone(),
        })
        .await?;

    let walk_result = walker::walk(collection_config)?;

    for skipped in &walk_result.skipped {
        warn!(
            collection = %collection_config.name,
            rel_path = %skipped.rel_path,
            reason = skipped.reason.as_str(),
            "skipped during walk"
        );
        if skipped.reason == SkipReason::TooLarge {
            let ingest_err = IngestError {
                collection: collection_config.name.clone(),
                rel_path: skipped.rel_path.clone(),
                code: ErrorCode::TooLarge.as_str().to_string(),
                message: format!("{} exceeds the collection's max_file_bytes limit", skipped.rel_path),
                details_json: None,
                at: Utc::now(),
            };
            if let Err(e) = store.record_error(&ingest_err).await {
                warn!(error = %e, rel_path = %skipped.rel_path, "failed to record too-large ingest error");
            }
        }
    }

    let mut report = SyncReport {
        collection: collection_config.name.clone(),
        ..Default::default()
    };

    let chunk_params = ChunkParams {
        max_tokens: config.chunking.max_tokens,
        overlap_percent: config.chunking.overlap_percent,
    };
    let concurrency = config.sync.concurrency.max(1);

    if concurrency == 1 {
        for entry in &walk_result.entries {
            let outcome = process_one(store.as_ref(), collection_config, chunk_params, entry).await;
            record_outcome(&mut report, &outcome);
        }
    } else {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut set = tokio::task::JoinSet::new();

        for entry in walk_result.entries.clone() {
            let store = store.clone();
            let collection_config = collection_config.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                process_one(store.as_ref(), &collection_config, chunk_params, &entry).await
            });
        }

        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| CoreError::internal(e.to_string()))?;
            record_outcome(&mut report, &outcome);
        }
    }

    // A too-large file still exists and keeps its document active (with an
    // ingest error recorded above); an excluded file does not count as seen,
    // so a document that falls out of scope via config gets deactivated just
    // like one deleted from disk.
    let seen_rel_paths: HashSet<String> = walk_result
        .entries
        .iter()
        .map(|e| e.rel_path.clone())
        .chain(
            walk_result
                .skipped
                .iter()
                .filter(|s| s.reason == SkipReason::TooLarge)
                .map(|s| s.rel_path.clone()),
        )
        .collect();
    report.deactivated = store
        .mark_inactive(&collection_config.name, &seen_rel_paths)
        .await?;

    info!(
        collection = %collection_config.name,
        processed = report.processed,
        repaired = report.repaired,
        skipped = report.skipped,
        failed = report.failed,
        deactivated = report.deactivated,
        "sync complete"
    );

    Ok(report)
}

fn record_outcome(report: &mut SyncReport, outcome: &Outcome) {
    match outcome {
        Outcome::Processed => report.processed += 1,
        Outcome::Repaired => report.repaired += 1,
        Outcome::Skipped => report.skipped += 1,
        Outcome::Failed => report.failed += 1,
    }
}

async fn process_one(
    store: &dyn Store,
    collection_config: &CollectionConfig,
    chunk_params: ChunkParams,
    entry: &WalkEntry,
) -> Outcome {
    match process_entry(store, collection_config, chunk_params, entry).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                collection = %collection_config.name,
                rel_path = %entry.rel_path,
                code = %e.code,
                message = %e.message,
                "ingest failed"
            );
            let ingest_err = IngestError {
                collection: collection_config.name.clone(),
                rel_path: entry.rel_path.clone(),
                code: e.code.as_str().to_string(),
                message: e.message.clone(),
                details_json: None,
                at: Utc::now(),
            };
            if let Err(record_err) = store.record_error(&ingest_err).await {
                warn!(error = %record_err, "failed to record ingest error");
            }
            Outcome::Failed
        }
    }
}

/// Decide whether `entry` is unchanged (skip), new/modified (process), or a
/// previously-failed file whose source is unchanged (repair: retry
/// conversion without re-reading nothing new), then do the work.
async fn process_entry(
    store: &dyn Store,
    collection_config: &CollectionConfig,
    chunk_params: ChunkParams,
    entry: &WalkEntry,
) -> CoreResult<Outcome> {
    let bytes = std::fs::read(&entry.abs_path)?;
    let hash = source_hash(&bytes);

    let existing = store
        .get_document_by_path(&collection_config.name, &entry.rel_path)
        .await?;

    let is_repair = match &existing {
        Some(doc) => doc.last_error_code.is_some() && doc.source_hash == hash,
        None => false,
    };

    if let Some(doc) = &existing {
        let unchanged = !is_repair
            && doc.source_hash == hash
            && doc.mirror_hash.is_some()
            && doc.ingest_version == INGEST_VERSION;
        if unchanged {
            return Ok(Outcome::Skipped);
        }
    }

    let ext = ext_of(&entry.rel_path);
    let mime = mime_for_ext(&ext);

    let converted = converter::convert(&ConvertInput {
        collection: &collection_config.name,
        rel_path: &entry.rel_path,
        bytes: &bytes,
        mime: &mime,
        ext: &ext,
        max_bytes: collection_config.max_file_bytes,
    })?;

    let language_hint = collection_config
        .language_hint
        .clone()
        .or_else(|| converted.language_hint.clone());

    let chunks = chunk::chunk_markdown(&converted.markdown, chunk_params, language_hint.as_deref());

    store
        .upsert_content(&converted.mirror_hash, &converted.markdown)
        .await?;
    store.replace_chunks(&converted.mirror_hash, &chunks).await?;
    store.rebuild_fts_for_hash(&converted.mirror_hash).await?;

    let new_doc = NewDocument {
        collection: collection_config.name.clone(),
        rel_path: entry.rel_path.clone(),
        source_hash: hash,
        source_mime: mime,
        source_ext: ext,
        source_size: entry.size as i64,
        source_mtime: entry.mtime,
        title: converted.title.clone(),
        mirror_hash: Some(converted.mirror_hash.clone()),
        converter_id: Some(converted.converter_id.clone()),
        converter_version: Some(converted.converter_version.clone()),
        language_hint,
        last_error_code: None,
        last_error_message: None,
        ingest_version: INGEST_VERSION,
    };

    let (document_id, _docid) = store.upsert_document(&new_doc).await?;

    let frontmatter_tags = extract_frontmatter_tags(&converted.markdown);
    let extracted = tags::extract_tags(&frontmatter_tags, &converted.markdown);
    let (from_frontmatter, from_body): (Vec<(String, TagSource)>, Vec<(String, TagSource)>) =
        extracted.into_iter().partition(|(_, source)| *source == TagSource::Frontmatter);
    let from_frontmatter: Vec<String> = from_frontmatter.into_iter().map(|(tag, _)| tag).collect();
    let from_body: Vec<String> = from_body.into_iter().map(|(tag, _)| tag).collect();
    store
        .set_doc_tags(document_id, &from_frontmatter, TagSource::Frontmatter)
        .await?;
    store
        .set_doc_tags(document_id, &from_body, TagSource::Body)
        .await?;

    let parsed_links = links::parse_links(&converted.markdown);
    store
        .set_doc_links(document_id, &parsed_links, LinkSource::Parsed)
        .await?;

    Ok(if is_repair {
        Outcome::Repaired
    } else {
        Outcome::Processed
    })
}

/// Pull a `tags:` YAML list out of leading frontmatter, if present. Minimal
/// on purpose: a flow-style `[a, b]` list or one `- tag` per line under
/// `tags:`; anything else is left for body hashtag extraction to catch.
fn extract_frontmatter_tags(markdown: &str) -> Vec<String> {
    if !markdown.starts_with("---\n") {
        return Vec::new();
    }
    let Some(end) = markdown[4..].find("\n---") else {
        return Vec::new();
    };
    let frontmatter = &markdown[4..4 + end];

    for line in frontmatter.lines() {
        let Some(rest) = line.trim_start().strip_prefix("tags:") else {
            continue;
        };
        let rest = rest.trim();
        if let Some(inline) = rest.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            return inline
                .split(',')
                .map(|s| s.trim().trim_matches(['"', '\'']).to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if rest.is_empty() {
            // Block-style list: subsequent `- tag` lines, ending at the
            // next non-indented or non-`-` line.
            let mut out = Vec::new();
            let mut in_list = false;
            for l in frontmatter.lines() {
                if l.trim_start() == line.trim_start() {
                    in_list = true;
                    continue;
                }
                if !in_list {
                    continue;
                }
                let trimmed = l.trim_start();
                match trimmed.strip_prefix("- ") {
                    Some(tag) => out.push(tag.trim().trim_matches(['"', '\'']).to_string()),
                    None => break,
                }
            }
            return out;
        }
    }

    Vec::new()
}

fn ext_of(rel_path: &str) -> String {
    Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

fn mime_for_ext(ext: &str) -> String {
    match ext {
        "md" | "markdown" => "text/markdown".to_string(),
        "txt" => "text/plain".to_string(),
        other => format!("application/x-{other}"),
    }
}

fn run_update_cmd(cmd: &str, cwd: &Path) -> CoreResult<()> {
    info!(cwd = %cwd.display(), cmd, "running collection update command");

    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .status()
        .map_err(|e| CoreError::internal(format!("failed to run update_cmd '{cmd}': {e}")))?;

    if !status.success() {
        return Err(CoreError::internal(format!(
            "update_cmd '{cmd}' exited with status {status}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_of_lowercases_and_handles_missing_extension() {
        assert_eq!(ext_of("notes/Hello.MD"), "md");
        assert_eq!(ext_of("README"), "");
    }

    #[test]
    fn mime_for_known_exts() {
        assert_eq!(mime_for_ext("md"), "text/markdown");
        assert_eq!(mime_for_ext("txt"), "text/plain");
        assert_eq!(mime_for_ext("pdf"), "application/x-pdf");
    }

    #[test]
    fn frontmatter_tags_flow_style() {
        let md = "---\ntitle: Hi\ntags: [one, \"two\", three]\n---\nbody";
        assert_eq!(
            extract_frontmatter_tags(md),
            vec!["one".to_string(), "two".to_string(), "three".to_string()]
        );
    }

    #[test]
    fn frontmatter_tags_block_style() {
        let md = "---\ntags:\n- one\n- two\ntitle: Hi\n---\nbody";
        assert_eq!(
            extract_frontmatter_tags(md),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[test]
    fn frontmatter_tags_absent_without_frontmatter() {
        assert!(extract_frontmatter_tags("# Just a doc\n\nNo frontmatter here.").is_empty());
    }
}
