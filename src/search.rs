//! Hybrid search: keyword (FTS5 BM25), semantic (cosine similarity over
//! stored vectors), and a weighted merge of the two.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `candidate_k_keyword` keyword candidates (BM25 rank) and
//!    `candidate_k_vector` semantic candidates (cosine similarity).
//! 2. Min-max normalize each candidate set to `[0, 1]` independently.
//! 3. Merge per chunk: `score = (1 - α) × keyword + α × semantic`, where a
//!    chunk absent from one set contributes `0` for that half.
//! 4. Group matched chunks by document, aggregating with `doc_agg`
//!    (`"max"` or `"mean"`).
//! 5. Sort by score (desc), `updated_at` (desc), `id` (asc), and truncate to
//!    `final_limit`.
//!
//! # Filtering
//!
//! Results can be filtered by collection, required/any tag sets, and
//! detected chunk language — all pushed down into [`FtsSearchOptions`] for
//! the keyword pass; semantic candidates are filtered the same way by
//! re-checking the joined document after the brute-force vector scan.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::Config;
use crate::embedding;
use crate::error::{CoreError, CoreResult};
use crate::models::{Chunk, Document};
use crate::store::{FtsSearchOptions, Store};

/// Filters applied to both the keyword and semantic candidate passes.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub collection: Option<String>,
    pub tags_all: Vec<String>,
    pub tags_any: Vec<String>,
    pub lang: Option<String>,
}

/// A single matched chunk within a [`SearchHit`], kept for excerpt display.
#[derive(Debug, Clone)]
pub struct MatchedChunk {
    pub seq: i64,
    pub snippet: String,
    pub score: f64,
}

/// A document-level search result: the aggregated score plus the best
/// matching chunks (bounded by `retrieval.max_chunks_per_doc`).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document: Document,
    pub score: f64,
    pub chunks: Vec<MatchedChunk>,
}

struct ChunkCandidate {
    document: Document,
    mirror_hash: String,
    seq: i64,
    raw_score: f64,
    snippet: String,
}

/// Run a search against `store` using `config`'s retrieval tuning.
///
/// `mode` is one of `"keyword"`, `"semantic"`, `"hybrid"`. An empty query
/// returns an empty result set rather than an error.
pub async fn search(
    store: &dyn Store,
    config: &Config,
    query: &str,
    mode: &str,
    filters: &SearchFilters,
    limit: Option<i64>,
) -> CoreResult<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    match mode {
        "keyword" | "semantic" | "hybrid" => {}
        other => return Err(CoreError::internal(format!("unknown search mode: {other}"))),
    }

    if (mode == "semantic" || mode == "hybrid") && !config.embedding.is_enabled() {
        return Err(CoreError::internal(format!(
            "mode '{mode}' requires embeddings; set [embedding] provider in config"
        )));
    }

    if config.retrieval.group_by != "document" {
        return Err(CoreError::internal(format!(
            "unsupported retrieval.group_by: '{}' (only 'document' is implemented)",
            config.retrieval.group_by
        )));
    }

    let keyword_candidates = if mode == "keyword" || mode == "hybrid" {
        fetch_keyword_candidates(store, query, filters, config.retrieval.candidate_k_keyword).await?
    } else {
        Vec::new()
    };

    let vector_candidates = if mode == "semantic" || mode == "hybrid" {
        fetch_vector_candidates(store, config, query, filters, config.retrieval.candidate_k_vector).await?
    } else {
        Vec::new()
    };

    if keyword_candidates.is_empty() && vector_candidates.is_empty() {
        return Ok(Vec::new());
    }

    let effective_alpha = match mode {
        "keyword" => 0.0,
        "semantic" => 1.0,
        _ => config.retrieval.hybrid_alpha,
    };

    let hits = merge_candidates(
        &keyword_candidates,
        &vector_candidates,
        effective_alpha,
        &config.retrieval.doc_agg,
        config.retrieval.max_chunks_per_doc,
    );

    let final_limit = limit.unwrap_or(config.retrieval.final_limit).max(0) as usize;
    let mut hits = hits;
    hits.truncate(final_limit);
    Ok(hits)
}

async fn fetch_keyword_candidates(
    store: &dyn Store,
    query: &str,
    filters: &SearchFilters,
    candidate_k: i64,
) -> CoreResult<Vec<ChunkCandidate>> {
    let opts = FtsSearchOptions {
        collection: filters.collection.clone(),
        limit: candidate_k,
        tags_all: filters.tags_all.clone(),
        tags_any: filters.tags_any.clone(),
        lang: filters.lang.clone(),
    };

    let hits = store.search_fts(query, opts).await?;
    Ok(hits
        .into_iter()
        .map(|h| ChunkCandidate {
            document: h.document,
            mirror_hash: h.mirror_hash,
            seq: h.seq,
            raw_score: h.score,
            snippet: h.snippet,
        })
        .collect())
}

async fn fetch_vector_candidates(
    store: &dyn Store,
    config: &Config,
    query: &str,
    filters: &SearchFilters,
    candidate_k: i64,
) -> CoreResult<Vec<ChunkCandidate>> {
    let provider = embedding::create_provider(&config.embedding)?;
    let query_vec = embedding::embed_query(provider.as_ref(), &config.embedding, &config.model_cache, query).await?;

    let hits = store
        .search_nearest(provider.model_name(), &query_vec, candidate_k)
        .await?;

    let mut chunk_cache: HashMap<String, Vec<Chunk>> = HashMap::new();
    let mut candidates = Vec::new();

    for hit in hits {
        if let Some(collection) = &filters.collection {
            if &hit.document.collection != collection {
                continue;
            }
        }

        let chunks = match chunk_cache.get(&hit.mirror_hash) {
            Some(c) => c,
            None => {
                let fetched = store.get_chunks(&hit.mirror_hash).await?;
                chunk_cache.entry(hit.mirror_hash.clone()).or_insert(fetched);
                chunk_cache.get(&hit.mirror_hash).unwrap()
            }
        };

        let snippet = chunks
            .iter()
            .find(|c| c.seq == hit.seq)
            .map(|c| truncate_snippet(&c.text))
            .unwrap_or_default();

        candidates.push(ChunkCandidate {
            document: hit.document,
            mirror_hash: hit.mirror_hash,
            seq: hit.seq,
            raw_score: hit.score as f64,
            snippet,
        });
    }

    Ok(candidates)
}

/// Take the first 240 characters of `text` on a UTF-8 char boundary.
fn truncate_snippet(text: &str) -> String {
    text.chars().take(240).collect()
}

/// Min-max normalize a candidate set's raw scores to `[0, 1]`, keyed by
/// `(mirror_hash, seq)`. All-equal scores normalize to `1.0`; an empty set
/// normalizes to an empty map.
fn normalize_scores(candidates: &[ChunkCandidate]) -> HashMap<(String, i64), f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    let min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - min) / (max - min)
            };
            ((c.mirror_hash.clone(), c.seq), norm)
        })
        .collect()
}

fn merge_candidates(
    keyword_candidates: &[ChunkCandidate],
    vector_candidates: &[ChunkCandidate],
    alpha: f64,
    doc_agg: &str,
    max_chunks_per_doc: usize,
) -> Vec<SearchHit> {
    let kw_norm = normalize_scores(keyword_candidates);
    let vec_norm = normalize_scores(vector_candidates);

    let mut chunk_info: HashMap<(String, i64), (Document, String)> = HashMap::new();
    for c in keyword_candidates {
        chunk_info
            .entry((c.mirror_hash.clone(), c.seq))
            .or_insert_with(|| (c.document.clone(), c.snippet.clone()));
    }
    for c in vector_candidates {
        chunk_info
            .entry((c.mirror_hash.clone(), c.seq))
            .or_insert_with(|| (c.document.clone(), c.snippet.clone()));
    }

    let mut keys: Vec<(String, i64)> = kw_norm.keys().cloned().collect();
    for k in vec_norm.keys() {
        if !kw_norm.contains_key(k) {
            keys.push(k.clone());
        }
    }

    struct Scored {
        document: Document,
        seq: i64,
        score: f64,
        snippet: String,
    }

    let mut scored: Vec<Scored> = keys
        .into_iter()
        .filter_map(|key| {
            let (document, snippet) = chunk_info.get(&key)?.clone();
            let k = kw_norm.get(&key).copied().unwrap_or(0.0);
            let v = vec_norm.get(&key).copied().unwrap_or(0.0);
            let score = (1.0 - alpha) * k + alpha * v;
            Some(Scored {
                document,
                seq: key.1,
                score,
                snippet,
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.document.updated_at.cmp(&a.document.updated_at))
            .then(a.document.id.cmp(&b.document.id))
    });

    let mut doc_order: Vec<i64> = Vec::new();
    let mut doc_chunks: HashMap<i64, Vec<Scored>> = HashMap::new();
    for s in scored {
        doc_chunks
            .entry(s.document.id)
            .or_insert_with(|| {
                doc_order.push(s.document.id);
                Vec::new()
            })
            .push(s);
    }

    let mut hits: Vec<SearchHit> = doc_order
        .into_iter()
        .map(|doc_id| {
            let chunks = doc_chunks.remove(&doc_id).unwrap();
            let document = chunks[0].document.clone();
            let doc_score = match doc_agg {
                "mean" => chunks.iter().map(|c| c.score).sum::<f64>() / chunks.len() as f64,
                _ => chunks.iter().map(|c| c.score).fold(f64::MIN, f64::max),
            };
            let matched = chunks
                .iter()
                .take(max_chunks_per_doc)
                .map(|c| MatchedChunk {
                    seq: c.seq,
                    snippet: c.snippet.clone(),
                    score: c.score,
                })
                .collect();
            SearchHit {
                document,
                score: doc_score,
                chunks: matched,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.document.updated_at.cmp(&a.document.updated_at))
            .then(a.document.id.cmp(&b.document.id))
    });

    hits
}

/// CLI entry point: run [`search`] and print results to stdout.
pub async fn run_search(
    store: &dyn Store,
    config: &Config,
    query: &str,
    mode: &str,
    filters: &SearchFilters,
    limit: Option<i64>,
) -> CoreResult<()> {
    let hits = search(store, config, query, mode, filters, limit).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let title_display = hit.document.title.as_deref().unwrap_or("(untitled)");
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            hit.score,
            hit.document.collection,
            title_display
        );
        println!("    uri: {}", hit.document.uri);
        println!("    updated: {}", hit.document.updated_at.to_rfc3339());
        for chunk in &hit.chunks {
            println!(
                "    #{} [{:.2}]: \"{}\"",
                chunk.seq,
                chunk.score,
                chunk.snippet.replace('\n', " ").trim()
            );
        }
        println!("    id: {}", hit.document.docid);
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_doc(id: i64) -> Document {
        Document {
            id,
            docid: format!("#{id:08x}"),
            uri: format!("gno://notes/doc{id}.md"),
            collection: "notes".to_string(),
            rel_path: format!("doc{id}.md"),
            source_hash: "h".to_string(),
            source_mime: "text/markdown".to_string(),
            source_ext: "md".to_string(),
            source_size: 10,
            source_mtime: 0,
            title: Some(format!("Doc {id}")),
            mirror_hash: Some(format!("m{id}")),
            converter_id: None,
            converter_version: None,
            language_hint: None,
            active: true,
            last_error_code: None,
            last_error_message: None,
            ingest_version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn candidate(doc: &Document, seq: i64, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            document: doc.clone(),
            mirror_hash: doc.mirror_hash.clone().unwrap(),
            seq,
            raw_score: score,
            snippet: "excerpt".to_string(),
        }
    }

    #[test]
    fn normalize_empty_candidates_yields_empty_map() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn normalize_single_candidate_is_one() {
        let doc = make_doc(1);
        let norm = normalize_scores(&[candidate(&doc, 0, 5.0)]);
        assert!((norm[&("m1".to_string(), 0)] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_all_equal_scores_to_one() {
        let doc = make_doc(1);
        let candidates = vec![candidate(&doc, 0, 3.0), candidate(&doc, 1, 3.0)];
        let norm = normalize_scores(&candidates);
        for v in norm.values() {
            assert!((*v - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn normalize_range_is_min_max_scaled() {
        let doc = make_doc(1);
        let candidates = vec![candidate(&doc, 0, 10.0), candidate(&doc, 1, 5.0), candidate(&doc, 2, 0.0)];
        let norm = normalize_scores(&candidates);
        assert!((norm[&("m1".to_string(), 0)] - 1.0).abs() < 1e-9);
        assert!((norm[&("m1".to_string(), 1)] - 0.5).abs() < 1e-9);
        assert!((norm[&("m1".to_string(), 2)] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn alpha_zero_reduces_to_keyword_ordering() {
        let doc1 = make_doc(1);
        let doc2 = make_doc(2);
        let kw = vec![candidate(&doc1, 0, 10.0), candidate(&doc2, 0, 1.0)];
        let vecs = vec![candidate(&doc1, 0, 0.1), candidate(&doc2, 0, 0.9)];

        let hits = merge_candidates(&kw, &vecs, 0.0, "max", 3);
        assert_eq!(hits[0].document.id, 1);
        assert_eq!(hits[1].document.id, 2);
    }

    #[test]
    fn alpha_one_reduces_to_semantic_ordering() {
        let doc1 = make_doc(1);
        let doc2 = make_doc(2);
        let kw = vec![candidate(&doc1, 0, 10.0), candidate(&doc2, 0, 1.0)];
        let vecs = vec![candidate(&doc1, 0, 0.1), candidate(&doc2, 0, 0.9)];

        let hits = merge_candidates(&kw, &vecs, 1.0, "max", 3);
        assert_eq!(hits[0].document.id, 2);
        assert_eq!(hits[1].document.id, 1);
    }

    #[test]
    fn doc_agg_max_takes_best_chunk_not_average() {
        let doc = make_doc(1);
        let kw = vec![candidate(&doc, 0, 10.0), candidate(&doc, 1, 0.0)];

        let hits = merge_candidates(&kw, &[], 0.0, "max", 3);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn doc_agg_mean_averages_matched_chunks() {
        let doc = make_doc(1);
        let kw = vec![candidate(&doc, 0, 10.0), candidate(&doc, 1, 0.0)];

        let hits = merge_candidates(&kw, &[], 0.0, "mean", 3);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn max_chunks_per_doc_caps_returned_excerpts() {
        let doc = make_doc(1);
        let kw = vec![candidate(&doc, 0, 3.0), candidate(&doc, 1, 2.0), candidate(&doc, 2, 1.0)];

        let hits = merge_candidates(&kw, &[], 0.0, "max", 2);
        assert_eq!(hits[0].chunks.len(), 2);
    }
}
