//! Background embedding scheduler.
//!
//! Sync only writes Markdown, chunks, and FTS rows; this is what turns the
//! resulting vector backlog into embeddings. A single long-lived task
//! debounces bursts of [`EmbedScheduler::notify_sync_complete`] calls (one
//! collection's sync firing right after another's) into one drain, forces a
//! drain after `scheduler.max_wait_ms` even under continuous notification,
//! and collapses concurrent drain requests into whichever one is already
//! running — there is never more than one [`Store::get_backlog`] loop live
//! at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, EmbeddingConfig, ModelCacheConfig, SchedulerConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::CoreResult;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Debouncing,
    Embedding,
}

#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub phase: SchedulerPhase,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_embedded: i64,
    pub last_error: Option<String>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            phase: SchedulerPhase::Idle,
            last_run_at: None,
            last_embedded: 0,
            last_error: None,
        }
    }
}

pub struct EmbedScheduler {
    store: Arc<dyn Store>,
    embedding: EmbeddingConfig,
    model_cache: ModelCacheConfig,
    scheduler: SchedulerConfig,
    state: Mutex<SchedulerState>,
    notify: Notify,
    force: AtomicBool,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EmbedScheduler {
    /// Build a scheduler and spawn its background drain loop. Disabled
    /// embedding configs still spawn the loop (so `dispose` is always
    /// valid to call) but every drain is a no-op.
    pub fn spawn(store: Arc<dyn Store>, config: &Config) -> Arc<Self> {
        let this = Arc::new(Self {
            store,
            embedding: config.embedding.clone(),
            model_cache: config.model_cache.clone(),
            scheduler: config.scheduler.clone(),
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
            force: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handle: std::sync::Mutex::new(None),
        });

        let worker = this.clone();
        let join = tokio::spawn(async move { worker.run().await });
        *this.handle.lock().unwrap() = Some(join);

        this
    }

    /// Queue a drain. Multiple calls within `debounce_ms` of each other
    /// collapse into a single drain once things go quiet, or after
    /// `max_wait_ms` has elapsed since the first of the burst.
    pub fn notify_sync_complete(&self) {
        if self.embedding.is_enabled() {
            self.notify.notify_one();
        }
    }

    /// Skip any remaining debounce wait and drain as soon as the worker next
    /// wakes. A no-op if embeddings are disabled.
    pub fn trigger_now(&self) {
        if self.embedding.is_enabled() {
            self.force.store(true, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    pub fn get_state(&self) -> SchedulerState {
        self.state.lock().clone()
    }

    /// Cancel the background loop and wait for it to exit. Idempotent.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.notify.notified() => {}
            }

            self.set_phase(SchedulerPhase::Debouncing);
            if !self.wait_out_debounce().await {
                return;
            }

            self.drain_once().await;
        }
    }

    /// Waits until the debounce window goes quiet or `max_wait_ms` has
    /// elapsed since entering it. Returns `false` if cancelled.
    async fn wait_out_debounce(&self) -> bool {
        let debounce = Duration::from_millis(self.scheduler.debounce_ms.max(1));
        let max_wait = Duration::from_millis(self.scheduler.max_wait_ms.max(1));
        let started = Instant::now();

        loop {
            if self.force.swap(false, Ordering::SeqCst) {
                return true;
            }

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                return true;
            }

            let wait = debounce.min(max_wait - elapsed);
            let notified_again = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => false,
                _ = self.notify.notified() => true,
            };

            if !notified_again {
                return true;
            }
            // Another sync completed inside the window; loop to restart it.
        }
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        self.state.lock().phase = phase;
    }

    async fn drain_once(self: &Arc<Self>) {
        self.set_phase(SchedulerPhase::Embedding);

        match self.drain_backlog().await {
            Ok(count) => {
                info!(embedded = count, "embed backlog drained");
                let mut state = self.state.lock();
                state.last_run_at = Some(Utc::now());
                state.last_embedded = count;
                state.last_error = None;
            }
            Err(e) => {
                warn!(error = %e, "embed backlog drain failed");
                let mut state = self.state.lock();
                state.last_run_at = Some(Utc::now());
                state.last_error = Some(e.message.clone());
            }
        }

        self.set_phase(SchedulerPhase::Idle);
    }

    async fn drain_backlog(self: &Arc<Self>) -> CoreResult<i64> {
        if !self.embedding.is_enabled() {
            return Ok(0);
        }

        let provider = embedding::create_provider(&self.embedding)?;
        let model = provider.model_name().to_string();
        let batch_limit = self.scheduler.backlog_batch_size.max(1);

        let mut cursor: Option<(String, i64)> = None;
        let mut total = 0i64;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let batch = self.store.get_backlog(&model, batch_limit, cursor.clone()).await?;
            if batch.is_empty() {
                break;
            }

            let texts: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();
            let vectors =
                embedding::embed_texts(provider.as_ref(), &self.embedding, &self.model_cache, &texts).await?;

            let mut by_mirror: std::collections::HashMap<String, Vec<(i64, Vec<f32>)>> =
                std::collections::HashMap::new();
            for (item, vector) in batch.iter().zip(vectors.into_iter()) {
                by_mirror.entry(item.mirror_hash.clone()).or_default().push((item.seq, vector));
            }
            for (mirror_hash, vecs) in by_mirror {
                self.store.upsert_vectors(&mirror_hash, &model, &vecs).await?;
            }

            total += batch.len() as i64;
            let last = batch.last().expect("checked non-empty above");
            cursor = Some((last.mirror_hash.clone(), last.seq));

            if (batch.len() as i64) < batch_limit {
                break;
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, RetrievalConfig, StoreConfig};
    use crate::links::{ParsedLink, ResolutionCandidate};
    use crate::models::*;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct UnimplementedStore;

    #[async_trait]
    impl Store for UnimplementedStore {
        async fn migrate(&self, _fts_tokenizer: &str) -> CoreResult<crate::store::MigrationReport> {
            unimplemented!()
        }
        async fn upsert_collection(&self, _collection: &Collection) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_document(&self, _id: i64) -> CoreResult<Option<Document>> {
            unimplemented!()
        }
        async fn get_document_by_docid(&self, _docid: &str) -> CoreResult<Option<Document>> {
            unimplemented!()
        }
        async fn get_document_by_uri(&self, _uri: &str) -> CoreResult<Option<Document>> {
            unimplemented!()
        }
        async fn get_document_by_path(
            &self,
            _collection: &str,
            _rel_path: &str,
        ) -> CoreResult<Option<Document>> {
            unimplemented!()
        }
        async fn list_documents(
            &self,
            _collection: Option<&str>,
            _active_only: bool,
        ) -> CoreResult<Vec<Document>> {
            unimplemented!()
        }
        async fn upsert_document(
            &self,
            _doc: &crate::store::NewDocument,
        ) -> CoreResult<(i64, String)> {
            unimplemented!()
        }
        async fn mark_inactive(
            &self,
            _collection: &str,
            _seen_rel_paths: &HashSet<String>,
        ) -> CoreResult<i64> {
            unimplemented!()
        }
        async fn upsert_content(&self, _mirror_hash: &str, _markdown: &str) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_content(&self, _mirror_hash: &str) -> CoreResult<Option<String>> {
            unimplemented!()
        }
        async fn replace_chunks(&self, _mirror_hash: &str, _chunks: &[Chunk]) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_chunks(&self, _mirror_hash: &str) -> CoreResult<Vec<Chunk>> {
            unimplemented!()
        }
        async fn rebuild_fts_for_hash(&self, _mirror_hash: &str) -> CoreResult<()> {
            unimplemented!()
        }
        async fn search_fts(
            &self,
            _query: &str,
            _opts: crate::store::FtsSearchOptions,
        ) -> CoreResult<Vec<FtsHit>> {
            unimplemented!()
        }
        async fn record_error(&self, _err: &IngestError) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_recent_errors(
            &self,
            _collection: Option<&str>,
            _limit: i64,
        ) -> CoreResult<Vec<IngestError>> {
            unimplemented!()
        }
        async fn cleanup_orphans(&self) -> CoreResult<i64> {
            unimplemented!()
        }
        async fn set_doc_tags(
            &self,
            _document_id: i64,
            _tags: &[String],
            _source: TagSource,
        ) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_tags_for_doc(&self, _document_id: i64) -> CoreResult<Vec<Tag>> {
            unimplemented!()
        }
        async fn get_tag_counts(
            &self,
            _collection: Option<&str>,
            _prefix: Option<&str>,
        ) -> CoreResult<Vec<(String, i64)>> {
            unimplemented!()
        }
        async fn set_doc_links(
            &self,
            _document_id: i64,
            _links: &[ParsedLink],
            _source: LinkSource,
        ) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_links_for_doc(&self, _document_id: i64) -> CoreResult<Vec<Link>> {
            unimplemented!()
        }
        async fn resolution_candidates(
            &self,
            _collection: Option<&str>,
        ) -> CoreResult<Vec<ResolutionCandidate>> {
            unimplemented!()
        }
        async fn resolve_links_for_doc(&self, _document_id: i64) -> CoreResult<Vec<ResolvedLink>> {
            unimplemented!()
        }
        async fn get_backlinks_for_doc(
            &self,
            _document_id: i64,
            _collection: Option<&str>,
        ) -> CoreResult<Vec<Link>> {
            unimplemented!()
        }
        async fn upsert_vectors(
            &self,
            _mirror_hash: &str,
            _model: &str,
            _vectors: &[(i64, Vec<f32>)],
        ) -> CoreResult<()> {
            unimplemented!()
        }
        async fn delete_vectors_for_mirror(&self, _mirror_hash: &str, _model: &str) -> CoreResult<()> {
            unimplemented!()
        }
        async fn search_nearest(
            &self,
            _model: &str,
            _query_vec: &[f32],
            _limit: i64,
        ) -> CoreResult<Vec<VectorHit>> {
            unimplemented!()
        }
        async fn count_vectors(&self, _model: &str) -> CoreResult<i64> {
            unimplemented!()
        }
        async fn get_backlog(
            &self,
            _model: &str,
            _limit: i64,
            _after: Option<(String, i64)>,
        ) -> CoreResult<Vec<crate::store::BacklogItem>> {
            unimplemented!()
        }
        async fn get_status(&self) -> CoreResult<crate::store::StoreStatus> {
            unimplemented!()
        }
    }

    fn disabled_config() -> Config {
        Config {
            store: StoreConfig {
                path: "/tmp/does-not-matter.db".into(),
                fts_tokenizer: "unicode61".to_string(),
            },
            collections: vec![],
            chunking: ChunkingConfig {
                max_tokens: 800,
                overlap_percent: 0.15,
            },
            retrieval: RetrievalConfig {
                hybrid_alpha: 0.6,
                candidate_k_keyword: 80,
                candidate_k_vector: 80,
                final_limit: 12,
                group_by: "document".to_string(),
                doc_agg: "max".to_string(),
                max_chunks_per_doc: 3,
            },
            embedding: EmbeddingConfig::default(),
            model_cache: ModelCacheConfig::default(),
            sync: crate::config::SyncConfig::default(),
            scheduler: SchedulerConfig {
                debounce_ms: 10,
                max_wait_ms: 200,
                backlog_batch_size: 32,
            },
        }
    }

    /// `is_enabled()` true but no `OPENAI_API_KEY` set, so `create_provider`
    /// fails fast inside `drain_backlog` without ever touching the store or
    /// the network — lets these tests exercise the real debounce/phase
    /// machinery without a working embedding backend.
    fn misconfigured_openai_config(debounce_ms: u64, max_wait_ms: u64) -> Config {
        std::env::remove_var("OPENAI_API_KEY");
        let mut config = disabled_config();
        config.embedding = EmbeddingConfig {
            provider: "openai".to_string(),
            model: Some("text-embedding-3-small".to_string()),
            dims: Some(1536),
            ..EmbeddingConfig::default()
        };
        config.scheduler.debounce_ms = debounce_ms;
        config.scheduler.max_wait_ms = max_wait_ms;
        config
    }

    #[tokio::test]
    async fn disabled_embedding_notify_is_a_no_op() {
        let scheduler = EmbedScheduler::spawn(Arc::new(UnimplementedStore), &disabled_config());
        scheduler.notify_sync_complete();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.get_state().phase, SchedulerPhase::Idle);
        scheduler.dispose().await;
    }

    #[tokio::test]
    async fn notify_debounces_then_drains_and_records_the_resulting_error() {
        let scheduler =
            EmbedScheduler::spawn(Arc::new(UnimplementedStore), &misconfigured_openai_config(20, 500));
        scheduler.notify_sync_complete();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = scheduler.get_state();
        assert_eq!(state.phase, SchedulerPhase::Idle);
        assert!(state.last_run_at.is_some());
        assert!(state.last_error.is_some());
        scheduler.dispose().await;
    }

    #[tokio::test]
    async fn trigger_now_skips_the_debounce_wait() {
        let scheduler = EmbedScheduler::spawn(
            Arc::new(UnimplementedStore),
            &misconfigured_openai_config(5_000, 10_000),
        );
        let start = Instant::now();
        scheduler.trigger_now();

        loop {
            if scheduler.get_state().last_run_at.is_some() {
                break;
            }
            if start.elapsed() > Duration::from_secs(2) {
                panic!("trigger_now did not drain within the debounce window");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(start.elapsed() < Duration::from_millis(5_000));
        scheduler.dispose().await;
    }

    #[tokio::test]
    async fn dispose_stops_the_background_loop() {
        let scheduler = EmbedScheduler::spawn(Arc::new(UnimplementedStore), &disabled_config());
        scheduler.dispose().await;
        // A second dispose must not hang or panic.
        scheduler.dispose().await;
    }
}
