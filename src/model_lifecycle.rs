//! In-process lifecycle manager for loaded model handles.
//!
//! Generic over the handle type `H` a provider produces (an embedding
//! session, a rerank session, ...), so the same load/dedup/dispose machinery
//! backs every model-backed port. Keeps at most one handle per URI warm,
//! collapses concurrent loads of the same URI into a single attempt, and
//! disposes handles that have sat idle past `warm_model_ttl`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult, ErrorCode};

struct Entry<H> {
    handle: Arc<H>,
    loaded_at: Instant,
    disposal: Option<JoinHandle<()>>,
}

/// Tracks loaded model handles keyed by URI.
pub struct ModelLifecycle<H: Send + Sync + 'static> {
    entries: Mutex<HashMap<String, Entry<H>>>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<CoreResult<Arc<H>>>>>>,
    warm_ttl: Duration,
    load_timeout: Duration,
}

impl<H: Send + Sync + 'static> ModelLifecycle<H> {
    pub fn new(warm_ttl: Duration, load_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            warm_ttl,
            load_timeout,
        })
    }

    /// Return the handle for `uri`, loading it via `loader` if it is not
    /// already warm. Concurrent callers for the same URI share one load
    /// attempt. Refreshes the idle-disposal timer on every call, including
    /// cache hits.
    pub async fn ensure_loaded<F, Fut>(self: &Arc<Self>, uri: &str, loader: F) -> CoreResult<Arc<H>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<H>> + Send + 'static,
    {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(uri) {
                entry.loaded_at = Instant::now();
                return Ok(entry.handle.clone());
            }
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(uri.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let uri_for_timeout = uri.to_string();
        let load_timeout = self.load_timeout;
        let result = cell
            .get_or_init(|| async move {
                match tokio::time::timeout(load_timeout, loader()).await {
                    Ok(Ok(handle)) => Ok(Arc::new(handle)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(CoreError::new(
                        ErrorCode::Timeout,
                        format!("timed out loading model {uri_for_timeout}"),
                    )),
                }
            })
            .await
            .clone();

        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.remove(uri);
        }

        let handle = result?;

        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                uri.to_string(),
                Entry {
                    handle: handle.clone(),
                    loaded_at: Instant::now(),
                    disposal: None,
                },
            );
        }

        let disposal = self.clone().spawn_disposal_timer(uri.to_string());
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(uri) {
            entry.disposal = Some(disposal);
        }

        Ok(handle)
    }

    fn spawn_disposal_timer(self: Arc<Self>, uri: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.warm_ttl).await;
                let mut entries = self.entries.lock().await;
                match entries.get(&uri) {
                    None => return,
                    Some(entry) => {
                        if entry.loaded_at.elapsed() >= self.warm_ttl {
                            entries.remove(&uri);
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Dispose a single loaded model, if present. Idempotent.
    pub async fn dispose(&self, uri: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(uri) {
            if let Some(handle) = entry.disposal {
                handle.abort();
            }
        }
    }

    /// Dispose every loaded model.
    pub async fn dispose_all(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            if let Some(handle) = entry.disposal {
                handle.abort();
            }
        }
    }

    pub async fn loaded_uris(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_loads_of_same_uri_collapse_into_one_attempt() {
        let lifecycle = ModelLifecycle::<u32>::new(Duration::from_secs(60), Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lifecycle = lifecycle.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                lifecycle
                    .ensure_loaded("hf:org/repo/file.gguf", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(42)
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(*h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_timeout_surfaces_as_timeout_error() {
        let lifecycle = ModelLifecycle::<u32>::new(Duration::from_secs(60), Duration::from_millis(10));
        let err = lifecycle
            .ensure_loaded("slow-model", || async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn dispose_removes_loaded_handle() {
        let lifecycle = ModelLifecycle::<u32>::new(Duration::from_secs(60), Duration::from_secs(5));
        lifecycle
            .ensure_loaded("m", || async move { Ok(7) })
            .await
            .unwrap();
        assert_eq!(lifecycle.loaded_uris().await, vec!["m".to_string()]);

        lifecycle.dispose("m").await;
        assert!(lifecycle.loaded_uris().await.is_empty());
    }

    #[tokio::test]
    async fn idle_handle_disposed_after_warm_ttl() {
        let lifecycle = ModelLifecycle::<u32>::new(Duration::from_millis(30), Duration::from_secs(5));
        lifecycle
            .ensure_loaded("m", || async move { Ok(7) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(lifecycle.loaded_uris().await.is_empty());
    }
}
