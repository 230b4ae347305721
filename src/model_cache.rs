//! Content-addressed local cache for embedding/rerank/generation model
//! files.
//!
//! Parses model URIs (`hf:`, `file:`, bare absolute paths, `http(s)://`),
//! resolves them against a JSON manifest on disk, and downloads missing
//! files under a cross-process exclusive lock with atomic manifest
//! updates.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{DownloadPolicy, ModelCacheConfig};
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::models::ModelCacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Embedding,
    Rerank,
    Generation,
}

impl ModelType {
    fn as_str(&self) -> &'static str {
        match self {
            ModelType::Embedding => "embedding",
            ModelType::Rerank => "rerank",
            ModelType::Generation => "generation",
        }
    }
}

/// A parsed model URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelUri {
    /// `hf:org/repo/file.gguf`
    HfFile { org: String, repo: String, file: String },
    /// `hf:org/repo:QUANT`
    HfQuant { org: String, repo: String, quant: String },
    /// `file:///abs/path`, `file:/abs/path`, or a bare absolute path.
    Local(PathBuf),
    /// `http(s)://host/path[#modelName]`, routed past the cache.
    Remote { url: String, model_name: Option<String> },
}

pub fn parse_uri(uri: &str) -> CoreResult<ModelUri> {
    if let Some(rest) = uri.strip_prefix("hf:") {
        return parse_hf(rest, uri);
    }
    if let Some(rest) = uri.strip_prefix("file:///") {
        return Ok(ModelUri::Local(PathBuf::from(format!("/{rest}"))));
    }
    if let Some(rest) = uri.strip_prefix("file:/") {
        return Ok(ModelUri::Local(PathBuf::from(format!("/{rest}"))));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let (url, model_name) = match uri.split_once('#') {
            Some((u, name)) => (u.to_string(), Some(name.to_string())),
            None => (uri.to_string(), None),
        };
        return Ok(ModelUri::Remote { url, model_name });
    }
    if is_native_absolute(uri) {
        return Ok(ModelUri::Local(PathBuf::from(uri)));
    }

    Err(invalid_uri(uri))
}

fn is_native_absolute(uri: &str) -> bool {
    uri.starts_with('/')
        || uri.starts_with("\\\\")
        || (uri.len() >= 3 && uri.as_bytes()[1] == b':' && uri.as_bytes()[2] == b'\\')
}

fn parse_hf(rest: &str, original: &str) -> CoreResult<ModelUri> {
    if let Some((repo_part, quant)) = rest.split_once(':') {
        let mut segs = repo_part.splitn(2, '/');
        let org = segs.next().filter(|s| !s.is_empty());
        let repo = segs.next().filter(|s| !s.is_empty());
        return match (org, repo) {
            (Some(org), Some(repo)) => Ok(ModelUri::HfQuant {
                org: org.to_string(),
                repo: repo.to_string(),
                quant: quant.to_string(),
            }),
            _ => Err(invalid_uri(original)),
        };
    }

    let mut segs = rest.splitn(3, '/');
    let org = segs.next().filter(|s| !s.is_empty());
    let repo = segs.next().filter(|s| !s.is_empty());
    let file = segs.next().filter(|s| !s.is_empty() && s.contains('.'));

    match (org, repo, file) {
        (Some(org), Some(repo), Some(file)) => Ok(ModelUri::HfFile {
            org: org.to_string(),
            repo: repo.to_string(),
            file: file.to_string(),
        }),
        _ => Err(invalid_uri(original)),
    }
}

fn invalid_uri(uri: &str) -> CoreError {
    CoreError::new(ErrorCode::InvalidUri, format!("unrecognized model URI: {uri}"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    version: String,
    models: Vec<ModelCacheEntry>,
}

impl Manifest {
    fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            models: Vec::new(),
        }
    }
}

pub struct ModelCache {
    cache_dir: PathBuf,
    lock_ttl: Duration,
    lock_poll: Duration,
    lock_max_attempts: u32,
}

impl ModelCache {
    pub fn new(cache_dir: PathBuf, config: &ModelCacheConfig) -> Self {
        Self {
            cache_dir,
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            lock_poll: Duration::from_millis(config.lock_poll_ms),
            lock_max_attempts: config.lock_max_attempts,
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.cache_dir.join("manifest.json")
    }

    fn lock_path(&self, uri: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.cache_dir.join(format!("{}.lock", &hash[..32]))
    }

    fn read_manifest(&self) -> CoreResult<Manifest> {
        match std::fs::read_to_string(self.manifest_path()) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| CoreError::internal(format!("corrupt model manifest: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let tmp_path = self
            .cache_dir
            .join(format!("manifest.json.{}.tmp", std::process::id()));
        let body = serde_json::to_string_pretty(manifest)
            .map_err(|e| CoreError::internal(e.to_string()))?;

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, self.manifest_path())?;
        if let Ok(dir) = std::fs::File::open(&self.cache_dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Ensure a model is present locally, downloading it if allowed.
    /// `downloader` performs the actual transfer into `dest` and is only
    /// invoked while the cross-process lock is held.
    pub async fn ensure_model(
        &self,
        uri: &str,
        model_type: ModelType,
        policy: DownloadPolicy,
        downloader: impl FnOnce(&ModelUri, &Path) -> CoreResult<u64>,
    ) -> CoreResult<PathBuf> {
        let parsed = parse_uri(uri)?;

        if let ModelUri::Local(path) = &parsed {
            if !path.exists() {
                return Err(CoreError::new(
                    ErrorCode::ModelNotFound,
                    format!("model file does not exist: {}", path.display()),
                ));
            }
            return Ok(path.clone());
        }

        if let ModelUri::Remote { url, .. } = &parsed {
            return Ok(PathBuf::from(url));
        }

        if let Some(path) = self.lookup_cached(uri)? {
            return Ok(path);
        }

        if policy.offline {
            return Err(CoreError::new(
                ErrorCode::ModelNotCached,
                format!("model not cached and offline mode is active: {uri}"),
            ));
        }
        if !policy.allow_download {
            return Err(CoreError::new(
                ErrorCode::AutoDownloadDisabled,
                format!("model not cached and automatic downloads are disabled: {uri}"),
            ));
        }

        self.with_lock(uri, || {
            if let Some(path) = self.lookup_cached(uri)? {
                return Ok(path);
            }

            std::fs::create_dir_all(&self.cache_dir)?;
            let dest_dir = self.cache_dir.join(sanitize_uri(uri));
            std::fs::create_dir_all(&dest_dir)?;
            let dest_file = dest_dir.join(file_name(&parsed));

            let size = downloader(&parsed, &dest_file)
                .map_err(|e| CoreError::new(ErrorCode::ModelDownloadFailed, e.to_string()))?;

            let mut manifest = self.read_manifest()?;
            manifest.models.retain(|m| m.uri != uri);
            manifest.models.push(ModelCacheEntry {
                uri: uri.to_string(),
                model_type: model_type.as_str().to_string(),
                path: dest_file.to_string_lossy().into_owned(),
                size,
                checksum: None,
                cached_at: chrono::Utc::now(),
            });
            self.write_manifest(&manifest)?;

            Ok(dest_file)
        })
        .await
    }

    fn lookup_cached(&self, uri: &str) -> CoreResult<Option<PathBuf>> {
        let mut manifest = self.read_manifest()?;
        let Some(pos) = manifest.models.iter().position(|m| m.uri == uri) else {
            return Ok(None);
        };

        let path = PathBuf::from(&manifest.models[pos].path);
        if path.exists() {
            return Ok(Some(path));
        }

        manifest.models.remove(pos);
        self.write_manifest(&manifest)?;
        Ok(None)
    }

    /// Snapshot the manifest's entries, newest first.
    pub fn list_models(&self) -> CoreResult<Vec<ModelCacheEntry>> {
        let mut manifest = self.read_manifest()?;
        manifest.models.sort_by(|a, b| b.cached_at.cmp(&a.cached_at));
        Ok(manifest.models)
    }

    /// Remove cached entries matching `uri_prefix` (or every entry, if
    /// `None`) from the manifest and delete their backing files. Returns the
    /// number of entries removed. Missing backing files are not an error.
    pub fn gc(&self, uri_prefix: Option<&str>) -> CoreResult<usize> {
        let mut manifest = self.read_manifest()?;
        let (to_remove, to_keep): (Vec<_>, Vec<_>) = manifest
            .models
            .into_iter()
            .partition(|m| uri_prefix.map_or(true, |prefix| m.uri.starts_with(prefix)));
        manifest.models = to_keep;

        for entry in &to_remove {
            let path = PathBuf::from(&entry.path);
            let _ = std::fs::remove_file(&path);
            if let Some(dir) = path.parent() {
                let _ = std::fs::remove_dir(dir);
            }
        }

        self.write_manifest(&manifest)?;
        Ok(to_remove.len())
    }

    async fn with_lock<T>(
        &self,
        uri: &str,
        critical_section: impl FnOnce() -> CoreResult<T>,
    ) -> CoreResult<T> {
        let lock_path = self.lock_path(uri);
        std::fs::create_dir_all(&self.cache_dir)?;

        let mut acquired = false;
        for attempt in 0..self.lock_max_attempts {
            match try_create_lock(&lock_path) {
                Ok(()) => {
                    acquired = true;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path, self.lock_ttl) {
                        let stale = lock_path.with_extension(format!("stale.{}", std::process::id()));
                        if std::fs::rename(&lock_path, &stale).is_ok() {
                            continue;
                        }
                    }
                    if attempt + 1 == self.lock_max_attempts {
                        break;
                    }
                    tokio::time::sleep(self.lock_poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !acquired {
            return Err(CoreError::new(
                ErrorCode::LockFailed,
                format!("timed out acquiring model cache lock for {uri}"),
            ));
        }

        let result = critical_section();
        let _ = std::fs::remove_file(&lock_path);
        result
    }
}

fn try_create_lock(lock_path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(lock_path)?;
    let metadata = serde_json::json!({
        "pid": std::process::id(),
        "hostname": hostname(),
        "user": std::env::var("USER").unwrap_or_default(),
        "createdAt": chrono::Utc::now().to_rfc3339(),
    });
    let _ = file.write_all(metadata.to_string().as_bytes());
    Ok(())
}

fn lock_is_stale(lock_path: &Path, ttl: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(lock_path) else {
        return true;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    age > ttl
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn sanitize_uri(uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uri.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn file_name(parsed: &ModelUri) -> String {
    match parsed {
        ModelUri::HfFile { file, .. } => file.clone(),
        ModelUri::HfQuant { repo, quant, .. } => format!("{repo}-{quant}.gguf"),
        ModelUri::Local(path) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model.bin".to_string()),
        ModelUri::Remote { .. } => "remote".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(dir: &std::path::Path) -> ModelCache {
        ModelCache::new(dir.to_path_buf(), &ModelCacheConfig::default())
    }

    #[test]
    fn parses_hf_file_uri() {
        let parsed = parse_uri("hf:org/repo/file.gguf").unwrap();
        assert_eq!(
            parsed,
            ModelUri::HfFile {
                org: "org".to_string(),
                repo: "repo".to_string(),
                file: "file.gguf".to_string(),
            }
        );
    }

    #[test]
    fn parses_hf_quant_shorthand() {
        let parsed = parse_uri("hf:org/repo:Q4_K_M").unwrap();
        assert_eq!(
            parsed,
            ModelUri::HfQuant {
                org: "org".to_string(),
                repo: "repo".to_string(),
                quant: "Q4_K_M".to_string(),
            }
        );
    }

    #[test]
    fn parses_file_and_native_absolute_uris() {
        assert_eq!(
            parse_uri("file:///models/a.bin").unwrap(),
            ModelUri::Local(PathBuf::from("/models/a.bin"))
        );
        assert_eq!(
            parse_uri("/models/a.bin").unwrap(),
            ModelUri::Local(PathBuf::from("/models/a.bin"))
        );
    }

    #[test]
    fn parses_remote_uri_with_model_name_fragment() {
        let parsed = parse_uri("https://example.com/v1#my-model").unwrap();
        assert_eq!(
            parsed,
            ModelUri::Remote {
                url: "https://example.com/v1".to_string(),
                model_name: Some("my-model".to_string()),
            }
        );
    }

    #[test]
    fn rejects_invalid_uris() {
        assert!(parse_uri("hf:invalid").is_err());
        assert!(parse_uri("hf:org/repo/noextension").is_err());
        assert!(parse_uri("ftp://example.com/x").is_err());
    }

    #[tokio::test]
    async fn ensure_model_reports_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let policy = DownloadPolicy {
            offline: false,
            allow_download: true,
        };
        let err = cache
            .ensure_model("/no/such/file.bin", ModelType::Embedding, policy, |_, _| Ok(0))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelNotFound);
    }

    #[tokio::test]
    async fn ensure_model_downloads_once_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let policy = DownloadPolicy {
            offline: false,
            allow_download: true,
        };

        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let path1 = cache
            .ensure_model("hf:org/repo/file.gguf", ModelType::Embedding, policy, move |_, dest| {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                std::fs::write(dest, b"weights").unwrap();
                Ok(7)
            })
            .await
            .unwrap();

        let calls_clone = calls.clone();
        let path2 = cache
            .ensure_model("hf:org/repo/file.gguf", ModelType::Embedding, policy, move |_, dest| {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                std::fs::write(dest, b"weights").unwrap();
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(path1, path2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn list_models_reflects_cached_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let policy = DownloadPolicy {
            offline: false,
            allow_download: true,
        };
        cache
            .ensure_model("hf:org/repo/file.gguf", ModelType::Embedding, policy, |_, dest| {
                std::fs::write(dest, b"weights").unwrap();
                Ok(7)
            })
            .await
            .unwrap();

        let models = cache.list_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].uri, "hf:org/repo/file.gguf");
    }

    #[tokio::test]
    async fn gc_removes_matching_entries_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let policy = DownloadPolicy {
            offline: false,
            allow_download: true,
        };
        let path = cache
            .ensure_model("hf:org/repo/file.gguf", ModelType::Embedding, policy, |_, dest| {
                std::fs::write(dest, b"weights").unwrap();
                Ok(7)
            })
            .await
            .unwrap();
        assert!(path.exists());

        let removed = cache.gc(Some("hf:org/")).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.list_models().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn ensure_model_respects_offline_policy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let policy = DownloadPolicy {
            offline: true,
            allow_download: false,
        };
        let err = cache
            .ensure_model("hf:org/repo/file.gguf", ModelType::Embedding, policy, |_, _| Ok(0))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelNotCached);
    }
}
