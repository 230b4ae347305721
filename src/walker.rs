//! Filesystem walker.
//!
//! Enumerates the files under a collection root, applying glob include/
//! exclude rules and a size ceiling, and returns a deterministic,
//! lexicographically-sorted entry list plus a skip list with reasons.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::CollectionConfig;
use crate::error::{CoreError, CoreResult};

/// Extensions accepted when a collection specifies no explicit allowlist.
const DEFAULT_SUPPORTED_EXTS: &[&str] = &["md", "markdown", "txt"];

#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge,
    Excluded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TooLarge => "TOO_LARGE",
            SkipReason::Excluded => "EXCLUDED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub rel_path: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct WalkResult {
    pub entries: Vec<WalkEntry>,
    pub skipped: Vec<SkippedEntry>,
}

/// Walk `config.root`, returning sorted entries and a skip list.
///
/// Symlinks are never followed. Exclude globs are checked first (a path
/// segment equalling the pattern, or the relative path prefixed by
/// `pattern/`, also excludes); the extension allowlist is checked after
/// exclusion, falling back to [`DEFAULT_SUPPORTED_EXTS`] when empty.
/// Extensionless files never match the fallback allowlist.
pub fn walk(config: &CollectionConfig) -> CoreResult<WalkResult> {
    let root = &config.root;
    if !root.exists() {
        return Err(CoreError::internal(format!(
            "collection root does not exist: {}",
            root.display()
        )));
    }

    let glob_set = build_globset(std::slice::from_ref(&config.glob_pattern))?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut entries = Vec::new();
    let mut skipped = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| CoreError::internal(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_path = to_posix(relative);

        if !glob_set.is_match(&rel_path) {
            continue;
        }

        if is_excluded(&rel_path, &config.exclude_globs) || exclude_set.is_match(&rel_path) {
            skipped.push(SkippedEntry {
                rel_path,
                reason: SkipReason::Excluded,
            });
            continue;
        }

        if !extension_allowed(&rel_path, &config.include_exts) {
            skipped.push(SkippedEntry {
                rel_path,
                reason: SkipReason::Excluded,
            });
            continue;
        }

        let metadata = std::fs::metadata(path)?;
        let size = metadata.len();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if size > config.max_file_bytes {
            skipped.push(SkippedEntry {
                rel_path,
                reason: SkipReason::TooLarge,
            });
            continue;
        }

        entries.push(WalkEntry {
            abs_path: path.to_path_buf(),
            rel_path,
            size,
            mtime,
        });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    skipped.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    Ok(WalkResult { entries, skipped })
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A path segment exactly equal to `pattern`, or the relative path prefixed
/// by `pattern/`, excludes independently of glob matching.
fn is_excluded(rel_path: &str, exclude_globs: &[String]) -> bool {
    exclude_globs.iter().any(|pattern| {
        rel_path.split('/').any(|segment| segment == pattern)
            || rel_path.starts_with(&format!("{pattern}/"))
    })
}

fn extension_allowed(rel_path: &str, include_exts: &[String]) -> bool {
    let ext = rel_path.rsplit('.').next().filter(|e| *e != rel_path);
    let ext = match ext {
        Some(e) => e.to_lowercase(),
        None => return false,
    };

    if include_exts.is_empty() {
        return DEFAULT_SUPPORTED_EXTS.contains(&ext.as_str());
    }

    include_exts
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

fn build_globset(patterns: &[String]) -> CoreResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| CoreError::internal(e.to_string()))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CoreError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_config(root: PathBuf) -> CollectionConfig {
        CollectionConfig {
            name: "notes".to_string(),
            root,
            glob_pattern: "**/*".to_string(),
            include_exts: vec![],
            exclude_globs: vec!["drafts".to_string()],
            update_cmd: None,
            language_hint: None,
            max_file_bytes: 1024,
        }
    }

    #[test]
    fn walk_returns_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.md"), "b").unwrap();
        fs::write(dir.path().join("a.md"), "a").unwrap();

        let result = walk(&test_config(dir.path().to_path_buf())).unwrap();
        let paths: Vec<_> = result.entries.iter().map(|e| e.rel_path.clone()).collect();
        assert_eq!(paths, vec!["a.md".to_string(), "b.md".to_string()]);
    }

    #[test]
    fn walk_excludes_by_directory_segment() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("drafts")).unwrap();
        fs::write(dir.path().join("drafts/secret.md"), "s").unwrap();
        fs::write(dir.path().join("visible.md"), "v").unwrap();

        let result = walk(&test_config(dir.path().to_path_buf())).unwrap();
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].rel_path, "visible.md");
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, SkipReason::Excluded);
    }

    #[test]
    fn walk_flags_oversized_files_without_dropping_them() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.md"), "x".repeat(2000)).unwrap();

        let result = walk(&test_config(dir.path().to_path_buf())).unwrap();
        assert!(result.entries.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, SkipReason::TooLarge);
    }

    #[test]
    fn walk_rejects_extensionless_files_under_default_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README"), "r").unwrap();

        let result = walk(&test_config(dir.path().to_path_buf())).unwrap();
        assert!(result.entries.is_empty());
    }
}
