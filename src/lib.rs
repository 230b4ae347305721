//! # gno
//!
//! **A local-first, offline-capable semantic and keyword search engine over
//! Markdown and plaintext document collections.**
//!
//! `gno` watches one or more configured collections of files on disk,
//! converts each into canonical Markdown, chunks it deterministically, and
//! indexes the chunks for both full-text (SQLite FTS5, BM25-ranked) and
//! semantic (embedding cosine-similarity) retrieval. Everything — the
//! document store, the FTS index, and the vector index — lives in a single
//! SQLite database file; there is no external service to run.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐   ┌──────────┐
//! │  Walker   │──▶│ Converter │──▶│  Chunker  │──▶│  SQLite   │
//! │ (files)   │   │ (→ md)    │   │ (+ tags,  │   │ FTS5+Vec  │
//! │           │   │           │   │  links)   │   │           │
//! └──────────┘   └───────────┘   └───────────┘   └────┬─────┘
//!                                                       │
//!                                   ┌───────────────────┤
//!                                   ▼                   ▼
//!                            ┌───────────┐        ┌───────────┐
//!                            │  Embed     │       │  Search   │
//!                            │ Scheduler  │       │  Engine   │
//!                            └───────────┘        └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`sync`] walks each configured collection ([`walker`]), converts
//!    changed files to Markdown ([`converter`]), chunks them ([`chunk`]),
//!    extracts tags ([`tags`]) and links ([`links`]), and reconciles the
//!    store so deleted/excluded files are marked inactive.
//! 2. Each sync triggers the [`embed_scheduler`], which debounces bursts of
//!    syncs and drains the resulting vector backlog through the configured
//!    [`embedding`] provider.
//! 3. [`search`] answers keyword, semantic, and hybrid queries against the
//!    store with min-max normalized, weighted scoring.
//!
//! ## Search Modes
//!
//! | Mode | Engine | Requires Embeddings |
//! |------|--------|---------------------|
//! | `keyword` | SQLite FTS5 (BM25) | No |
//! | `semantic` | Cosine similarity over stored vectors | Yes |
//! | `hybrid` | Weighted merge (configurable α) | Yes |
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing, validation, and download policy |
//! | [`models`] | Core data types: `Document`, `Chunk`, `Tag`, `Link`, search hits |
//! | [`uri`] | Content-addressed `docid` derivation and `gno://` canonical URIs |
//! | [`walker`] | Filesystem walker: glob include/exclude, size limits |
//! | [`converter`] | Source-to-Markdown conversion |
//! | [`chunk`] | Deterministic character-based Markdown chunker |
//! | [`lang`] | Lightweight per-chunk language detection |
//! | [`tags`] | Tag grammar and frontmatter/body extraction |
//! | [`links`] | Wiki/Markdown link parsing, normalization, resolution |
//! | [`sync`] | Per-collection walk → convert → chunk → index pipeline |
//! | [`embedding`] | Embedding provider trait and implementations (OpenAI, Ollama, local) |
//! | [`model_cache`] | On-disk model weight cache with cross-process locking |
//! | [`model_lifecycle`] | In-process warm-model dedup, timeout, and idle disposal |
//! | [`embed_scheduler`] | Debounced background drain of the embedding backlog |
//! | [`search`] | Keyword, semantic, and hybrid search with score normalization |
//! | [`store`] | The persistence port, and its SQLite implementation |
//! | [`db`] | SQLite connection pool (WAL mode, foreign keys on) |
//! | [`error`] | Structured error taxonomy shared by every fallible operation |
//! | [`logging`] | `tracing`-based structured logging setup |
//!
//! ## Configuration
//!
//! `gno` is configured via a TOML file (default: `~/.config/gno/config.toml`,
//! overridable with `GNO_CONFIG_DIR`). See [`config`] for all available
//! options and [`config::load_config`] for validation rules.

pub mod chunk;
pub mod config;
pub mod converter;
pub mod db;
pub mod embed_scheduler;
pub mod embedding;
pub mod error;
pub mod lang;
pub mod links;
pub mod logging;
pub mod model_cache;
pub mod model_lifecycle;
pub mod models;
pub mod search;
pub mod store;
pub mod sync;
pub mod tags;
pub mod uri;
pub mod walker;
