//! Thin CLI smoke-test harness over the `gno_core` library.
//!
//! Not the product's real command surface — just enough of `init`, `sync`,
//! `search`, and `get` to exercise the library end to end from a terminal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use gno_core::config::{self, DownloadPolicy};
use gno_core::logging;
use gno_core::search::{self, SearchFilters};
use gno_core::store::sqlite::SqliteStore;
use gno_core::store::Store;
use gno_core::sync;

#[derive(Parser)]
#[command(name = "gno", about = "gno search engine — CLI smoke-test harness", version)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the store's schema
    Init,

    /// Walk configured collections and index changed files
    Sync {
        /// Only sync this collection; defaults to all configured collections
        collection: Option<String>,
    },

    /// Search indexed documents
    Search {
        query: String,

        #[arg(long, default_value = "keyword")]
        mode: String,

        #[arg(long)]
        collection: Option<String>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Fetch a document by its docid (e.g. `#a1b2c3d4`)
    Get { docid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let policy = DownloadPolicy::resolve(cli.offline);
    if policy.offline {
        std::env::set_var("HF_HUB_OFFLINE", "1");
    }

    let config_path = cli
        .config
        .unwrap_or_else(|| config::config_dir().join("config.toml"));
    let cfg = config::load_config(&config_path)?;

    let store = Arc::new(SqliteStore::open(&cfg.store.path).await?);

    match cli.command {
        Commands::Init => {
            let report = store.migrate(&cfg.store.fts_tokenizer).await?;
            println!(
                "schema at version {} ({} migration(s) applied)",
                report.current_version,
                report.applied.len()
            );
        }
        Commands::Sync { collection } => {
            let targets: Vec<_> = cfg
                .collections
                .iter()
                .filter(|c| collection.as_deref().map_or(true, |name| c.name == name))
                .collect();
            if targets.is_empty() {
                anyhow::bail!("no matching collection configured");
            }
            for collection_config in targets {
                let report = sync::sync_collection(store.clone(), &cfg, collection_config).await?;
                println!(
                    "{}: {} processed, {} repaired, {} skipped, {} failed, {} deactivated",
                    report.collection,
                    report.processed,
                    report.repaired,
                    report.skipped,
                    report.failed,
                    report.deactivated
                );
            }
        }
        Commands::Search {
            query,
            mode,
            collection,
            limit,
        } => {
            let filters = SearchFilters {
                collection,
                ..Default::default()
            };
            search::run_search(store.as_ref(), &cfg, &query, &mode, &filters, limit).await?;
        }
        Commands::Get { docid } => match store.get_document_by_docid(&docid).await? {
            Some(doc) => {
                println!("{}  {}", doc.docid, doc.uri);
                println!("title: {}", doc.title.as_deref().unwrap_or("(untitled)"));
                println!("active: {}", doc.active);
                if let Some(hash) = &doc.mirror_hash {
                    if let Some(content) = store.get_content(hash).await? {
                        println!();
                        println!("{content}");
                    }
                }
            }
            None => println!("no document with docid {docid}"),
        },
    }

    Ok(())
}
