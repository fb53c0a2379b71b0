//! # ragline CLI
//!
//! ## Usage
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite database and schema |
//! | `ragline ingest <path>` | Chunk, embed and store files under a path |
//! | `ragline search "<query>"` | Hybrid retrieval within an owner scope |
//! | `ragline embed pending` | Embed chunks that are still missing a vector |
//! | `ragline traces` | Show persisted trace events |
//!
//! Ctrl-C cancels the running operation; partial results are discarded.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand};

use ragline::config::{self, Config};
use ragline::ragline_core::models::{Scope, SourceKind};
use ragline::ragline_core::search::ContextBudget;
use ragline::trace_sink::SqliteTraceSink;
use ragline::{connector_fs, db, logging, migrate, stats, CancelToken, Ragline};

/// Hybrid keyword + semantic retrieval over a local SQLite knowledge store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragline.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "ragline", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a file or every matching file under a directory.
    ///
    /// Each file's canonical path is its external id; re-ingesting a file
    /// supersedes the previous version.
    Ingest {
        path: PathBuf,

        /// Owner tag stamped on every document, chunk and embedding.
        #[arg(long)]
        owner: Option<String>,

        /// Source kind: upload, message, url, or other.
        #[arg(long, default_value = "upload")]
        kind: String,

        /// Include glob (repeatable). Defaults to `**/*.md` and `**/*.txt`.
        #[arg(long = "include")]
        include: Vec<String>,

        /// Exclude glob (repeatable).
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Print outcomes as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve ranked context for a query.
    ///
    /// Exactly one of `--owner` or `--unscoped` is required.
    #[command(group(ArgGroup::new("scope").required(true).args(["owner", "unscoped"])))]
    Search {
        query: String,

        /// Only search chunks tagged with this owner.
        #[arg(long)]
        owner: Option<String>,

        /// Search every chunk regardless of owner.
        #[arg(long)]
        unscoped: bool,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Cumulative text budget, in characters.
        #[arg(long)]
        max_chars: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show persisted trace events (requires `trace.persist = true`).
    Traces {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Aggregate into hourly per-stage buckets.
        #[arg(long)]
        hourly: bool,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed live chunks that have no vector for the configured model.
    Pending {
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: &CancelToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest {
            path,
            owner,
            kind,
            include,
            exclude,
            json,
        } => {
            let kind: SourceKind = kind.parse()?;
            let include = if include.is_empty() {
                connector_fs::default_include_globs()
            } else {
                include
            };
            let docs = connector_fs::scan_path(&path, &include, &exclude, owner.as_deref(), kind)?;
            run_ingest(&cfg, docs, &cancel, json).await?;
        }
        Commands::Search {
            query,
            owner,
            unscoped,
            limit,
            max_chars,
            json,
        } => {
            let scope = match (owner, unscoped) {
                (Some(tag), false) => Scope::owner(tag),
                (None, true) => Scope::Unscoped,
                _ => bail!("pass exactly one of --owner or --unscoped"),
            };
            run_search(&cfg, &query, &scope, limit, max_chars, &cancel, json).await?;
        }
        Commands::Embed {
            action: EmbedAction::Pending { limit },
        } => {
            let engine = Ragline::open(&cfg).await?;
            let result = engine.embed_pending(limit, &cancel).await;
            engine.shutdown().await;
            let report = result?;
            println!("embed pending");
            println!("  requested: {}", report.requested);
            println!("  embedded: {}", report.embedded);
            println!("  failed: {}", report.failed);
        }
        Commands::Traces {
            limit,
            hourly,
            json,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let events = SqliteTraceSink::new(pool.clone()).recent(limit).await?;
            pool.close().await;
            if !cfg.trace.persist && events.is_empty() {
                eprintln!("Note: trace.persist is false; nothing is written to the database.");
            }
            if hourly {
                let buckets = stats::hourly_buckets(&events);
                if json {
                    println!("{}", serde_json::to_string_pretty(&buckets)?);
                } else {
                    stats::print_hourly(&buckets);
                }
            } else if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No trace events.");
            } else {
                for e in &events {
                    println!(
                        "{}  {:<16}  {:>7}  {}",
                        e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        e.stage(),
                        e.duration_ms
                            .map(|ms| format!("{}ms", ms))
                            .unwrap_or_else(|| "-".to_string()),
                        e.correlation_id
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_ingest(
    cfg: &Config,
    docs: Vec<ragline::ragline_core::models::SourceDocument>,
    cancel: &CancelToken,
    json: bool,
) -> anyhow::Result<()> {
    let engine = Ragline::open(cfg).await?;
    let found = docs.len();
    let results = engine.ingest_many(docs, cancel).await;
    engine.shutdown().await;

    let mut outcomes = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        println!("ingest");
        println!("  documents found: {}", found);
        println!("  processed: {}", outcomes.len());
        println!("  failed: {}", errors.len());
        println!(
            "  chunks created: {}",
            outcomes.iter().map(|o| o.chunks_created).sum::<usize>()
        );
        println!(
            "  chunks filtered: {}",
            outcomes.iter().map(|o| o.chunks_filtered).sum::<usize>()
        );
        println!(
            "  chunks embedded: {}",
            outcomes.iter().map(|o| o.chunks_embedded).sum::<usize>()
        );
        println!(
            "  chunks unembedded: {}",
            outcomes.iter().map(|o| o.chunks_failed).sum::<usize>()
        );
    }
    for e in &errors {
        eprintln!("Error: {}", e);
    }
    if !errors.is_empty() && outcomes.is_empty() {
        bail!("all {} documents failed to ingest", errors.len());
    }
    Ok(())
}

async fn run_search(
    cfg: &Config,
    query: &str,
    scope: &Scope,
    limit: Option<usize>,
    max_chars: Option<usize>,
    cancel: &CancelToken,
    json: bool,
) -> anyhow::Result<()> {
    let engine = Ragline::open(cfg).await?;
    let mut options = engine.default_options().clone();
    options.budget = ContextBudget {
        max_results: limit.unwrap_or(options.budget.max_results),
        max_chars: max_chars.or(options.budget.max_chars),
    };
    let result = engine.retrieve_with(query, scope, &options, cancel).await;
    engine.shutdown().await;
    let retrieval = result.context("retrieval failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&retrieval)?);
        return Ok(());
    }

    for d in &retrieval.degradations {
        eprintln!("Warning: degraded retrieval ({:?})", d);
    }
    if retrieval.results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for r in &retrieval.results {
        println!("{}. [{:.2}] {:?}", r.rank, r.score, r.match_kind);
        println!(
            "    excerpt: \"{}\"",
            r.text.chars().take(200).collect::<String>().replace('\n', " ").trim()
        );
        println!("    chunk: {} (#{})", r.chunk_id, r.ordinal);
        println!("    document: {}", r.source_document_id);
        println!();
    }
    Ok(())
}
