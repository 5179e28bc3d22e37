//! # Custody Vault CLI (`vault`)
//!
//! The `vault` binary drives documents through the ingestion pipeline and
//! inspects the provenance ledger, content store, and search index.
//!
//! ## Usage
//!
//! ```bash
//! vault --config ./config/vault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vault init` | Create the vault directories, ledger, and index schema |
//! | `vault ingest <source>...` | Fetch, convert, OCR, assemble, and index sources |
//! | `vault ingest --dir <path>` | Ingest every `*.pdf` under a directory |
//! | `vault submit <source>...` | Register sources without driving them |
//! | `vault resume` | Drive every document that has not finished |
//! | `vault redrive <id>` | Requeue a failed document and drive it |
//! | `vault refetch <id>` | Fetch a document's source again |
//! | `vault history <id>` | Print a document's chain of custody |
//! | `vault show <id>` | Print derived state and the index entry |
//! | `vault list` | One line per document: state, version, source |
//! | `vault status` | Document counts per state and storage sizes |
//! | `vault search <terms>` | Search indexed page text |
//! | `vault verify` | Verify ledger hash chains and stored objects |
//! | `vault export` | Dump the ledger as JSON Lines |
//! | `vault reindex` | Rebuild the search index from the ledger |
//!
//! ## Examples
//!
//! ```bash
//! vault init --config ./config/vault.toml
//! vault ingest https://example.org/report.pdf ./scans/page.png
//! vault ingest --dir ./scans
//! vault search "appropriations 2024" --limit 5
//! vault history doc-3f2a9c01b4d7e865
//! ```
//!
//! Command output goes to stdout; logs and progress go to stderr. The
//! process exits non-zero when any driven document ends `FAILED`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use custody_vault::config::{self, Config};
use custody_vault::pipeline::{DocumentReport, Pipeline, PipelineBuilder};
use custody_vault::progress::ProgressMode;
use custody_vault::{export, fetch, get, migrate, search, stats};

/// Custody Vault CLI: OCR ingestion with a verifiable chain of custody.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vault.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "vault",
    about = "Custody Vault: OCR ingestion with a verifiable chain of custody",
    version,
    long_about = "Custody Vault fetches documents, renders them to page images, runs OCR, \
    assembles page text, and commits it to a full-text index, recording every step in an \
    append-only, hash-chained provenance ledger."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/vault.toml`.
    #[arg(long, global = true, default_value = "./config/vault.toml")]
    config: PathBuf,

    /// Progress output on stderr: `off`, `human`, or `json`.
    ///
    /// Defaults to `human` when stderr is a terminal, `off` otherwise.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the vault.
    ///
    /// Creates the root directory, the content store, the ledger, and the
    /// index schema. This command is idempotent.
    Init,

    /// Ingest one or more sources (URLs or local paths).
    ///
    /// New sources are registered and driven to `INDEXED` or `FAILED`.
    /// Already indexed sources are re-fetched; unchanged bytes are a no-op.
    Ingest {
        #[arg(required_unless_present = "dir")]
        sources: Vec<String>,

        /// Also ingest every `*.pdf` file under this directory, recursively,
        /// and print a summary line at the end.
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Document id to use instead of the one derived from the source.
        /// Only valid with a single source.
        #[arg(long)]
        id: Option<String>,
    },

    /// Register sources without driving them. They stay `PENDING`.
    Submit {
        #[arg(required = true)]
        sources: Vec<String>,
    },

    /// Drive every document that is neither `INDEXED` nor `FAILED`.
    Resume,

    /// Requeue a `FAILED` document at its failing stage and drive it.
    Redrive { id: String },

    /// Fetch a document's recorded source again.
    Refetch { id: String },

    /// Print a document's chain of custody, oldest event first.
    History { id: String },

    /// Print a document's derived state, artifacts, and index entry.
    Show {
        id: String,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List every document with its state, version, and source.
    List,

    /// Document counts per pipeline state, storage sizes, and failures.
    Status,

    /// Search indexed page text.
    Search {
        /// Search terms; every term must match.
        #[arg(required = true)]
        terms: Vec<String>,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Verify every ledger hash chain and re-hash every stored object.
    Verify,

    /// Export the ledger as JSON Lines.
    Export {
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Only this document's history.
        #[arg(long)]
        id: Option<String>,
    },

    /// Clear the search index and rebuild it by replaying the ledger.
    Reindex,
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(s)
        .ok_or_else(|| format!("invalid progress mode '{}': use off, human, or json", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Vault initialized at {}", cfg.vault.root_path.display());
        }
        Commands::Ingest {
            mut sources,
            dir,
            id,
        } => {
            if id.is_some() && (sources.len() != 1 || dir.is_some()) {
                anyhow::bail!("--id can only be used with a single source");
            }
            let summary = dir.is_some();
            if let Some(dir) = dir {
                let found = fetch::discover_sources(&dir)
                    .with_context(|| format!("Failed to scan {}", dir.display()))?;
                sources.extend(found);
            }
            let pipeline = open_pipeline(&cfg, progress).await?;
            let reports = match id {
                Some(id) => {
                    let result = pipeline.ingest(&sources[0], Some(&id)).await;
                    vec![pipeline.settle(&id, result).await]
                }
                None => pipeline.ingest_all(sources).await,
            };
            finish(&pipeline, reports, summary).await;
        }
        Commands::Submit { sources } => {
            let pipeline = open_pipeline(&cfg, progress).await?;
            for source in &sources {
                let id = pipeline.submit(source, None).await?;
                println!("{}  {}", id, source);
            }
            pipeline.shutdown().await;
        }
        Commands::Resume => {
            let pipeline = open_pipeline(&cfg, progress).await?;
            let reports = pipeline.resume().await?;
            if reports.is_empty() {
                println!("Nothing to resume.");
            }
            finish(&pipeline, reports, false).await;
        }
        Commands::Redrive { id } => {
            let pipeline = open_pipeline(&cfg, progress).await?;
            let result = pipeline.redrive(&id).await;
            let report = pipeline.settle(&id, result).await;
            finish(&pipeline, vec![report], false).await;
        }
        Commands::Refetch { id } => {
            let pipeline = open_pipeline(&cfg, progress).await?;
            let result = pipeline.refetch(&id).await;
            let report = pipeline.settle(&id, result).await;
            finish(&pipeline, vec![report], false).await;
        }
        Commands::History { id } => {
            get::run_history(&cfg, &id).await?;
        }
        Commands::Show { id, json } => {
            get::run_show(&cfg, &id, json).await?;
        }
        Commands::List => {
            get::run_list(&cfg).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Search { terms, limit } => {
            search::run_search(&cfg, &terms.join(" "), limit).await?;
        }
        Commands::Verify => {
            if !stats::run_verify(&cfg).await? {
                std::process::exit(1);
            }
        }
        Commands::Export { out, id } => {
            export::run_export(&cfg, out.as_deref(), id.as_deref()).await?;
        }
        Commands::Reindex => {
            let pipeline = open_pipeline(&cfg, ProgressMode::Off).await?;
            let report = pipeline.rebuild_index().await?;
            pipeline.shutdown().await;
            println!(
                "Reindexed {} documents from {} ledger events.",
                report.documents, report.events_replayed
            );
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `[logging].filter`.
fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.filter.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn open_pipeline(cfg: &Config, progress: ProgressMode) -> anyhow::Result<Arc<Pipeline>> {
    let pipeline = PipelineBuilder::new(cfg.clone())
        .progress(progress.reporter())
        .build()
        .await
        .with_context(|| format!("Failed to open vault at {}", cfg.vault.root_path.display()))?;
    let pipeline = Arc::new(pipeline);

    let token = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; cancelling in-flight stages.");
            token.cancel();
        }
    });

    Ok(pipeline)
}

/// Print one line per document (plus a totals line when `summary` is set),
/// close the vault, and exit non-zero if anything did not make it.
async fn finish(pipeline: &Pipeline, reports: Vec<DocumentReport>, summary: bool) {
    let mut failed = 0;
    for report in &reports {
        match &report.error_detail {
            Some(detail) => println!("{}  {}  {}", report.document_id, report.state, detail),
            None => println!("{}  {}", report.document_id, report.state),
        }
        if !report.is_ok() {
            failed += 1;
        }
    }
    if summary {
        println!(
            "Processed {}: {} ok, {} failed.",
            reports.len(),
            reports.len() - failed,
            failed
        );
    }
    let halted = pipeline.is_halted();
    pipeline.shutdown().await;

    if halted {
        eprintln!("Pipeline halted after a fatal integrity error; run `vault verify`.");
    }
    if failed > 0 || halted {
        eprintln!("{} of {} documents did not complete.", failed, reports.len());
        std::process::exit(1);
    }
}
