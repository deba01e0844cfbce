//! # KB Maint CLI (`kbm`)
//!
//! The `kbm` binary runs the maintenance commands against the index named
//! in the configuration file.
//!
//! ## Usage
//!
//! ```bash
//! kbm --config ./config/kbm.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbm ping` | Check that the index is reachable |
//! | `kbm search "<text>"` | Show the top hits with highlighted fragments |
//! | `kbm purge "<text>"` | Search, pick one hit, snapshot, delete it |
//! | `kbm backup` | Export the whole index to a snapshot |
//! | `kbm review` | Review candidates and apply staged corrections |
//! | `kbm apply <session>` | Apply a saved review session |
//!
//! ## Examples
//!
//! ```bash
//! # Multi-field search over the configured fields
//! kbm search "vpn drops" --mode multi
//!
//! # Review every document whose answer is empty, without applying
//! kbm review --empty --dry-run
//!
//! # Pick up a review where it stopped
//! kbm review --resume backups/review_qa_20260101_120000.session.json
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use std::io::Write;
use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kb_maint::config;
use kb_maint::index::http::HttpIndexClient;
use kb_maint::maintenance::{Maintenance, PurgeOutcome, SearchMode};
use kb_maint::progress::ProgressMode;
use kb_maint::query::Query;
use kb_maint::review::ConsoleDecisions;

/// KB Maint CLI: find, snapshot, review, and correct documents in a search index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kbm.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbm",
    about = "KB Maint: find, snapshot, review, and correct documents in a search index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbm.toml")]
    config: PathBuf,

    /// Override `[index].name` from the config file.
    #[arg(long, global = true)]
    index: Option<String>,

    /// Progress output for long traversals (default: human on a TTY, off otherwise).
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the index answers.
    Ping,

    /// Search and print the top hits.
    Search {
        /// Query text (ignored for `--mode empty`).
        #[arg(default_value = "")]
        text: String,

        #[arg(long, value_enum, default_value = "tolerant")]
        mode: SearchMode,

        /// Field to search (default: `[search].default_field`).
        #[arg(long)]
        field: Option<String>,

        /// Number of hits to show (default: `[search].top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search, choose one hit by id, confirm, and delete it.
    ///
    /// The listed hits are snapshotted before the delete is sent.
    Purge {
        #[arg(default_value = "")]
        text: String,

        #[arg(long, value_enum, default_value = "tolerant")]
        mode: SearchMode,

        #[arg(long)]
        field: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Export every document of the index to a new snapshot.
    Backup {
        /// Snapshot label (default: `backup_<index>`).
        #[arg(long)]
        label: Option<String>,
    },

    /// Review candidate documents one by one and apply the staged corrections.
    ///
    /// Candidates are documents whose field contains the sentinel value, or,
    /// with `--empty`, documents whose field is missing or blank.
    Review {
        /// Sentinel text (default: `[review].sentinel_value`).
        #[arg(long, conflicts_with = "empty")]
        value: Option<String>,

        /// Field to inspect (default: `[review].sentinel_field`).
        #[arg(long)]
        field: Option<String>,

        /// Select documents whose field is absent, empty, or whitespace.
        #[arg(long)]
        empty: bool,

        /// Save the session but do not apply anything.
        #[arg(long)]
        dry_run: bool,

        /// Continue a saved session instead of searching again.
        #[arg(long, conflicts_with_all = ["value", "empty", "field"])]
        resume: Option<PathBuf>,
    },

    /// Apply the corrections of a saved review session.
    Apply {
        /// Path to a `.session.json` file.
        session: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    let mut cfg = config::load_config(&cli.config)?;
    if let Some(index) = cli.index {
        cfg.index.name = index;
    }

    let client = HttpIndexClient::new(&cfg.index)?;
    let reporter = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();
    let maint = Maintenance::new(&client, &cfg, reporter.as_ref());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Ping => {
            maint.ensure_reachable().await?;
            writeln!(out, "{} is reachable.", cfg.index.url)?;
        }
        Commands::Search {
            text,
            mode,
            field,
            limit,
        } => {
            let query = maint.build_query(mode, &text, field.as_deref())?;
            let limit = limit.unwrap_or(cfg.search.top_k);
            maint.search(&query, limit, &mut out).await?;
        }
        Commands::Purge {
            text,
            mode,
            field,
            limit,
        } => {
            let query = maint.build_query(mode, &text, field.as_deref())?;
            let limit = limit.unwrap_or(cfg.search.top_k);
            let stdin = std::io::stdin();
            let outcome = maint
                .purge(&query, limit, &mut stdin.lock(), &mut out)
                .await?;
            if outcome == PurgeOutcome::NoMatches {
                writeln!(out, "Nothing to purge.")?;
            }
        }
        Commands::Backup { label } => {
            let handle = maint.backup(label.as_deref()).await?;
            writeln!(
                out,
                "Backed up {} document(s) to {}",
                handle.len(),
                handle.path().display()
            )?;
        }
        Commands::Review {
            value,
            field,
            empty,
            dry_run,
            resume,
        } => {
            let stdin = std::io::stdin();
            let mut decisions = ConsoleDecisions::new(
                stdin.lock(),
                std::io::stdout(),
                cfg.review.edit_field.clone(),
            );
            let run = match resume {
                Some(session) => {
                    maint
                        .resume(&session, &mut decisions, dry_run, &mut out)
                        .await?
                }
                None => {
                    let field = field.unwrap_or_else(|| cfg.review.sentinel_field.clone());
                    let query = if empty {
                        Query::Empty { field }
                    } else {
                        let Some(term) = value.or_else(|| cfg.review.sentinel_value.clone()) else {
                            bail!("no sentinel value: pass --value, --empty, or set [review].sentinel_value");
                        };
                        Query::Contains { field, term }
                    };
                    maint.review(&query, &mut decisions, dry_run, &mut out).await?
                }
            };
            if let Some(report) = run.report {
                if report.has_failures() {
                    bail!("{} correction(s) failed", report.failures().len());
                }
            }
        }
        Commands::Apply { session } => {
            let report = maint.apply_session(&session, &mut out).await?;
            if report.has_failures() {
                bail!("{} correction(s) failed", report.failures().len());
            }
        }
    }

    Ok(())
}
