//! # Clinical RAG CLI (`crag`)
//!
//! ## Usage
//!
//! ```bash
//! crag --config ./config/crag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crag init` | Create the SQLite database and run schema migrations |
//! | `crag import <path>` | Load documents from a JSON, NDJSON file or directory |
//! | `crag index` | Chunk and embed every stored document |
//! | `crag chunks <id>` | Show how one document is chunked |
//! | `crag search <terms>...` | Find documents by similarity |
//! | `crag ask "<question>"` | Answer a question from the records |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use clinical_rag::{commands, config, progress::ProgressMode};

/// Clinical RAG CLI: question answering over your own clinical records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/crag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "crag",
    about = "Clinical RAG: question answering over your own clinical records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/crag.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output: `auto`, `human`, `json` or `off`.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again leaves existing data alone.
    Init,

    /// Import clinical documents.
    ///
    /// Accepts a JSON array, a single document, NDJSON, or a directory of
    /// `.json` / `.ndjson` / `.jsonl` files. Existing documents with the
    /// same id are replaced.
    Import {
        path: PathBuf,

        /// Index the imported documents right away.
        #[arg(long)]
        index: bool,
    },

    /// Chunk and embed every stored document.
    ///
    /// Unchanged chunks are not re-embedded, so re-running is cheap.
    Index,

    /// Print the chunks produced for one document.
    Chunks {
        /// Document id.
        id: String,
    },

    /// Search documents by similarity.
    Search {
        /// Search terms; joined into one query.
        #[arg(required = true)]
        terms: Vec<String>,

        /// Only search this user's records.
        #[arg(long)]
        user: Option<String>,

        /// Number of chunk hits to request.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a question about the records.
    ///
    /// Streams the answer to stdout; search activity is reported on stderr.
    Ask {
        question: String,

        /// Only use this user's records.
        #[arg(long)]
        user: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let progress = ProgressMode::from_flag(&cli.progress).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown progress mode: {}. Use auto, human, json, or off.",
            cli.progress
        )
    })?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Import { path, index } => {
            commands::run_import(&cfg, &path, index).await?;
        }
        Commands::Index => {
            commands::run_index(&cfg, progress).await?;
        }
        Commands::Chunks { id } => {
            commands::run_chunks(&cfg, &id).await?;
        }
        Commands::Search { terms, user, limit } => {
            commands::run_search(&cfg, &terms, user, limit).await?;
        }
        Commands::Ask { question, user } => {
            commands::run_ask(&cfg, &question, user).await?;
        }
    }

    Ok(())
}
