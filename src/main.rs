//! # devctx CLI
//!
//! Thin command-line front end over the `devctx` library.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `devctx init` | Create the SQLite database and run schema migrations |
//! | `devctx ingest [PATH]` | Chunk, embed, and store text files under PATH |
//! | `devctx search "<query>"` | Print ranked hits from one or both branches |
//! | `devctx context "<query>"` | Print a budgeted, sanitized context block |
//! | `devctx enhanced "<query>"` | Context with query expansion and re-ranking |
//! | `devctx stats` | Document, chunk, and vector counts |
//!
//! Results go to stdout; logs go to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use devctx::{config, context, enhanced, ingest, logging, migrate, search, stats};

/// devctx: hybrid retrieval and RAG context assembly over a local store.
///
/// All commands read a TOML configuration file (`--config`). See
/// `config/devctx.example.toml` for every option.
#[derive(Parser)]
#[command(name = "devctx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/devctx.toml")]
    config: PathBuf,

    /// Enable debug logging for devctx on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest text files from a directory.
    ///
    /// Files matching `[ingest].include_globs` are chunked, embedded when a
    /// provider is configured, and stored. Unchanged files are skipped.
    Ingest {
        /// Directory to walk.
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Search indexed chunks.
    Search {
        query: String,

        /// `lexical` (FTS5), `vector` (cosine), or `hybrid` (RRF of both).
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum number of hits.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Build a budgeted, sanitized context for a query.
    Context {
        query: String,

        /// Maximum number of chunks.
        #[arg(long)]
        limit: Option<usize>,

        /// Character budget for the assembled context.
        #[arg(long)]
        budget: Option<usize>,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Build context with optional query expansion and LLM re-ranking.
    Enhanced {
        query: String,

        /// Generate paraphrases of the query and merge their results.
        #[arg(long)]
        expand: bool,

        /// Ask the generator to re-order the merged passages.
        #[arg(long)]
        rerank: bool,

        #[arg(long)]
        max_expansions: Option<usize>,

        #[arg(long)]
        budget: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show what the store holds.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path } => {
            ingest::run_ingest(&cfg, &path).await?;
        }
        Commands::Search { query, mode, limit } => {
            search::run_search(&cfg, &query, &mode, limit).await?;
        }
        Commands::Context {
            query,
            limit,
            budget,
            json,
        } => {
            context::run_context(&cfg, &query, limit, budget, json).await?;
        }
        Commands::Enhanced {
            query,
            expand,
            rerank,
            max_expansions,
            budget,
            json,
        } => {
            enhanced::run_enhanced(&cfg, &query, expand, rerank, max_expansions, budget, json)
                .await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
