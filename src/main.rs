//! # Threadloom CLI (`loom`)
//!
//! Fetches conversation threads from Slack and GitHub into a local SQLite
//! database, rebuilds reply graphs, and labels messages with heuristic
//! classifications.
//!
//! ## Usage
//!
//! ```bash
//! loom --config ./config/loom.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `loom init` | Create the SQLite database and schema |
//! | `loom fetch slack` | Search Slack and complete matching threads |
//! | `loom fetch github` | Fetch issues, pull requests and discussions |
//! | `loom graph [--save DIR]` | Rebuild the reply graph and print its stats |
//! | `loom classify` | Label every stored message |
//! | `loom select` | Query stored messages as JSON |
//! | `loom stats` | Database counts and rate-limit windows |
//! | `loom cache stats\|clear` | Inspect or empty the snapshot cache |
//!
//! ## Examples
//!
//! ```bash
//! loom init
//! SLACK_TOKEN=xoxp-... loom fetch slack --channel deploys --since 7d
//! GITHUB_TOKEN=ghp_... loom fetch github --owner octo --repo app --kind pr --since 2w
//! loom classify
//! loom select --thread msg_github_octo_app_pr_12 --with-classifications
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use threadloom::fetch_cmd::{self, GitHubArgs, SlackArgs};
use threadloom::progress::ProgressMode;
use threadloom::select::{self, SelectArgs};
use threadloom::{classify_cmd, config, graph_cmd, migrate, stats};

/// Threadloom: fetch, thread and classify conversations from Slack and GitHub.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/loom.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "loom", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/loom.toml")]
    config: PathBuf,

    /// Progress output on stderr for `fetch`. Defaults to `human` on a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Fetch messages from a source into the database.
    Fetch {
        #[command(subcommand)]
        source: FetchSource,
    },

    /// Rebuild the reply graph from stored messages and print its stats.
    Graph {
        /// Write a snapshot (nodes, adjacency, thread roots, metadata) to this directory.
        #[arg(long, value_name = "DIR")]
        save: Option<PathBuf>,
    },

    /// Classify every stored message and store the labels.
    Classify,

    /// Query stored messages.
    Select(SelectArgs),

    /// Show database statistics.
    Stats,

    /// Manage the snapshot cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum FetchSource {
    /// Search Slack messages and complete their threads.
    Slack(SlackArgs),
    /// Search GitHub issues and pull requests (and optionally discussions).
    #[command(name = "github")]
    GitHub(GitHubArgs),
}

#[derive(Subcommand)]
enum CacheAction {
    /// Snapshot count and size.
    Stats,
    /// Remove every snapshot.
    Clear,
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // The snapshot cache works without a config file.
    if let Commands::Cache { action } = &cli.command {
        let cfg = config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal());
        match action {
            CacheAction::Stats => stats::run_cache_stats(&cfg)?,
            CacheAction::Clear => stats::run_cache_clear(&cfg)?,
        }
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Fetch { source } => match source {
            FetchSource::Slack(args) => fetch_cmd::run_fetch_slack(&cfg, &args, progress).await?,
            FetchSource::GitHub(args) => {
                fetch_cmd::run_fetch_github(&cfg, &args, progress).await?
            }
        },
        Commands::Graph { save } => graph_cmd::run_graph(&cfg, save.as_deref()).await?,
        Commands::Classify => classify_cmd::run_classify(&cfg).await?,
        Commands::Select(args) => select::run_select(&cfg, &args).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Cache { .. } => {}
    }

    Ok(())
}
