//! # ReviewLens CLI (`reviewlens`)
//!
//! The `reviewlens` binary drives the analysis pipeline from the command
//! line and hosts the streaming HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! reviewlens --config ./config/reviewlens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `reviewlens init` | Create the SQLite database and run schema migrations |
//! | `reviewlens resolve "<input>"` | Show the app identifiers an input resolves to |
//! | `reviewlens analyze "<input>"` | Run an analysis, printing NDJSON events to stdout |
//! | `reviewlens serve` | Start the streaming HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! reviewlens init --config ./config/reviewlens.toml
//!
//! # What does this input resolve to?
//! reviewlens resolve "com.spotify.music vs com.apple.music"
//!
//! # Analyze and compare two apps, streaming events to stdout
//! reviewlens analyze "com.spotify.music vs com.apple.music"
//!
//! # Start the HTTP server
//! reviewlens serve --config ./config/reviewlens.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use reviewlens::analyzer::{AnalyzeOptions, Depth};
use reviewlens::compare::AllowAll;
use reviewlens::config::{load_config, Config};
use reviewlens::fetcher::HttpReviewSource;
use reviewlens::llm::OpenAiClient;
use reviewlens::orchestrator::{AnalysisRequest, Orchestrator};
use reviewlens::store::AppDataStore;
use reviewlens::{db, migrate, resolver, server};

/// ReviewLens — streaming competitive analysis of mobile apps from their
/// user reviews.
#[derive(Parser)]
#[command(
    name = "reviewlens",
    about = "Streaming competitive analysis of mobile apps from user reviews",
    version,
    long_about = "ReviewLens resolves free-form input into app identifiers, fetches store \
    metadata and reviews with a 30-day cache, analyzes each app's review sample with a \
    structured LLM call, compares the apps, and streams every result as NDJSON events."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/reviewlens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (apps,
    /// reviews, analyses, comparisons). Idempotent.
    Init,

    /// Resolve free-form input into app identifiers without fetching.
    Resolve {
        /// Input text: package names, store URLs, `vs`/comma-separated.
        input: String,
    },

    /// Run an analysis, printing one NDJSON event per line to stdout.
    Analyze {
        /// Input text: package names, store URLs, `vs`/comma-separated.
        input: String,

        /// Review sample size fed to the LLM (overrides config).
        #[arg(long)]
        sample_size: Option<usize>,

        /// Analysis depth: basic, detailed, or comprehensive (overrides config).
        #[arg(long)]
        depth: Option<String>,
    },

    /// Start the streaming HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reviewlens=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("Database initialized at {}", config.db.path.display());
            Ok(())
        }
        Commands::Resolve { input } => {
            for ident in resolver::resolve_identifiers(&input) {
                println!("{}\t{}", ident.platform, ident.app_id);
            }
            Ok(())
        }
        Commands::Analyze {
            input,
            sample_size,
            depth,
        } => run_analyze(&config, &input, sample_size, depth).await,
        Commands::Serve => {
            let orchestrator = build_orchestrator(&config, None, None).await?;
            server::run_server(&config.server.bind, orchestrator).await
        }
    }
}

async fn run_analyze(
    config: &Config,
    input: &str,
    sample_size: Option<usize>,
    depth: Option<String>,
) -> Result<()> {
    let orchestrator = build_orchestrator(config, sample_size, depth).await?;
    let request = AnalysisRequest {
        app_ids: Vec::new(),
        turns: vec![input.to_string()],
        user: None,
    };

    let (tx, mut rx) = mpsc::channel(64);
    let run = tokio::spawn(async move {
        orchestrator.run(request, tx).await;
    });

    while let Some(event) = rx.recv().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    run.await.context("analysis task failed")?;
    Ok(())
}

async fn build_orchestrator(
    config: &Config,
    sample_size: Option<usize>,
    depth: Option<String>,
) -> Result<Orchestrator> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let store = AppDataStore::new(pool, config.cache.ttl_days);

    let source = Arc::new(HttpReviewSource::new(config.fetcher.clone())?);
    let llm = Arc::new(OpenAiClient::new(config.llm.clone())?);

    let depth_str = depth.unwrap_or_else(|| config.analysis.depth.clone());
    let depth = Depth::parse(&depth_str)
        .with_context(|| format!("Unknown analysis depth: '{}'", depth_str))?;
    let opts = AnalyzeOptions {
        sample_size: sample_size.unwrap_or(config.analysis.sample_size),
        depth,
    };

    Ok(Orchestrator::new(
        store,
        source,
        llm,
        Arc::new(AllowAll),
        opts,
        config.fetcher.review_count,
    ))
}
