//! Command-line interface for pagedex.
//!
//! Every command opens the index from configuration, does its work and
//! exits. Saved pages are embedded before `save` returns unless
//! `--no-wait` is given; the job then stays queued for the next `drain` or
//! `watch`.

pub mod setup;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pagedex_config::{default_config_path, Config};
use pagedex_index::{JobSummary, LinkEdge, PageWatcher, SearchResult};

#[derive(Parser, Debug)]
#[command(name = "pagedex")]
#[command(author, version, about = "Semantic search and backlinks for page trees", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.config/pagedex/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory of <page-id>.json files, used for titles and to skip
    /// deleted pages
    #[arg(long, global = true)]
    pub pages_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Index a page snapshot read from a file
    Save {
        page_id: String,
        file: PathBuf,

        /// Queue the page without waiting for embeddings
        #[arg(long)]
        no_wait: bool,
    },

    /// Re-embed every unit of a page, changed or not
    Reindex { page_id: String, file: PathBuf },

    /// Forget a page
    Remove { page_id: String },

    /// Process queued jobs until none are claimable
    Drain,

    /// Semantic search over indexed units
    Search {
        query: String,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Minimum cosine similarity
        #[arg(long)]
        min_score: Option<f32>,
    },

    /// Pages that reference a page
    Backlinks { page_id: String },

    /// List queued jobs
    Jobs {
        /// Only dead-lettered jobs
        #[arg(long)]
        dead: bool,
    },

    /// Requeue dead-lettered jobs and process them
    RetryDead,

    /// Counts across the index
    Stats,

    /// Watch a directory of page files and index changes as they happen
    Watch { dir: PathBuf },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Parse arguments and run the selected command.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    execute(cli).await
}

fn init_logging(verbose: bool) {
    let default = if verbose { "pagedex=debug" } else { "pagedex=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A subscriber may already be installed when embedded in another binary
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn execute(cli: Cli) -> Result<()> {
    if let Commands::InitConfig { force } = cli.command {
        let path = match cli.config.or_else(default_config_path) {
            Some(path) => path,
            None => anyhow::bail!("No configuration directory; pass --config"),
        };
        Config::write_default(&path, force)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    let index = setup::open_index(&config, cli.pages_dir.as_deref()).await?;

    match cli.command {
        Commands::Save {
            page_id,
            file,
            no_wait,
        } => {
            let snapshot = read_snapshot(&file)?;
            let seq = index.save_page(&page_id, &snapshot).await?;
            if !no_wait {
                index.drain_until_idle().await?;
            }
            info!("Saved page {} (job {})", page_id, seq);
        }
        Commands::Reindex { page_id, file } => {
            let snapshot = read_snapshot(&file)?;
            index.reindex(&page_id, &snapshot).await?;
            index.drain_until_idle().await?;
            info!("Reindexed page {}", page_id);
        }
        Commands::Remove { page_id } => {
            index.remove_page(&page_id).await?;
        }
        Commands::Drain => {
            index.drain_until_idle().await?;
            report_dead_letters(&index.dead_letters()?);
        }
        Commands::Search {
            query,
            limit,
            min_score,
        } => {
            let options = setup::search_options(&config, limit, min_score);
            let results = index.search(&query, &options).await?;
            output(cli.json, &results[..], print_results)?;
        }
        Commands::Backlinks { page_id } => {
            let edges = index.backlinks(&page_id)?;
            output(cli.json, &edges[..], print_edges)?;
        }
        Commands::Jobs { dead } => {
            let jobs = if dead { index.dead_letters()? } else { index.jobs()? };
            output(cli.json, &jobs[..], print_jobs)?;
        }
        Commands::RetryDead => {
            let revived = index.retry_dead()?;
            index.drain_until_idle().await?;
            println!("Requeued {} job(s)", revived);
            report_dead_letters(&index.dead_letters()?);
        }
        Commands::Stats => {
            let stats = index.stats().await?;
            output(cli.json, &stats, |s| {
                println!("pages:        {}", s.pages);
                println!("units:        {}", s.units);
                println!("vectors:      {}", s.vectors);
                println!("links:        {}", s.links);
                println!("pending jobs: {}", s.pending_jobs);
                println!("dead jobs:    {}", s.dead_jobs);
            })?;
        }
        Commands::Watch { dir } => {
            let index = Arc::new(index);
            // Work queued by earlier runs
            index.kick();

            let watcher = PageWatcher::new(dir, setup::watcher_config(&config));
            tokio::select! {
                result = watcher.run(Arc::clone(&index)) => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping watcher"),
            }
        }
        // Handled before the index is opened
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

fn read_snapshot(path: &std::path::Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn output<T: Serialize + ?Sized>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn report_dead_letters(dead: &[JobSummary]) {
    if !dead.is_empty() {
        warn!("{} job(s) dead-lettered; see `pagedex jobs --dead`", dead.len());
    }
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No matches");
    }
    for r in results {
        let title = r.title.as_deref().unwrap_or(&r.page_id);
        println!("{:.3}  {} #{}", r.score, title, r.unit_id);
        println!("       {}", r.text_preview);
    }
}

fn print_edges(edges: &[LinkEdge]) {
    if edges.is_empty() {
        println!("No backlinks");
    }
    for edge in edges {
        match &edge.target_unit_id {
            Some(unit) => println!("{} -> #{}: {}", edge.source_page_id, unit, edge.snippet),
            None => println!("{}: {}", edge.source_page_id, edge.snippet),
        }
    }
}

fn print_jobs(jobs: &[JobSummary]) {
    if jobs.is_empty() {
        println!("No jobs");
    }
    for job in jobs {
        let state = if job.dead {
            "dead"
        } else if job.processing {
            "processing"
        } else {
            "pending"
        };
        print!("{:>6}  {:<10} {} attempts={}", job.seq, state, job.page_id, job.attempts);
        if job.reindex {
            print!(" reindex");
        }
        match &job.last_error {
            Some(error) => println!("  {}", error),
            None => println!(),
        }
    }
}
