//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use harvester_chunker::SemanticChunker;
use harvester_core::{
    CrawlStats, HttpEmbedder, IndexSink, PageOutcome, Pipeline, ProgressReporter, StopReason,
};
use harvester_crawler::{Frontier, UrlPolicy};
use harvester_extract::{BlockExtractor, LayoutTable};
use harvester_shared::{AppConfig, CrawlConfig, init_config, load_config, load_config_from};
use harvester_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Harvester: crawl institutional sites into a context-annotated chunk index.
#[derive(Parser)]
#[command(
    name = "harvester",
    version,
    about = "Crawl institutional sites and index their content as context-annotated chunks.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.harvester/harvester.toml.
    #[arg(long, global = true, env = "HARVESTER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl from the configured seeds and index every page.
    Crawl(CrawlArgs),

    /// Extract and chunk a saved HTML page, printing the chunks as JSON.
    Extract {
        /// HTML file to read.
        file: PathBuf,

        /// URL the page was served from; drives layout detection and link resolution.
        #[arg(long)]
        url: String,

        /// Print the extracted page (blocks and links) instead of chunks.
        #[arg(long)]
        blocks: bool,
    },

    /// Show index and checkpoint counts.
    Status {
        /// Database path (defaults to the configured one).
        #[arg(long)]
        db: Option<PathBuf>,

        /// Checkpoint file (defaults to the configured one).
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Overrides applied on top of the loaded config for one crawl.
#[derive(clap::Args, Default)]
pub(crate) struct CrawlArgs {
    /// Seed URL (repeatable). Replaces the configured seeds.
    #[arg(long = "seed")]
    pub seeds: Vec<String>,

    /// Stop after this many successfully indexed pages.
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Checkpoint file for resumable crawls.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Database path.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Politeness delay after each indexed page, in milliseconds.
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Number of concurrent workers.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Ignore robots.txt.
    #[arg(long)]
    pub no_robots: bool,

    /// Store chunks without embeddings.
    #[arg(long)]
    pub no_embed: bool,
}

impl CrawlArgs {
    fn apply(&self, config: &mut AppConfig) {
        if !self.seeds.is_empty() {
            config.crawl.seeds = self.seeds.clone();
        }
        if let Some(n) = self.max_pages {
            config.crawl.max_pages = n;
        }
        if let Some(path) = &self.checkpoint {
            config.crawl.checkpoint_path = path.to_string_lossy().into_owned();
        }
        if let Some(path) = &self.db {
            config.storage.db_path = path.to_string_lossy().into_owned();
        }
        if let Some(ms) = self.delay_ms {
            config.crawl.delay_ms = ms;
        }
        if let Some(n) = self.concurrency {
            config.crawl.concurrency = n;
        }
        if self.no_robots {
            config.crawl.respect_robots_txt = false;
        }
        if self.no_embed {
            config.embedding.enabled = false;
        }
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "harvester=info",
        1 => "harvester=debug",
        _ => "harvester=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Crawl(args) => cmd_crawl(config_path, &args).await,
        Command::Extract { file, url, blocks } => cmd_extract(config_path, &file, &url, blocks),
        Command::Status {
            db,
            checkpoint,
            json,
        } => cmd_status(config_path, db.as_deref(), checkpoint.as_deref(), json).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

fn extractor_for(config: &CrawlConfig) -> Result<BlockExtractor> {
    Ok(match &config.layout_rules {
        Some(path) => BlockExtractor::new(LayoutTable::load(path)?),
        None => BlockExtractor::builtin()?,
    })
}

// ---------------------------------------------------------------------------
// crawl
// ---------------------------------------------------------------------------

async fn cmd_crawl(config_path: Option<&Path>, args: &CrawlArgs) -> Result<()> {
    let mut config = resolve_config(config_path)?;
    args.apply(&mut config);
    if config.crawl.seeds.is_empty() {
        return Err(eyre!("no seeds: pass --seed or set crawl.seeds in the config file"));
    }

    let crawl = CrawlConfig::from(&config);
    let storage = Storage::open(Path::new(&config.storage.db_path)).await?;
    let embedder = if config.embedding.enabled {
        Some(HttpEmbedder::from_config(&config.embedding)?)
    } else {
        warn!("embedding disabled, chunks are stored without vectors");
        None
    };

    info!(
        seeds = crawl.seeds.len(),
        max_pages = crawl.max_pages,
        db = %config.storage.db_path,
        "starting crawl"
    );

    let pipeline = Pipeline::new(crawl, IndexSink::new(storage, embedder))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight pages");
            on_signal.cancel();
        }
    });

    let reporter = CliProgress::new();
    let stats = pipeline.run(&reporter, &cancel).await;
    print_crawl_summary(&stats);

    let totals = pipeline.sink().storage().stats().await?;
    println!(
        "  Index:      {} documents, {} chunks ({} embedded)",
        totals.documents, totals.chunks, totals.embedded_chunks
    );
    println!();
    Ok(())
}

fn print_crawl_summary(stats: &CrawlStats) {
    let reason = match stats.stop_reason {
        StopReason::BudgetReached => "page budget reached",
        StopReason::FrontierExhausted => "no pending URLs left",
        StopReason::Cancelled => "interrupted",
    };

    println!();
    println!("  Crawl finished: {reason}");
    println!("  Indexed:    {}", stats.pages_indexed);
    println!("  Failed:     {}", stats.pages_failed);
    println!("  Robots:     {}", stats.robots_blocked);
    println!(
        "  Chunks:     {} new, {} skipped, {} errors",
        stats.chunks.inserted, stats.chunks.skipped, stats.chunks.errors
    );
    if let Some(frontier) = stats.frontier {
        println!(
            "  Frontier:   {} visited, {} pending",
            frontier.visited, frontier.pending
        );
    }
    if !stats.document_links.is_empty() {
        println!("  Documents:  {} linked (not downloaded)", stats.document_links.len());
        for link in &stats.document_links {
            println!("    {link}");
        }
    }
    println!("  Time:       {:.1}s", stats.elapsed.as_secs_f64());
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn page_started(&self, url: &str, indexed: usize, budget: usize) {
        self.spinner
            .set_message(format!("Fetching [{indexed}/{budget}] {url}"));
    }

    fn page_finished(&self, url: &str, outcome: &PageOutcome) {
        match outcome {
            PageOutcome::Indexed { report, .. } => self.spinner.set_message(format!(
                "Indexed {url} ({} new chunks)",
                report.inserted
            )),
            PageOutcome::RobotsBlocked => {
                self.spinner.println(format!("  robots.txt  {url}"));
            }
            PageOutcome::Failed { status, error } => {
                self.spinner
                    .println(format!("  failed      {url} ({status}: {error})"));
            }
        }
    }

    fn document_found(&self, url: &str) {
        self.spinner.println(format!("  document    {url}"));
    }

    fn done(&self, _stats: &CrawlStats) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// extract
// ---------------------------------------------------------------------------

fn cmd_extract(config_path: Option<&Path>, file: &Path, url: &str, blocks: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let crawl = CrawlConfig::from(&config);
    let page_url = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    let html = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;

    let page = extractor_for(&crawl)?.extract(&html, &page_url);
    info!(
        layout = %page.layout,
        blocks = page.blocks.len(),
        links = page.links.len(),
        "page extracted"
    );

    let output = if blocks {
        serde_json::to_string_pretty(&page)?
    } else {
        let chunker = SemanticChunker::from(&crawl);
        serde_json::to_string_pretty(&chunker.chunk_blocks(&page.blocks))?
    };
    println!("{output}");
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(
    config_path: Option<&Path>,
    db: Option<&Path>,
    checkpoint: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let crawl = CrawlConfig::from(&config);
    let db_path = db.map_or_else(|| PathBuf::from(&config.storage.db_path), Path::to_path_buf);

    let storage = Storage::open_readonly(&db_path).await?;
    let index = storage.stats().await?;

    let frontier = checkpoint
        .map(Path::to_path_buf)
        .or_else(|| crawl.checkpoint_path.clone())
        .filter(|p| p.exists())
        .map(|p| Frontier::open(p, UrlPolicy::from(&crawl)).stats());

    if json {
        let value = serde_json::json!({
            "database": db_path.display().to_string(),
            "index": index,
            "frontier": frontier,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("  Database:   {}", db_path.display());
    println!("  Documents:  {}", index.documents);
    println!(
        "  Chunks:     {} ({} embedded)",
        index.chunks, index.embedded_chunks
    );
    match frontier {
        Some(f) => println!("  Frontier:   {} visited, {} pending", f.visited, f.pending),
        None => println!("  Frontier:   no checkpoint"),
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
