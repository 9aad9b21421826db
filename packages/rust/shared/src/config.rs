//! Application configuration for Harvester.
//!
//! User config lives at `~/.harvester/harvester.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "harvester.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".harvester";

/// User agent sent with every request unless overridden.
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Harvester/",
    env!("CARGO_PKG_VERSION"),
    " (Educational Research Bot)"
);

// ---------------------------------------------------------------------------
// Config structs (matching harvester.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Crawl scope, politeness and retry settings.
    #[serde(default)]
    pub crawl: CrawlSection,

    /// Text splitting settings.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Local database settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding service settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    /// Starting URLs added to the frontier on every run.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Only URLs on this host (ignoring a leading `www.`) are admitted.
    #[serde(default = "default_domain_filter")]
    pub domain_filter: Option<String>,

    /// Successful pages processed before the run stops.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Politeness delay after each successful page, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Retries after the first attempt for transport failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exponential backoff base.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Backoff unit in milliseconds (wait = unit * factor^attempt).
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether to respect robots.txt.
    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,

    /// User agent for page and robots.txt requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Hosts fetched without certificate verification.
    #[serde(default = "default_insecure_hosts")]
    pub insecure_hosts: Vec<String>,

    /// File extensions admitted by the frontier (without the dot).
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Frontier checkpoint file.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,

    /// Number of cooperative crawl workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Rewrite `http://` URLs to `https://` during normalization.
    #[serde(default = "default_true")]
    pub upgrade_to_https: bool,

    /// Optional TOML file replacing the built-in layout rule table.
    #[serde(default)]
    pub layout_rules: Option<String>,

    /// Source label stored with every document.
    #[serde(default = "default_source_type")]
    pub source_type: String,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            domain_filter: default_domain_filter(),
            max_pages: default_max_pages(),
            delay_ms: default_delay_ms(),
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            backoff_unit_ms: default_backoff_unit_ms(),
            timeout_secs: default_timeout_secs(),
            respect_robots_txt: true,
            user_agent: default_user_agent(),
            insecure_hosts: default_insecure_hosts(),
            allowed_extensions: default_allowed_extensions(),
            checkpoint_path: default_checkpoint_path(),
            concurrency: default_concurrency(),
            upgrade_to_https: true,
            layout_rules: None,
            source_type: default_source_type(),
        }
    }
}

fn default_domain_filter() -> Option<String> {
    Some("inep.gov.br".into())
}
fn default_max_pages() -> usize {
    200
}
fn default_delay_ms() -> u64 {
    1500
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_unit_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.into()
}
fn default_insecure_hosts() -> Vec<String> {
    [
        "inep.gov.br",
        "www.inep.gov.br",
        "gov.br",
        "www.gov.br",
        "mec.gov.br",
        "www.mec.gov.br",
        "ifpi.edu.br",
        "www.ifpi.edu.br",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_allowed_extensions() -> Vec<String> {
    ["doc", "docx", "pdf", "rar", "zip"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_checkpoint_path() -> String {
    "data/checkpoint.json".into()
}
fn default_concurrency() -> usize {
    1
}
fn default_source_type() -> String {
    "institutional_page".into()
}

/// `[chunking]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks of one block.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    900
}
fn default_chunk_overlap() -> usize {
    150
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the local libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "data/harvester.db".into()
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Compute embeddings for new chunks.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Feature-extraction endpoint.
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    /// Model identifier stored alongside each vector.
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,

    /// Texts sent per request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Wait before the single retry after a 503 (model loading).
    #[serde(default = "default_cold_start_wait_secs")]
    pub cold_start_wait_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            api_key_env: default_embedding_key_env(),
            batch_size: default_batch_size(),
            cold_start_wait_secs: default_cold_start_wait_secs(),
        }
    }
}

fn default_embedding_endpoint() -> String {
    "https://router.huggingface.co/hf-inference/models/intfloat/multilingual-e5-large/pipeline/feature-extraction".into()
}
fn default_embedding_model() -> String {
    "intfloat/multilingual-e5-large".into()
}
fn default_embedding_key_env() -> String {
    "HF_TOKEN".into()
}
fn default_batch_size() -> usize {
    32
}
fn default_cold_start_wait_secs() -> u64 {
    20
}

// ---------------------------------------------------------------------------
// Crawl config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub seeds: Vec<String>,
    pub domain_filter: Option<String>,
    pub max_pages: usize,
    pub delay: Duration,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub backoff_unit: Duration,
    pub timeout: Duration,
    pub respect_robots_txt: bool,
    pub user_agent: String,
    pub insecure_hosts: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub checkpoint_path: Option<PathBuf>,
    pub concurrency: usize,
    pub upgrade_to_https: bool,
    pub layout_rules: Option<PathBuf>,
    pub source_type: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        let crawl = &config.crawl;
        Self {
            seeds: crawl.seeds.clone(),
            domain_filter: crawl.domain_filter.clone(),
            max_pages: crawl.max_pages,
            delay: Duration::from_millis(crawl.delay_ms),
            max_retries: crawl.max_retries,
            backoff_factor: crawl.backoff_factor,
            backoff_unit: Duration::from_millis(crawl.backoff_unit_ms),
            timeout: Duration::from_secs(crawl.timeout_secs),
            respect_robots_txt: crawl.respect_robots_txt,
            user_agent: crawl.user_agent.clone(),
            insecure_hosts: crawl.insecure_hosts.clone(),
            allowed_extensions: crawl.allowed_extensions.clone(),
            checkpoint_path: Some(PathBuf::from(&crawl.checkpoint_path)),
            concurrency: crawl.concurrency.max(1),
            upgrade_to_https: crawl.upgrade_to_https,
            layout_rules: crawl.layout_rules.as_ref().map(PathBuf::from),
            source_type: crawl.source_type.clone(),
            chunk_size: config.chunking.chunk_size,
            chunk_overlap: config.chunking.chunk_overlap,
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.harvester/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.harvester/harvester.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
