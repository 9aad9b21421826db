//! Shared types, error model, and configuration for Harvester.
//!
//! This crate is the foundation depended on by all other Harvester crates.
//! It provides:
//! - [`HarvestError`]: the unified error type
//! - Domain types ([`FetchResult`], [`ContentBlock`], [`SemanticChunk`], [`SourceDocument`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ChunkingConfig, CrawlConfig, CrawlSection, EmbeddingConfig, StorageConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{HarvestError, Result};
pub use types::{
    BlockKind, ChunkMetadata, ChunkType, Confidence, ContentBlock, ContextSnapshot, FetchResult,
    OrderedMap, SemanticChunk, SourceDocument, SourceType, TableSummary,
};
