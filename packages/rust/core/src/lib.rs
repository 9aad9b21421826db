//! Pipeline orchestration for Harvester.
//!
//! This crate ties the frontier, fetcher, block extractor and chunker into one crawl
//! loop, and persists its output through a [`PageSink`]:
//! - [`pipeline`]: the worker loop, progress reporting and run statistics
//! - [`sink`]: persistence into libSQL storage
//! - [`embed`]: passage/query embedding over HTTP

pub mod embed;
pub mod pipeline;
pub mod sink;

pub use embed::{EmbedMode, Embedder, HttpEmbedder};
pub use pipeline::{
    CrawlStats, PageOutcome, Pipeline, ProgressReporter, SilentProgress, StopReason,
    document_links,
};
pub use sink::{IndexSink, InsertReport, PageSink};
