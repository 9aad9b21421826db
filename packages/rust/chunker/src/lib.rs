//! Block → chunk conversion.
//!
//! This crate provides:
//! - [`table`]: row-wise table-to-entity conversion with templated sentence rendering
//! - [`split`]: a recursive separator-driven text splitter with overlap
//! - [`chunker`]: the [`SemanticChunker`] mapping every block variant to content-addressed chunks

pub mod chunker;
pub mod split;
pub mod table;

pub use chunker::{SemanticChunker, chunk_hash};
pub use split::TextSplitter;
pub use table::{EntityKind, TableEntity, TableProcessor};
