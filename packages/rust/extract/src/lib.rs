//! Layout-aware content extraction for institutional pages.
//!
//! This crate provides:
//! - [`layout`]: the declarative URL → layout rule table and per-layout cleanup selectors
//! - [`clean`]: removal of boilerplate subtrees from an isolated copy of the content region
//! - [`section`]: the heading / pseudo-header context stack
//! - [`blocks`]: the single-pass block extractor producing [`ContentBlock`]s
//!
//! [`ContentBlock`]: harvester_shared::ContentBlock

pub mod blocks;
pub mod clean;
pub mod layout;
pub mod section;

pub use blocks::{BlockExtractor, ExtractedPage, extract_links};
pub use clean::clean_fragment;
pub use layout::{Layout, LayoutMatch, LayoutTable, MatchKind};
pub use section::{FrameKind, PSEUDO_LEVEL, SectionContextBuilder, SectionFrame};
