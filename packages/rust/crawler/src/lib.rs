//! URL frontier and fetch layer.
//!
//! This crate provides:
//! - [`frontier`]: pending/visited URL tracking with normalization, admission rules and
//!   checkpoint persistence
//! - [`fetch`]: robots.txt-aware HTTP retrieval with bounded retries and backoff

pub mod fetch;
pub mod frontier;
mod robots;

pub use fetch::{FetchPolicy, Fetcher};
pub use frontier::{
    Admission, Frontier, FrontierStats, RejectReason, UrlPolicy, normalize_url,
    normalize_url_with,
};
