//! URL frontier: normalization, admission rules, pending/visited sets and checkpointing.
//!
//! A normalized URL is either pending or visited, never both. Popping removes the URL from
//! the pending set under the frontier lock, so each pending URL is handed out exactly once.
//! Checkpoint writes happen under the same lock, which serializes them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use harvester_shared::{CrawlConfig, HarvestError, Result};

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Canonical form used for deduplication: `https`, lowercase host without `www.`,
/// no trailing slash (except the root path), query kept, fragment dropped.
///
/// Input that does not parse as an absolute URL is returned trimmed.
pub fn normalize_url(raw: &str) -> String {
    normalize_url_with(raw, true)
}

/// Same as [`normalize_url`], with the `http` -> `https` upgrade made optional.
pub fn normalize_url_with(raw: &str, upgrade_to_https: bool) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    if upgrade_to_https && url.scheme() == "http" {
        let _ = url.set_scheme("https");
    }

    if let Some(stripped) = url.host_str().and_then(|h| h.strip_prefix("www.")) {
        let stripped = stripped.to_string();
        let _ = url.set_host(Some(&stripped));
    }

    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(if path.is_empty() { "/" } else { path.as_str() });

    url.to_string()
}

// ---------------------------------------------------------------------------
// Admission rules
// ---------------------------------------------------------------------------

/// Why a URL was refused by the frontier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("not an absolute URL")]
    Malformed,
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("missing host")]
    MissingHost,
    #[error("URL carries a fragment")]
    Fragment,
    #[error("URL contains '@'")]
    AtSign,
    #[error("host '{0}' is outside the crawl domain")]
    OutsideDomain(String),
    #[error("extension '{0}' is not allowed")]
    Extension(String),
}

/// Admission rules applied to every URL entering the frontier.
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    /// Host (compared without `www.`) every URL must match.
    pub domain_filter: Option<String>,
    /// Extensions (without the dot) accepted when the last path segment has one.
    pub allowed_extensions: Vec<String>,
    /// Whether normalization upgrades `http` to `https`.
    pub upgrade_to_https: bool,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self::from(&CrawlConfig::default())
    }
}

impl From<&CrawlConfig> for UrlPolicy {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            domain_filter: config.domain_filter.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            upgrade_to_https: config.upgrade_to_https,
        }
    }
}

impl UrlPolicy {
    /// Check a raw URL against the admission rules.
    pub fn check(&self, raw: &str) -> std::result::Result<(), RejectReason> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|_| RejectReason::Malformed)?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RejectReason::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
            _ => return Err(RejectReason::MissingHost),
        };

        if url.fragment().is_some() {
            return Err(RejectReason::Fragment);
        }

        if raw.contains('@') {
            return Err(RejectReason::AtSign);
        }

        if let Some(filter) = &self.domain_filter {
            let wanted = filter.trim().to_ascii_lowercase();
            let wanted = wanted.strip_prefix("www.").unwrap_or(&wanted);
            let actual = host.strip_prefix("www.").unwrap_or(&host);
            if actual != wanted {
                return Err(RejectReason::OutsideDomain(host));
            }
        }

        let last_segment = url.path().rsplit('/').next().unwrap_or("");
        if let Some((_, ext)) = last_segment.rsplit_once('.') {
            let ext = ext.to_ascii_lowercase();
            if !self.allowed_extensions.iter().any(|a| *a == ext) {
                return Err(RejectReason::Extension(ext));
            }
        }

        Ok(())
    }

    pub fn normalize(&self, raw: &str) -> String {
        normalize_url_with(raw, self.upgrade_to_https)
    }
}

// ---------------------------------------------------------------------------
// Frontier
// ---------------------------------------------------------------------------

/// Result of offering a URL to the frontier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Queued,
    AlreadyPending,
    AlreadyVisited,
    Rejected(RejectReason),
}

/// Counts reported by [`Frontier::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrontierStats {
    pub visited: usize,
    pub pending: usize,
    pub total: usize,
}

/// On-disk checkpoint format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    #[serde(default)]
    visited_urls: Vec<String>,
    #[serde(default)]
    pending_urls: Vec<String>,
}

#[derive(Debug, Default)]
struct FrontierState {
    visited: BTreeSet<String>,
    pending: BTreeSet<String>,
}

/// Thread-safe set of pending and visited URLs with optional checkpoint persistence.
///
/// Pending URLs are popped in lexicographic order. Callers must not rely on it.
#[derive(Debug)]
pub struct Frontier {
    state: Mutex<FrontierState>,
    checkpoint_path: Option<PathBuf>,
    policy: UrlPolicy,
}

impl Frontier {
    /// A frontier that never touches the filesystem.
    pub fn in_memory(policy: UrlPolicy) -> Self {
        Self {
            state: Mutex::new(FrontierState::default()),
            checkpoint_path: None,
            policy,
        }
    }

    /// Open a frontier backed by `path`, loading it when present.
    ///
    /// A missing or unreadable checkpoint yields an empty frontier.
    pub fn open(path: impl Into<PathBuf>, policy: UrlPolicy) -> Self {
        let path = path.into();
        let state = match load_checkpoint(&path) {
            Ok(Some(state)) => {
                info!(
                    path = %path.display(),
                    visited = state.visited.len(),
                    pending = state.pending.len(),
                    "checkpoint loaded"
                );
                state
            }
            Ok(None) => {
                debug!(path = %path.display(), "no checkpoint, starting empty");
                FrontierState::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting empty");
                FrontierState::default()
            }
        };

        Self {
            state: Mutex::new(state),
            checkpoint_path: Some(path),
            policy,
        }
    }

    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    /// Offer each seed; returns how many were queued.
    pub fn add_seeds<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        urls.into_iter()
            .filter(|u| {
                let admission = self.add_pending(u.as_ref());
                if let Admission::Rejected(reason) = &admission {
                    warn!(url = u.as_ref(), %reason, "seed rejected");
                }
                admission == Admission::Queued
            })
            .count()
    }

    /// Normalize, validate and queue a URL.
    pub fn add_pending(&self, url: &str) -> Admission {
        if let Err(reason) = self.policy.check(url) {
            return Admission::Rejected(reason);
        }
        let normalized = self.policy.normalize(url);

        let mut state = self.lock();
        if state.visited.contains(&normalized) {
            Admission::AlreadyVisited
        } else if state.pending.insert(normalized) {
            Admission::Queued
        } else {
            Admission::AlreadyPending
        }
    }

    /// Remove and return one pending URL.
    pub fn pop_next(&self) -> Option<String> {
        self.lock().pending.pop_first()
    }

    /// Record `url` as visited and persist the frontier before returning.
    ///
    /// A failed write is logged; the next visit rewrites the full state.
    pub fn mark_visited(&self, url: &str) {
        let normalized = self.policy.normalize(url);
        let mut state = self.lock();
        state.pending.remove(&normalized);
        state.visited.insert(normalized);

        if let Some(path) = &self.checkpoint_path {
            if let Err(e) = save_checkpoint(path, &state) {
                warn!(path = %path.display(), error = %e, "failed to write checkpoint");
            }
        }
    }

    pub fn is_visited(&self, url: &str) -> bool {
        self.lock().visited.contains(&self.policy.normalize(url))
    }

    pub fn stats(&self) -> FrontierStats {
        let state = self.lock();
        FrontierStats {
            visited: state.visited.len(),
            pending: state.pending.len(),
            total: state.visited.len() + state.pending.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint I/O
// ---------------------------------------------------------------------------

fn load_checkpoint(path: &Path) -> Result<Option<FrontierState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;
    let checkpoint: Checkpoint = serde_json::from_str(&content)
        .map_err(|e| HarvestError::parse(format!("checkpoint {}: {e}", path.display())))?;

    let visited: BTreeSet<String> = checkpoint.visited_urls.into_iter().collect();
    let pending = checkpoint
        .pending_urls
        .into_iter()
        .filter(|u| !visited.contains(u))
        .collect();

    Ok(Some(FrontierState { visited, pending }))
}

/// Write to a sibling temp file, then rename over the checkpoint.
fn save_checkpoint(path: &Path, state: &FrontierState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
    }

    let checkpoint = Checkpoint {
        visited_urls: state.visited.iter().cloned().collect(),
        pending_urls: state.pending.iter().cloned().collect(),
    };
    let content = serde_json::to_string_pretty(&checkpoint)
        .map_err(|e| HarvestError::parse(e.to_string()))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content).map_err(|e| HarvestError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| HarvestError::io(path, e))?;
    Ok(())
}
