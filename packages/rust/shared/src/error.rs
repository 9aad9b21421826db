//! Failures that can stop a harvest step.
//!
//! Page-level problems (HTTP statuses, robots refusals, dropped table rows) are data, not
//! errors: they travel inside `FetchResult` and the crawl statistics. [`HarvestError`] is
//! reserved for what a caller has to act on. The CLI reports it through `color-eyre`.

use std::fmt::Display;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Unusable `harvester.toml`, environment override or CLI flag.
    #[error("config error: {message}")]
    Config { message: String },

    /// A remote endpoint could not be reached or the client could not be built.
    /// `target` names the host, URL or component involved.
    #[error("network error ({target}): {message}")]
    Network { target: String, message: String },

    /// Layout rules, checkpoint JSON or page markup that does not parse.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The chunk index rejected a read or write.
    #[error("storage error: {0}")]
    Storage(String),

    /// The embedding endpoint answered with an error status or an unexpected payload.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Reading or writing a checkpoint, config or input file.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input that parsed but makes no sense, such as a layout rule naming an unknown layout.
    #[error("validation error: {message}")]
    Validation { message: String },
}

pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Transport failure talking to `target`.
    pub fn network(target: impl Into<String>, err: impl Display) -> Self {
        Self::Network {
            target: target.into(),
            message: err.to_string(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    pub fn storage(err: impl Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Attach the path that failed to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = HarvestError::config("missing seeds");
        assert_eq!(err.to_string(), "config error: missing seeds");

        let err = HarvestError::validation("unknown layout 'nope' in rule 3");
        assert!(err.to_string().contains("rule 3"));

        let err = HarvestError::io(
            "/tmp/checkpoint.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("checkpoint.json"));
    }

    #[test]
    fn network_errors_name_their_target() {
        let err = HarvestError::network("https://www.gov.br/inep", "connection refused");
        assert_eq!(
            err.to_string(),
            "network error (https://www.gov.br/inep): connection refused"
        );
        assert!(matches!(
            err,
            HarvestError::Network { ref target, .. } if target == "https://www.gov.br/inep"
        ));
    }

    #[test]
    fn storage_and_embedding_helpers_keep_the_message() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only database");
        let err = HarvestError::storage(io);
        assert_eq!(err.to_string(), "storage error: read-only database");

        let err = HarvestError::embedding("expected 2 vectors, got 1");
        assert!(matches!(err, HarvestError::Embedding(ref m) if m.contains("2 vectors")));
    }
}
