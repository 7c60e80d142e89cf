use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::reference::ArtifactKind;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Unified error across the charm repositories.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{message}")]
    NotFound { message: String },

    #[error("expected a {expected} URL, got {} URL {url:?}", .expected.other())]
    TypeMismatch { expected: ArtifactKind, url: String },

    #[error("no series specified for {url}")]
    MissingSeries { url: String },

    #[error(
        "series {requested:?} not supported by charm, supported series are: {}",
        .supported.join(",")
    )]
    UnsupportedSeries {
        requested: String,
        supported: Vec<String>,
    },

    #[error("size mismatch; network corruption? (expected {expected} bytes, read {actual})")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch; network corruption? (expected {expected}, computed {actual})")]
    HashMismatch { expected: String, actual: String },

    #[error("{context}: {}", .path.display())]
    CacheUnavailable {
        context: String,
        path: PathBuf,
        #[source]
        source: Option<io::Error>,
    },

    #[error("{context}")]
    Transport {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid charm or bundle URL {url:?}: {reason}")]
    InvalidReference { url: String, reason: String },

    #[error("cannot read {kind} from {}: {reason}", .path.display())]
    InvalidArtifact {
        kind: ArtifactKind,
        path: PathBuf,
        reason: String,
    },

    #[error("{operation} is not supported by the {backend} repository")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    #[error("configuration error: {reason}")]
    Config { reason: String },
}

/// Result alias for repository operations.
pub type Result<T> = std::result::Result<T, RepoError>;

impl RepoError {
    pub(crate) fn transport(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            context: context.into(),
            source: source.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for the post-download size and hash checks.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::SizeMismatch { .. } | Self::HashMismatch { .. })
    }
}
