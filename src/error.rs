//! Error types for the `segload` library.

use std::path::PathBuf;
use thiserror::Error as ThisError;

/// Errors produced by the `segload` library.
#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum Error {
    /// One row of a segment file does not match the strategy.
    #[error("line '{0}' is invalid")]
    BadLine(
        /// The offending line (or a description of the mismatch).
        String,
    ),

    /// A segment file cannot be processed further on the current cluster.
    #[error("segment file '{name}' is invalid: {reason}")]
    InvalidSegmentFile {
        /// Name of the segment file.
        name: String,
        /// Why the file was rejected.
        reason: String,
    },

    /// The strategy references a placeholder without a registered template.
    #[error("template '{0}' is unknown")]
    UnknownTemplate(
        /// The placeholder name.
        String,
    ),

    /// The discovered file's MIME type is outside the strategy's allowed set.
    #[error("type of file '{name}' is '{found}', expected {expected}")]
    WrongFileType {
        /// Name of the file.
        name: String,
        /// Detected MIME type.
        found: String,
        /// Allowed MIME types, `' or '`-joined.
        expected: String,
    },

    /// No valid delivery transport was configured for a provider.
    #[error("there is no known delivery for '{0}', review config")]
    NoAnyDelivery(
        /// The provider name.
        String,
    ),

    /// Invalid human-readable interval such as `30D` or `1D1h`.
    #[error("bad interval format for '{0}'")]
    BadInterval(
        /// The rejected interval string.
        String,
    ),

    /// A collection reference that is not `database.collection`.
    #[error("invalid namespace '{0}', expected exactly 'database.collection'")]
    InvalidNamespace(
        /// The rejected namespace string.
        String,
    ),

    /// The uploading strategy configuration is unusable.
    #[error("invalid strategy: {0}")]
    InvalidStrategy(
        /// Cause of the error.
        String,
    ),

    /// Invalid regex in a strategy, sorter or filename-override config.
    #[error("invalid regex")]
    InvalidRegex(#[from] regex::Error),

    /// Generic IO error.
    #[error("failed to {action} at {path}")]
    Io {
        /// Action causing the error.
        action: &'static str,
        /// File path causing the I/O error.
        path: PathBuf,
        /// Source of error.
        source: std::io::Error,
    },

    /// Failed to parse a YAML configuration file.
    #[error("failed to parse config file {path}")]
    ParseConfig {
        /// Path of the configuration file.
        path: PathBuf,
        /// Source of error.
        source: serde_yaml::Error,
    },

    /// No files were produced within the wait window.
    #[error("reached timeout while waiting for files")]
    Timeout,

    /// A provider was requested which has no `upload` section.
    #[error("provider '{0}' is not configured in section 'upload'")]
    UnknownProvider(
        /// The provider name.
        String,
    ),

    /// A cluster was requested which has no configuration.
    #[error("cannot find config for cluster '{0}'")]
    UnknownCluster(
        /// The cluster name.
        String,
    ),

    /// Error reported by the document store behind a cluster.
    #[error("store error: {0}")]
    Store(
        /// Message from the store.
        String,
    ),

    /// The requested combination of flags and config cannot run.
    #[error("{0}")]
    Usage(
        /// Description of the conflict.
        String,
    ),
}

impl Error {
    /// Shorthand for an [`Error::Io`] with the given action and path.
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Shorthand for an [`Error::InvalidSegmentFile`].
    pub fn invalid_segfile(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSegmentFile {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
