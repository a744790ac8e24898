//! Error handling for ingestion, QC and caching operations.
//!
//! Errors fall into the classes the pipeline treats differently: parse
//! failures are isolated per file, schema and configuration errors abort a
//! run, and cache lock failures are retriable.

use chrono::NaiveDateTime;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Source directory not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("Failed to parse raw file: {path} - {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Missing required column '{column}' for {context}")]
    MissingColumn { column: String, context: String },

    #[error("Schema error: {reason}")]
    Schema { reason: String },

    #[error("Mask length {found} does not match table length {expected}")]
    MaskLength { expected: usize, found: usize },

    #[error("Cache file is locked or not writable: {path}")]
    CacheLocked {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cache error at {path}: {reason}")]
    Cache { path: PathBuf, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unknown instrument: {name}")]
    UnknownInstrument { name: String },

    #[error("Invalid frequency '{value}'")]
    InvalidFrequency { value: String },

    #[error("Invalid time range: start {start} is after end {end}")]
    InvalidTimeRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("No raw files matching {patterns} in {path}")]
    NoFilesFound { path: PathBuf, patterns: String },

    #[error("All {count} raw files in {path} were empty or failed to parse")]
    NoUsableData { path: PathBuf, count: usize },

    #[error("Run cancelled: {reason}")]
    Cancelled { reason: String },
}

impl QcError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema {
            reason: reason.into(),
        }
    }

    /// Create a parse error for a single raw file
    pub fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Classify a failed cache write.
    ///
    /// Files held open by another process surface as permission or sharing
    /// violations; those become [`QcError::CacheLocked`] so the caller can
    /// retry once the file is released.
    pub fn cache_write(path: &Path, source: io::Error) -> Self {
        let locked = matches!(
            source.kind(),
            io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock
        ) || matches!(source.raw_os_error(), Some(32) | Some(33));

        if locked {
            Self::CacheLocked {
                path: path.to_path_buf(),
                source,
            }
        } else {
            Self::Io(source)
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::CacheLocked { .. })
    }

    /// Whether the error was raised while validating inputs, before any I/O
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::UnknownInstrument { .. }
                | Self::InvalidFrequency { .. }
                | Self::InvalidTimeRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, QcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_retriable() {
        let err = QcError::cache_write(
            Path::new("/tmp/cache.parquet"),
            io::Error::new(io::ErrorKind::PermissionDenied, "locked"),
        );
        assert!(err.is_retriable());
        match err {
            QcError::CacheLocked { path, .. } => {
                assert_eq!(path, PathBuf::from("/tmp/cache.parquet"));
            }
            _ => panic!("Expected CacheLocked error"),
        }
    }

    #[test]
    fn test_other_write_failures_are_not_retriable() {
        let err = QcError::cache_write(
            Path::new("/tmp/cache.parquet"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(!err.is_retriable());
        assert!(matches!(err, QcError::Io(_)));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(QcError::configuration("bad").is_configuration());
        assert!(
            QcError::UnknownInstrument {
                name: "XYZ".to_string()
            }
            .is_configuration()
        );
        assert!(!QcError::schema("missing").is_configuration());
    }
}
