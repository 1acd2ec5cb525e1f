//! Error types for the refpack-core library.
//!
//! Each failure kind maps to the unit of work it aborts: a single source file,
//! a single module's packaging step, a single archive, or a whole
//! configuration run (see [`Error::is_recoverable`]).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for refpack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all refpack operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Source file does not carry module metadata
    #[error("'{path}' is not a valid module: {reason}")]
    InvalidModule {
        /// Path of the rejected source file
        path: PathBuf,
        /// Why the validity probe failed
        reason: String,
    },

    /// Module image could not be decoded or is structurally inconsistent
    #[error("malformed module image: {0}")]
    Malformed(String),

    /// Stripping or re-serialization could not produce an output module
    #[error("failed to create reference module for '{path}': {source}")]
    StripFailure {
        /// Source file being stripped
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// A version string or version merge is unusable
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion {
        /// The offending version, as text
        version: String,
        /// What is wrong with it
        reason: String,
    },

    /// An archive could not be written
    #[error("failed to write package '{path}': {reason}")]
    PackageWrite {
        /// Target archive path
        path: PathBuf,
        /// Underlying cause, rendered
        reason: String,
    },

    /// A package feed rejected an archive or was unreachable
    #[error("failed to publish '{path}' to {destination}: {reason}")]
    Publish {
        /// Archive that was being published
        path: PathBuf,
        /// Feed address
        destination: String,
        /// Underlying cause, rendered
        reason: String,
    },

    /// Output directories could not be prepared
    #[error("failed to prepare output directory '{path}': {source}")]
    Setup {
        /// Directory that could not be created or cleaned
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new invalid module error
    pub fn invalid_module(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidModule {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new malformed image error
    pub fn malformed(details: impl Into<String>) -> Self {
        Self::Malformed(details.into())
    }

    /// Wraps `source` as the cause of a failed strip of `path`
    pub fn strip_failure(path: impl Into<PathBuf>, source: Error) -> Self {
        Self::StripFailure {
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Creates a new invalid version error
    pub fn invalid_version(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVersion {
            version: version.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new package write error
    pub fn package_write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::PackageWrite {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new publish error
    pub fn publish(
        path: impl Into<PathBuf>,
        destination: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Publish {
            path: path.into(),
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new setup error
    pub fn setup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Setup {
            path: path.into(),
            source,
        }
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error only affects the current item of work
    ///
    /// Everything except [`Error::Setup`] is recovered at module or archive
    /// granularity; a setup failure aborts the current configuration.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Setup { .. })
    }
}
