//! Error types for qualer-dl
//!
//! This module provides the error taxonomy for the extraction pipeline:
//! - Domain errors for each pipeline stage (authentication, navigation, decoding, writing)
//! - A stable [`ErrorKind`] classification so batch drivers can choose fail-fast or
//!   best-effort handling from `(pair, kind)` alone
//! - Database errors with context about which maintenance step failed

use crate::types::TaskPair;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for qualer-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for qualer-dl
///
/// Only [`Error::TransientRender`] is retried automatically (see [`crate::retry`]).
/// Everything else propagates to the immediate caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fanout.workers")
        key: Option<String>,
    },

    /// Login failed or the login page was unreachable. Fatal for the run.
    #[error("authentication failed: {message}")]
    Authentication {
        /// What went wrong during login
        message: String,
    },

    /// A navigation still landed on the login page after one transparent re-login
    #[error("session expired and re-authentication did not restore access to {url}")]
    SessionExpired {
        /// The URL that kept redirecting to the login page
        url: String,
    },

    /// Content was detached or incomplete when read (race between navigation and extraction)
    #[error("transient render error: {0}")]
    TransientRender(String),

    /// A single navigation exceeded its timeout
    #[error("navigation to {url} timed out after {timeout:?}")]
    NavigationTimeout {
        /// The URL being loaded
        url: String,
        /// The configured navigation timeout
        timeout: Duration,
    },

    /// The payload decoded but did not have the expected structure
    #[error("unexpected response shape from {url}: {message}")]
    Schema {
        /// The URL the payload came from
        url: String,
        /// Which field or shape was missing
        message: String,
    },

    /// The payload was not valid JSON
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        /// The URL the payload came from
        url: String,
        /// Underlying decode error
        #[source]
        source: serde_json::Error,
    },

    /// A sink append failed
    #[error("write to {sink} failed: {message}")]
    Write {
        /// Sink name (file path or table name)
        sink: String,
        /// Reason the write failed
        message: String,
    },

    /// A fetch task ended FAILED and the batch runs fail-fast
    #[error("task {pair} failed: {source}")]
    Task {
        /// The reference id pair the task was fetching
        pair: TaskPair,
        /// The terminal error of the task
        #[source]
        source: Box<Error>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Table or column not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., orphan rows when adding a foreign key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Identifier cannot be used as a table or column name
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// Stable classification of an [`Error`]
///
/// Recorded alongside failed pairs in batch reports so a follow-up pass can decide
/// which pairs are worth re-running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid configuration
    Config,
    /// Bad credentials or unreachable login page
    Authentication,
    /// Re-login did not restore the session
    SessionExpired,
    /// Stale or incomplete content read
    TransientRender,
    /// Navigation timeout
    NavigationTimeout,
    /// Expected JSON field missing
    Schema,
    /// Payload not valid JSON
    Decode,
    /// Sink append failed
    Write,
    /// Database failure outside a sink write
    Database,
    /// Network failure
    Network,
    /// Local I/O failure
    Io,
    /// Anything else
    Other,
}

impl Error {
    /// Classify this error
    ///
    /// [`Error::Task`] reports the kind of the task's underlying error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config { .. } => ErrorKind::Config,
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::SessionExpired { .. } => ErrorKind::SessionExpired,
            Error::TransientRender(_) => ErrorKind::TransientRender,
            Error::NavigationTimeout { .. } => ErrorKind::NavigationTimeout,
            Error::Schema { .. } => ErrorKind::Schema,
            Error::Decode { .. } => ErrorKind::Decode,
            Error::Write { .. } => ErrorKind::Write,
            Error::Task { source, .. } => source.kind(),
            Error::Database(_) => ErrorKind::Database,
            Error::Network(_) => ErrorKind::Network,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) | Error::Other(_) => ErrorKind::Other,
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Whether the process should stop outright (as opposed to failing one task)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Authentication | ErrorKind::Config | ErrorKind::NavigationTimeout
        )
    }

    /// Shorthand for a [`Error::Schema`]
    pub(crate) fn schema(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Schema {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`Error::Write`]
    pub(crate) fn write(sink: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Write {
            sink: sink.into(),
            message: message.to_string(),
        }
    }
}

impl ErrorKind {
    /// Machine-readable error code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config_error",
            ErrorKind::Authentication => "authentication_failed",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::TransientRender => "transient_render",
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::Schema => "schema_error",
            ErrorKind::Decode => "decode_error",
            ErrorKind::Write => "write_error",
            ErrorKind::Database => "database_error",
            ErrorKind::Network => "network_error",
            ErrorKind::Io => "io_error",
            ErrorKind::Other => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
