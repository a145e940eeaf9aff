use std::time::Duration;

use thiserror::Error;

use crate::clock::ListingError;

/// An error that happens when fetching, memoizing or storing a remote artifact.
///
/// Every failure of the fetch layer is classified into one of these variants. The
/// classification drives the retry policy of the fetch worker and the tombstoning of the
/// memoizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The object was not found at the remote source.
    ///
    /// Memoized functions record a tombstone for it.
    #[error("not found")]
    NotFound,
    /// A temporary remote failure, like a 4xx FTP reply or a 5xx HTTP response.
    ///
    /// The attached string contains the remote source's response.
    #[error("temporary failure: {0}")]
    Transient(String),
    /// The connection to the remote source broke down.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// A socket operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The remote source refused access.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The object was transferred, but does not match its announced metadata, or the
    /// remote metadata itself could not be read.
    #[error("corrupt: {0}")]
    Corrupt(String),
    /// The remote source rejected the request for good.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The request itself is invalid, for example an oversized batch.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The job was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected local error, like a failing disk or database.
    ///
    /// The underlying error is logged where it is converted.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<rusqlite::Error> for CacheError {
    #[track_caller]
    fn from(err: rusqlite::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<ListingError> for CacheError {
    fn from(err: ListingError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Whether another attempt may succeed without any intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::ConnectionLost(_) | Self::Timeout(_)
        )
    }

    /// Whether the error ends a job regardless of the remaining attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotFound
                | Self::Permanent(_)
                | Self::InvalidRequest(_)
                | Self::Cancelled
                | Self::InternalError
        )
    }

    /// A short, stable name used for metric tags and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Transient(_) => "transient",
            Self::ConnectionLost(_) => "connectionlost",
            Self::Timeout(_) => "timeout",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Corrupt(_) => "corrupt",
            Self::Permanent(_) => "permanent",
            Self::InvalidRequest(_) => "invalidrequest",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internalerror",
        }
    }
}
