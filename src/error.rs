//! Crate-level error umbrella.
//!
//! Every component in this crate returns its own narrow error enum; each one
//! converts into [`OlpError`] so the request executor in [`crate::client`] can
//! propagate with `?` regardless of which collaborator failed.

use thiserror::Error;

use crate::cache::CacheError;
use crate::lookup::LookupError;
use crate::token::TokenError;

/// Crate-level result alias.
pub type OlpResult<T> = Result<T, OlpError>;

/// Error kinds surfaced to callers of [`crate::client::OlpClient`].
///
/// Each variant carries the HTTP status that produced it, where applicable,
/// and a human-readable message. `Cancelled` is never folded into another
/// kind: once cooperative cancellation is observed it propagates unchanged.
#[derive(Error, Debug, Clone)]
pub enum OlpError {
    /// Cooperative cancellation reached a checkpoint.
    #[error("operation cancelled")]
    Cancelled,

    /// A per-attempt deadline elapsed before a response was received.
    #[error("request timed out: {message}")]
    RequestTimeout {
        /// Additional detail.
        message: String,
    },

    /// Transport-level failure (connection refused, DNS failure, reset, ...).
    #[error("network error: {message}")]
    NetworkConnection {
        /// Additional detail.
        message: String,
    },

    /// Authentication or authorization was rejected (401/403).
    #[error("access denied (status={status:?}): {message}")]
    AccessDenied {
        /// HTTP status code, if the rejection came from an HTTP response.
        status: Option<u16>,
        /// Additional detail.
        message: String,
    },

    /// The server responded with 5xx, or responded successfully but did not
    /// advertise the requested API.
    #[error("service unavailable (status={status:?}): {message}")]
    ServiceUnavailable {
        /// HTTP status code, if any.
        status: Option<u16>,
        /// Additional detail.
        message: String,
    },

    /// Caller-supplied parameters failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Additional detail.
        message: String,
    },

    /// The call depends on prior state that is absent.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Additional detail.
        message: String,
    },

    /// The requested resource or cache entry is absent.
    #[error("not found: {message}")]
    NotFound {
        /// Additional detail.
        message: String,
    },

    /// The cache rejected a write because it is over its configured budget.
    #[error("cache full: {message}")]
    CacheFull {
        /// Additional detail.
        message: String,
    },

    /// The cache's underlying storage failed.
    #[error("cache I/O error: {message}")]
    CacheIO {
        /// Additional detail.
        message: String,
    },

    /// The on-disk cache path is held exclusively by another process.
    #[error("cache path in use: {message}")]
    PathInUse {
        /// Additional detail.
        message: String,
    },

    /// Unexpected parse failure or invariant violation. Always surfaced.
    #[error("unknown error: {message}")]
    Unknown {
        /// Additional detail.
        message: String,
    },
}

impl OlpError {
    /// The HTTP status that produced this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            OlpError::AccessDenied { status, .. } => *status,
            OlpError::ServiceUnavailable { status, .. } => *status,
            _ => None,
        }
    }

    /// `true` for error kinds the executor's retry loop is allowed to retry
    /// on its own (distinct from a caller-supplied `retry_condition`).
    pub fn is_transport_retryable(&self) -> bool {
        matches!(
            self,
            OlpError::NetworkConnection { .. } | OlpError::RequestTimeout { .. }
        )
    }
}

impl From<CacheError> for OlpError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound => OlpError::NotFound {
                message: "cache entry not found".into(),
            },
            CacheError::CacheFull => OlpError::CacheFull {
                message: "cache over budget".into(),
            },
            CacheError::IoError(message) => OlpError::CacheIO { message },
            CacheError::PathInUse(message) => OlpError::PathInUse { message },
            CacheError::AlreadyOpen => OlpError::Unknown {
                message: "cache already open".into(),
            },
            CacheError::NotOpen => OlpError::Unknown {
                message: "cache not open".into(),
            },
        }
    }
}

impl From<LookupError> for OlpError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NotFound => OlpError::NotFound {
                message: "no cached API lookup entry".into(),
            },
            LookupError::ServiceUnavailable(message) => OlpError::ServiceUnavailable {
                status: None,
                message,
            },
            LookupError::Network(message) => OlpError::NetworkConnection { message },
            LookupError::Cancelled => OlpError::Cancelled,
            LookupError::InvalidResponse(message) => OlpError::Unknown { message },
        }
    }
}

impl From<TokenError> for OlpError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Cancelled => OlpError::Cancelled,
            TokenError::Network(message) => OlpError::NetworkConnection { message },
            TokenError::AccessDenied { status, message } => {
                OlpError::AccessDenied { status, message }
            }
            TokenError::ServiceUnavailable { status, message } => {
                OlpError::ServiceUnavailable { status, message }
            }
            TokenError::InvalidResponse(message) => OlpError::Unknown { message },
        }
    }
}
