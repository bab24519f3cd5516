//! Error types for the rate-limit core.
//!
//! [`QuotaError`] is the only error type application code should ever match
//! on; it mirrors the caller-visible kinds from the error handling design.
//! Internal reactor/connector failures are folded into [`QuotaError::Internal`]
//! at the boundary rather than leaking connector-private variants outward.

use thiserror::Error;

/// Errors returned from the public [`crate::QuotaManager`] API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// No rule data has been loaded for the service yet (registry miss).
    #[error("rule data for service not loaded")]
    ServiceNotFound,

    /// Rule data was loaded, but nothing matched this request.
    #[error("no rate limit rule matched the request")]
    ResourceNotFound,

    /// A caller-supplied deadline elapsed before a decision could be made.
    #[error("quota decision timed out")]
    Timeout,

    /// The configuration supplied to the manager or a rule is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An argument passed to a public API call was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `UpdateCallResult` arrived for a window that was never allocated against.
    #[error("call result reported before any allocation")]
    NotInit,

    /// Catch-all for reactor/connector-internal failures that reached the
    /// caller (network failure, server error, malformed response).
    #[error("internal rate-limit core error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type QuotaResult<T> = Result<T, QuotaError>;

/// Internal-only failures raised on the reactor thread. These never escape
/// to application code directly; the connector folds them into connection
/// state transitions and, where relevant, a [`QuotaError::Internal`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum ConnectorError {
    #[error("rpc timed out")]
    RpcTimeout,
    #[error("stream closed by remote")]
    RemoteClosed,
    #[error("failed to connect to quota server")]
    ConnectFailed,
    #[error("connect attempt timed out")]
    ConnectTimeout,
    #[error("transport-level error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}
