use thiserror::Error;

/// Errors surfaced by filesystem calls and connection management.
///
/// `NoConnection` and `Reset` are transient: callers are expected to retry
/// once the connection is re-established. `Remote` carries the server's
/// error code verbatim and should be treated as a reportable failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    /// No data channel is currently bound.
    #[error("no connection")]
    NoConnection,

    /// The channel was lost while the request was in flight.
    #[error("reset")]
    Reset,

    /// A control-channel RPC did not complete within its window.
    #[error("timeout")]
    Timeout,

    /// Programmer error, e.g. connecting an already-connected session.
    #[error("invalid operation")]
    InvalidOperation,

    /// Server-reported failure, passed through verbatim.
    #[error("remote error: {0}")]
    Remote(String),

    /// Malformed frame or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The caller cancelled the operation before dispatch.
    #[error("aborted")]
    Aborted,
}

impl FsError {
    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }
}
