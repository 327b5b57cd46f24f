//! Error taxonomy for socket sessions.
//!
//! Errors fall into two groups. Argument, state and capacity errors are
//! returned synchronously to the caller of the offending command and never
//! produce an event. Connect, TLS and transport errors are reported
//! asynchronously as an `Error` event followed by `Closed`.

use crate::event::{ListenerId, SessionId};
use crate::session::SessionState;
use thiserror::Error;

/// Classification of a [`SocketError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad address/port, unknown id or other programming misuse
    InvalidArgument,
    /// Connection refused, unreachable host or connect timeout
    ConnectFailure,
    /// TLS handshake or certificate failure
    TlsFailure,
    /// Reset or I/O fault on an established connection
    TransportError,
    /// Operation not valid for the current session state
    StateError,
    /// Configured hard cap exceeded
    CapacityError,
}

/// Errors surfaced by the session manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Malformed argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No live session with this id
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// No active listener with this id
    #[error("unknown listener {0}")]
    UnknownListener(ListenerId),

    /// Connect attempt failed or timed out
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    /// TLS handshake failed
    #[error("tls failure: {0}")]
    TlsFailure(String),

    /// I/O failure on an established connection
    #[error("transport error: {0}")]
    Transport(String),

    /// Command rejected because of the session state
    #[error("{operation} not allowed: {reason} (state {state:?})")]
    State {
        /// Rejected command
        operation: &'static str,
        /// State the session was in
        state: SessionState,
        /// Short explanation
        reason: &'static str,
    },

    /// Hard cap exceeded
    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

impl SocketError {
    /// Taxonomy bucket of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SocketError::InvalidArgument(_)
            | SocketError::UnknownSession(_)
            | SocketError::UnknownListener(_) => ErrorKind::InvalidArgument,
            SocketError::ConnectFailure(_) => ErrorKind::ConnectFailure,
            SocketError::TlsFailure(_) => ErrorKind::TlsFailure,
            SocketError::Transport(_) => ErrorKind::TransportError,
            SocketError::State { .. } => ErrorKind::StateError,
            SocketError::Capacity(_) => ErrorKind::CapacityError,
        }
    }

    /// Whether this error is delivered as an event rather than returned
    pub fn is_asynchronous(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectFailure | ErrorKind::TlsFailure | ErrorKind::TransportError
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SocketError::InvalidArgument(msg.into())
    }
}
