//! Consumer-facing event records.

use crate::error::SocketError;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// Opaque session identifier, never reused within one manager
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listener identifier
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened on a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Outbound connect completed
    Connected {
        /// Local endpoint, if the transport knows it
        local_addr: Option<SocketAddr>,
        /// Remote endpoint, if the transport knows it
        peer_addr: Option<SocketAddr>,
    },
    /// Bytes received, in arrival order
    Data(Bytes),
    /// TLS upgrade completed; further I/O is encrypted
    Secured,
    /// Peer half-closed its side of the connection
    End,
    /// Asynchronous failure; always immediately followed by `Closed`
    Error(SocketError),
    /// Final event of the session
    Closed,
}

impl EventKind {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Connected { .. } => "connected",
            EventKind::Data(_) => "data",
            EventKind::Secured => "secured",
            EventKind::End => "end",
            EventKind::Error(_) => "error",
            EventKind::Closed => "closed",
        }
    }
}

/// One ordered event of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    /// Session the event belongs to
    pub session_id: SessionId,
    /// Strictly increasing per session, starting at 1
    pub sequence: u64,
    /// Event payload
    pub kind: EventKind,
}

/// What happened on a listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerEventKind {
    /// Bound and accepting
    Listening {
        /// Bound address
        local_addr: Option<SocketAddr>,
    },
    /// Inbound connection accepted as a new session
    Connection {
        /// Session created for the connection
        session_id: SessionId,
        /// Remote endpoint
        peer_addr: Option<SocketAddr>,
    },
    /// Accept failed; the listener keeps accepting
    Error(SocketError),
    /// Listener stopped accepting
    Closed,
}

/// One listener notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerEvent {
    /// Listener the notification belongs to
    pub listener_id: ListenerId,
    /// Notification payload
    pub kind: ListenerEventKind,
}

/// Item of the consumer stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// Session event
    Session(SessionEvent),
    /// Listener notification
    Listener(ListenerEvent),
}

impl Notification {
    /// Session event, if this is one
    pub fn as_session(&self) -> Option<&SessionEvent> {
        match self {
            Notification::Session(event) => Some(event),
            Notification::Listener(_) => None,
        }
    }

    /// Listener notification, if this is one
    pub fn as_listener(&self) -> Option<&ListenerEvent> {
        match self {
            Notification::Session(_) => None,
            Notification::Listener(event) => Some(event),
        }
    }
}
