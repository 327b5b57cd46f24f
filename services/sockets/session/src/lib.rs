//! TCP/TLS socket sessions with ordered, flow-controlled events.
//!
//! This crate manages client and accepted socket connections for an
//! application that does not want to own the I/O itself. Each connection is
//! a session with an explicit lifecycle; the application issues commands
//! against session ids and observes everything that happens through one
//! ordered event stream.
//!
//! ## Features
//!
//! - **Session lifecycle**: Connecting, Connected, Closing, Closed and Failed,
//!   with writes queued while connecting and flushed in order once the
//!   `Connected` event has been taken
//! - **Half-close**: a peer FIN emits `End` and the session waits in Closing
//!   for `close` unless `allow_half_open` is turned off
//! - **Event ordering**: per-session sequence numbers; `Closed` is always last
//!   and an `Error` always directly precedes it
//! - **Backpressure**: reads pause when undelivered data reaches the high-water
//!   mark and resume once it drops below the low-water mark
//! - **TLS**: upgrade on connect or later via `start_tls` (rustls)
//! - **Listeners**: accepted connections become sessions in Connected state
//!
//! ## Example
//!
//! ```rust,no_run
//! use sockets_session::{ConnectOptions, EventKind, Notification, SessionConfig, SocketManager};
//!
//! # async fn example() -> Result<(), sockets_session::SocketError> {
//! let (manager, mut events) = SocketManager::tcp(SessionConfig::default())?;
//! let id = manager.open("10.0.0.5", 9000, ConnectOptions::default())?;
//! manager.write(id, "ping")?;
//!
//! while let Some(notification) = events.recv().await {
//!     if let Notification::Session(event) = notification {
//!         match event.kind {
//!             EventKind::Connected { peer_addr, .. } => println!("connected to {:?}", peer_addr),
//!             EventKind::Data(bytes) => println!("received {} bytes", bytes.len()),
//!             EventKind::End => manager.close(id)?,
//!             EventKind::Closed => break,
//!             other => println!("{:?}", other),
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod listener;
pub mod manager;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::{ConnectOptions, ListenOptions, SessionConfig};
pub use dispatcher::EventReceiver;
pub use error::{ErrorKind, SocketError};
pub use event::{
    EventKind, ListenerEvent, ListenerEventKind, ListenerId, Notification, SessionEvent, SessionId,
};
pub use listener::ListenerHandle;
pub use manager::SocketManager;
pub use registry::{normalize_endpoint, SessionRegistry};
pub use session::{SessionHandle, SessionInfo, SessionState, SessionStats};
pub use transport::{
    connect_tcp, listen_tcp, Acceptor, AsyncStream, IoStream, Link, LinkOptions, TcpAcceptor,
    TcpTransport, TlsIdentity, TlsOptions, TlsRole, Transport, TransportError,
};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{make_client_config, make_server_config};
