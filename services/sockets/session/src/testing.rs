//! Scripted transport for driving sessions without real sockets.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::oneshot;

use crate::dispatcher::EventReceiver;
use crate::event::{EventKind, ListenerEvent, Notification, SessionEvent, SessionId};
use crate::transport::{
    Acceptor, IoStream, Link, LinkOptions, TlsOptions, Transport, TransportError,
};

pub(crate) const LOCAL: &str = "10.0.0.1:50000";

pub(crate) enum ConnectScript {
    Accept(DuplexStream),
    Gated(oneshot::Receiver<()>, DuplexStream),
    Refuse,
    Hang,
    Failing,
}

pub(crate) enum TlsScript {
    Succeed,
    Fail,
    Gated(oneshot::Receiver<bool>),
}

/// Transport whose connects and handshakes follow a script
#[derive(Default)]
pub(crate) struct MockTransport {
    connects: Mutex<VecDeque<ConnectScript>>,
    handshakes: Mutex<VecDeque<TlsScript>>,
    pub(crate) tls_attempts: AtomicUsize,
    pub(crate) dialed: Mutex<Vec<(String, u16)>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, script: ConnectScript) {
        self.connects.lock().unwrap().push_back(script);
    }

    pub(crate) fn script_tls(&self, script: TlsScript) {
        self.handshakes.lock().unwrap().push_back(script);
    }

    /// Next connect succeeds; returns the remote end
    pub(crate) fn accept(&self) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        self.script(ConnectScript::Accept(ours));
        theirs
    }

    /// Next connect succeeds once the returned sender fires
    pub(crate) fn gated(&self) -> (oneshot::Sender<()>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = oneshot::channel();
        self.script(ConnectScript::Gated(rx, ours));
        (tx, theirs)
    }

    pub(crate) fn hang(&self) {
        self.script(ConnectScript::Hang);
    }

    pub(crate) fn tls_attempts(&self) -> usize {
        self.tls_attempts.load(Ordering::SeqCst)
    }
}

fn link(stream: IoStream, host: &str, port: u16) -> Link {
    Link {
        stream,
        local_addr: LOCAL.parse().ok(),
        peer_addr: format!("{}:{}", host, port).parse::<SocketAddr>().ok(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _options: &LinkOptions,
    ) -> Result<Link, TransportError> {
        self.dialed.lock().unwrap().push((host.to_string(), port));
        let script = self.connects.lock().unwrap().pop_front();
        match script {
            Some(ConnectScript::Accept(stream)) => Ok(link(IoStream::boxed(stream), host, port)),
            Some(ConnectScript::Gated(gate, stream)) => {
                let _ = gate.await;
                Ok(link(IoStream::boxed(stream), host, port))
            }
            Some(ConnectScript::Hang) => std::future::pending::<Result<Link, TransportError>>().await,
            Some(ConnectScript::Failing) => Ok(link(IoStream::boxed(FailingStream), host, port)),
            Some(ConnectScript::Refuse) | None => Err(TransportError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
        }
    }

    async fn bind(
        &self,
        _host: &str,
        _port: u16,
        _backlog: u32,
        _options: &LinkOptions,
    ) -> Result<Box<dyn Acceptor>, TransportError> {
        Err(TransportError::Unsupported("scripted transport cannot listen"))
    }

    async fn upgrade_tls(
        &self,
        stream: IoStream,
        _options: &TlsOptions,
    ) -> Result<IoStream, TransportError> {
        self.tls_attempts.fetch_add(1, Ordering::SeqCst);
        let script = self.handshakes.lock().unwrap().pop_front();
        let succeed = match script {
            Some(TlsScript::Succeed) | None => true,
            Some(TlsScript::Fail) => false,
            Some(TlsScript::Gated(gate)) => gate.await.unwrap_or(false),
        };
        if succeed {
            Ok(stream)
        } else {
            Err(TransportError::Tls(
                "handshake failure: certificate verify failed".to_string(),
            ))
        }
    }
}

/// Stream whose reads fail with a reset
pub(crate) struct FailingStream;

impl AsyncRead for FailingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

impl AsyncWrite for FailingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

const WAIT: Duration = Duration::from_secs(10);

pub(crate) async fn next(events: &mut EventReceiver) -> Notification {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("event stream ended")
}

pub(crate) async fn next_session(events: &mut EventReceiver) -> SessionEvent {
    loop {
        if let Notification::Session(event) = next(events).await {
            return event;
        }
    }
}

pub(crate) async fn next_listener(events: &mut EventReceiver) -> ListenerEvent {
    loop {
        if let Notification::Listener(event) = next(events).await {
            return event;
        }
    }
}

/// Collect one session's events up to and including Closed
pub(crate) async fn until_closed(events: &mut EventReceiver, id: SessionId) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_session(events).await;
        if event.session_id != id {
            continue;
        }
        let closed = event.kind == EventKind::Closed;
        seen.push(event);
        if closed {
            return seen;
        }
    }
}

pub(crate) fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

pub(crate) fn data(events: &[SessionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Data(bytes) => Some(bytes.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}
