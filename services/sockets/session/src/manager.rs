//! Command facade over the session registry and listeners
//!
//! [`SocketManager`] is what an application holds: it validates commands,
//! forwards them to the owning session and hands out the single
//! [`EventReceiver`] through which every session and listener reports back.

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::{ConnectOptions, ListenOptions, SessionConfig};
use crate::dispatcher::{EventDispatcher, EventReceiver};
use crate::error::SocketError;
use crate::event::{ListenerId, SessionId};
use crate::listener::{self, ListenerHandle};
use crate::registry::SessionRegistry;
use crate::session::SessionInfo;
use crate::transport::{TcpTransport, TlsOptions, Transport};

/// Entry point for opening, accepting and driving socket sessions
pub struct SocketManager {
    registry: Arc<SessionRegistry>,
    listeners: DashMap<ListenerId, Arc<ListenerHandle>>,
    next_listener: AtomicU64,
}

impl SocketManager {
    /// Create a manager over `transport`, returning it with its event stream
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, EventReceiver), SocketError> {
        config.validate()?;
        info!(
            "Creating socket manager (high water {} bytes, low water {} bytes, half-open {})",
            config.high_water, config.low_water, config.allow_half_open
        );

        let (dispatcher, rx) = EventDispatcher::new(config.high_water, config.low_water);
        let registry = Arc::new_cyclic(|weak| {
            SessionRegistry::new(transport, dispatcher.bound_to(weak.clone()), config)
        });
        let events = EventReceiver::new(rx, Arc::downgrade(&registry));

        Ok((
            Self {
                registry,
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(1),
            },
            events,
        ))
    }

    /// Create a manager over plain TCP with rustls upgrades
    pub fn tcp(config: SessionConfig) -> Result<(Self, EventReceiver), SocketError> {
        Self::new(config, Arc::new(TcpTransport))
    }

    /// Open an outbound session; progress is reported as events
    pub fn open(
        &self,
        host: &str,
        port: u16,
        options: ConnectOptions,
    ) -> Result<SessionId, SocketError> {
        self.registry.create(host, port, options)
    }

    /// Queue bytes on a session
    pub fn write(&self, id: SessionId, data: impl Into<Bytes>) -> Result<(), SocketError> {
        self.registry.lookup(id)?.write(data.into())
    }

    /// Close a session after flushing what was already written
    pub fn close(&self, id: SessionId) -> Result<(), SocketError> {
        self.registry.close(id)
    }

    /// Upgrade a connected session to TLS
    pub fn start_tls(&self, id: SessionId, options: TlsOptions) -> Result<(), SocketError> {
        self.registry.lookup(id)?.start_tls(options)
    }

    /// Bind and accept connections as new sessions
    pub async fn listen(
        &self,
        host: &str,
        port: u16,
        options: ListenOptions,
    ) -> Result<ListenerId, SocketError> {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let handle = listener::start(self.registry.clone(), id, host, port, options).await?;
        self.listeners.insert(id, handle);
        Ok(id)
    }

    /// Stop accepting; sessions already accepted are unaffected
    pub fn stop_listening(&self, id: ListenerId) -> Result<(), SocketError> {
        let (_, handle) = self
            .listeners
            .remove(&id)
            .ok_or(SocketError::UnknownListener(id))?;
        info!("Stopping listener {}", id);
        handle.stop();
        Ok(())
    }

    /// Snapshot of a live session
    pub fn session(&self, id: SessionId) -> Result<SessionInfo, SocketError> {
        Ok(self.registry.lookup(id)?.info())
    }

    /// Address a listener is bound to
    pub fn listener_address(&self, id: ListenerId) -> Result<Option<SocketAddr>, SocketError> {
        self.listener(id).map(|l| l.local_addr())
    }

    /// Connections a listener has accepted
    pub fn connection_count(&self, id: ListenerId) -> Result<usize, SocketError> {
        self.listener(id).map(|l| l.connection_count())
    }

    /// The underlying registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn listener(&self, id: ListenerId) -> Result<Arc<ListenerHandle>, SocketError> {
        self.listeners
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(SocketError::UnknownListener(id))
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        for entry in self.listeners.iter() {
            entry.value().stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::event::{EventKind, ListenerEventKind};
    use crate::session::SessionState;
    use crate::testing::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    const CA: &str = "-----BEGIN CERTIFICATE-----";

    fn test_config() -> SessionConfig {
        SessionConfig {
            close_grace: Duration::from_secs(5),
            ..SessionConfig::default()
        }
    }

    fn manager(
        config: SessionConfig,
        transport: &Arc<MockTransport>,
    ) -> (SocketManager, EventReceiver) {
        SocketManager::new(config, transport.clone()).unwrap()
    }

    fn error_kind(event: &crate::event::SessionEvent) -> ErrorKind {
        match &event.kind {
            EventKind::Error(e) => e.kind(),
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_pong_session() {
        let transport = MockTransport::new();
        let mut remote = transport.accept();
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        let connected = next_session(&mut events).await;
        assert_eq!(connected.session_id, id);
        assert_eq!(connected.sequence, 1);
        match connected.kind {
            EventKind::Connected { peer_addr, .. } => {
                assert_eq!(peer_addr, Some("10.0.0.5:9000".parse().unwrap()));
            }
            other => panic!("expected connected, got {:?}", other),
        }
        assert_eq!(
            transport.dialed.lock().unwrap().as_slice(),
            &[("10.0.0.5".to_string(), 9000)]
        );

        manager.write(id, "ping").unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        let data = next_session(&mut events).await;
        assert_eq!(data.kind, EventKind::Data(Bytes::from_static(b"pong")));
        assert!(data.sequence > connected.sequence);

        let info = manager.session(id).unwrap();
        assert_eq!(info.state, SessionState::Connected);
        assert_eq!(info.stats.bytes_out, 4);
        assert_eq!(info.stats.bytes_in, 4);

        manager.close(id).unwrap();
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(remote);

        let tail = until_closed(&mut events, id).await;
        assert_eq!(kinds(&tail), vec!["end", "closed"]);
        assert!(tail.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(
            manager.session(id).unwrap_err(),
            SocketError::UnknownSession(id)
        );
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_writes_while_connecting_flush_in_order_after_connected() {
        let transport = MockTransport::new();
        let (gate, mut remote) = transport.gated();
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        manager.write(id, "one ").unwrap();
        manager.write(id, "two ").unwrap();
        manager.write(id, "three").unwrap();

        let info = manager.session(id).unwrap();
        assert_eq!(info.state, SessionState::Connecting);
        assert_eq!(info.pending_write_bytes, 13);

        gate.send(()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");

        let mut buf = vec![0u8; 13];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"one two three");
    }

    #[tokio::test]
    async fn test_queued_writes_wait_for_connected_delivery() {
        let transport = MockTransport::new();
        let (gate, mut remote) = transport.gated();
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        manager.write(id, "ping").unwrap();
        gate.send(()).unwrap();

        // Connected is queued but nobody has taken it yet
        let mut buf = [0u8; 4];
        let early = tokio::time::timeout(Duration::from_millis(300), remote.read(&mut buf)).await;
        assert!(early.is_err(), "write reached the wire before Connected was delivered");
        assert_eq!(manager.session(id).unwrap().state, SessionState::Connected);
        assert_eq!(manager.session(id).unwrap().pending_write_bytes, 4);

        assert_eq!(next_session(&mut events).await.kind.name(), "connected");
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_close_while_connecting_never_connects() {
        let transport = MockTransport::new();
        let (gate, _remote) = transport.gated();
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        manager.write(id, "never sent").unwrap();
        manager.close(id).unwrap();
        assert_eq!(manager.session(id).unwrap().state, SessionState::Closed);
        let _ = gate.send(());

        let all = until_closed(&mut events, id).await;
        assert_eq!(kinds(&all), vec!["closed"]);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fails_session() {
        let transport = MockTransport::new();
        transport.hang();
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(3),
            ..test_config()
        };
        let (manager, mut events) = manager(config, &transport);

        let started = tokio::time::Instant::now();
        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        let all = until_closed(&mut events, id).await;

        assert_eq!(kinds(&all), vec!["error", "closed"]);
        assert_eq!(error_kind(&all[0]), ErrorKind::ConnectFailure);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(
            manager.session(id).unwrap_err(),
            SocketError::UnknownSession(id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_connect_timeout_overrides_config() {
        let transport = MockTransport::new();
        transport.hang();
        let (manager, mut events) = manager(test_config(), &transport);

        let started = tokio::time::Instant::now();
        let options = ConnectOptions {
            connect_timeout: Some(Duration::from_millis(500)),
            ..ConnectOptions::default()
        };
        let id = manager.open("10.0.0.5", 9000, options).unwrap();
        let all = until_closed(&mut events, id).await;

        assert_eq!(error_kind(&all[0]), ErrorKind::ConnectFailure);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_refused_connect_reports_connect_failure() {
        let transport = MockTransport::new();
        transport.script(ConnectScript::Refuse);
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        let all = until_closed(&mut events, id).await;
        assert_eq!(kinds(&all), vec!["error", "closed"]);
        assert_eq!(error_kind(&all[0]), ErrorKind::ConnectFailure);
    }

    #[tokio::test]
    async fn test_invalid_open_is_synchronous() {
        let transport = MockTransport::new();
        let (manager, mut events) = manager(test_config(), &transport);

        let err = manager
            .open("10.0.0.5", 0, ConnectOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = manager
            .open("not a host", 80, ConnectOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        tokio::task::yield_now().await;
        assert!(events.try_recv().is_none());
        assert!(transport.dialed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_tls_twice_runs_one_handshake() {
        let transport = MockTransport::new();
        let _remote = transport.accept();
        transport.script_tls(TlsScript::Succeed);
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");

        manager
            .start_tls(id, TlsOptions::client("example.com", CA))
            .unwrap();
        let err = manager
            .start_tls(id, TlsOptions::client("example.com", CA))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateError);

        assert_eq!(next_session(&mut events).await.kind, EventKind::Secured);
        assert_eq!(transport.tls_attempts(), 1);
        let info = manager.session(id).unwrap();
        assert!(info.secure);
        assert!(info.tls_requested);
    }

    #[tokio::test]
    async fn test_start_tls_before_connected_is_state_error() {
        let transport = MockTransport::new();
        transport.hang();
        let (manager, _events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        let err = manager
            .start_tls(id, TlsOptions::client("example.com", CA))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateError);
        assert_eq!(transport.tls_attempts(), 0);
    }

    #[tokio::test]
    async fn test_tls_failure_fails_session() {
        let transport = MockTransport::new();
        let _remote = transport.accept();
        transport.script_tls(TlsScript::Fail);
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");
        manager
            .start_tls(id, TlsOptions::client("example.com", CA))
            .unwrap();

        let tail = until_closed(&mut events, id).await;
        assert_eq!(kinds(&tail), vec!["error", "closed"]);
        assert_eq!(error_kind(&tail[0]), ErrorKind::TlsFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tls_handshake_timeout_fails_session() {
        let transport = MockTransport::new();
        let _remote = transport.accept();
        let (_release, gate) = oneshot::channel();
        transport.script_tls(TlsScript::Gated(gate));
        let config = SessionConfig {
            tls_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let (manager, mut events) = manager(config, &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");
        let started = tokio::time::Instant::now();
        manager
            .start_tls(id, TlsOptions::client("example.com", CA))
            .unwrap();

        let tail = until_closed(&mut events, id).await;
        assert_eq!(kinds(&tail), vec!["error", "closed"]);
        assert_eq!(error_kind(&tail[0]), ErrorKind::TlsFailure);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(transport.tls_attempts(), 1);
    }

    #[tokio::test]
    async fn test_tls_on_connect_holds_writes_until_secured() {
        let transport = MockTransport::new();
        let mut remote = transport.accept();
        let (release, gate) = oneshot::channel();
        transport.script_tls(TlsScript::Gated(gate));
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager
            .open(
                "10.0.0.5",
                443,
                ConnectOptions::with_tls(TlsOptions::client("example.com", CA)),
            )
            .unwrap();
        manager.write(id, "hello").unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");

        let mut buf = [0u8; 5];
        let early = tokio::time::timeout(Duration::from_millis(100), remote.read(&mut buf)).await;
        assert!(early.is_err(), "bytes were written before the handshake");

        release.send(true).unwrap();
        assert_eq!(next_session(&mut events).await.kind, EventKind::Secured);
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_peer_end_auto_closes_when_half_open_disabled() {
        let transport = MockTransport::new();
        let mut remote = transport.accept();
        let config = SessionConfig {
            allow_half_open: false,
            ..test_config()
        };
        let (manager, mut events) = manager(config, &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");
        remote.write_all(b"bye").await.unwrap();
        drop(remote);

        let tail = until_closed(&mut events, id).await;
        assert_eq!(data(&tail), b"bye");
        assert_eq!(kinds(&tail[tail.len() - 2..]), vec!["end", "closed"]);
    }

    #[tokio::test]
    async fn test_peer_end_waits_for_close() {
        let transport = MockTransport::new();
        let mut remote = transport.accept();
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");

        remote.shutdown().await.unwrap();
        assert_eq!(next_session(&mut events).await.kind, EventKind::End);
        assert_eq!(manager.session(id).unwrap().state, SessionState::Closing);

        let err = manager.write(id, "late").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateError);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_none());

        manager.close(id).unwrap();
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let tail = until_closed(&mut events, id).await;
        assert_eq!(kinds(&tail), vec!["closed"]);
    }

    #[tokio::test]
    async fn test_close_flushes_pending_writes() {
        let transport = MockTransport::new();
        let mut remote = transport.accept();
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");

        // Larger than the in-memory pipe, so close() runs with writes still queued
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        manager.write(id, payload.clone()).unwrap();
        manager.close(id).unwrap();
        assert_eq!(
            manager.write(id, "more").unwrap_err().kind(),
            ErrorKind::StateError
        );

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
        drop(remote);

        let tail = until_closed(&mut events, id).await;
        assert_eq!(kinds(&tail), vec!["end", "closed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_grace_expiry_abandons_writes() {
        let transport = MockTransport::new();
        let _remote = transport.accept();
        let config = SessionConfig {
            close_grace: Duration::from_secs(1),
            ..test_config()
        };
        let (manager, mut events) = manager(config, &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");

        manager.write(id, vec![7u8; 200_000]).unwrap();
        manager.close(id).unwrap();

        let tail = until_closed(&mut events, id).await;
        assert_eq!(kinds(&tail), vec!["closed"]);
    }

    #[tokio::test]
    async fn test_transport_error_fails_session() {
        let transport = MockTransport::new();
        transport.script(ConnectScript::Failing);
        let (manager, mut events) = manager(test_config(), &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        let all = until_closed(&mut events, id).await;
        assert_eq!(kinds(&all), vec!["connected", "error", "closed"]);
        assert_eq!(error_kind(&all[1]), ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn test_backpressure_pauses_reads_without_losing_data() {
        let transport = MockTransport::new();
        let mut remote = transport.accept();
        let config = SessionConfig {
            high_water: 64,
            low_water: 16,
            read_chunk: 32,
            ..test_config()
        };
        let (manager, mut events) = manager(config, &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        assert_eq!(next_session(&mut events).await.kind.name(), "connected");

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        remote.write_all(&payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let info = manager.session(id).unwrap();
        assert!(info.paused);
        assert_eq!(info.buffered_event_bytes, 64);
        assert_eq!(info.stats.bytes_in, 64);

        let mut received = Vec::new();
        let mut last_sequence = 1;
        while received.len() < payload.len() {
            let event = next_session(&mut events).await;
            assert!(event.sequence > last_sequence);
            last_sequence = event.sequence;
            match event.kind {
                EventKind::Data(bytes) => {
                    assert!(bytes.len() <= 32);
                    received.extend_from_slice(&bytes);
                }
                other => panic!("unexpected event {:?}", other),
            }
            assert!(manager.session(id).unwrap().buffered_event_bytes <= 64);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_pending_write_cap() {
        let transport = MockTransport::new();
        let (_gate, _remote) = transport.gated();
        let config = SessionConfig {
            max_pending_write_bytes: Some(8),
            ..test_config()
        };
        let (manager, _events) = manager(config, &transport);

        let id = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        manager.write(id, "12345678").unwrap();
        let err = manager.write(id, "9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityError);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let transport = MockTransport::new();
        let (manager, _events) = manager(test_config(), &transport);

        let missing = SessionId(99);
        assert_eq!(
            manager.write(missing, "x").unwrap_err(),
            SocketError::UnknownSession(missing)
        );
        assert!(manager.close(missing).is_err());
        assert!(manager
            .start_tls(missing, TlsOptions::client("example.com", CA))
            .is_err());
        assert_eq!(
            manager.stop_listening(ListenerId(5)).unwrap_err(),
            SocketError::UnknownListener(ListenerId(5))
        );
    }

    #[tokio::test]
    async fn test_sessions_are_forgotten_without_a_receiver() {
        let transport = MockTransport::new();
        let (manager, events) = manager(test_config(), &transport);

        // Closed already queued when the receiver goes away
        let queued = manager.open("10.0.0.5", 9000, ConnectOptions::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.session(queued).unwrap().state != SessionState::Failed {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        drop(events);
        assert!(manager.registry().is_empty());

        // Closed emitted after the receiver is gone
        let later = manager.open("10.0.0.6", 9000, ConnectOptions::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.registry().lookup(later).is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_listen_failure_is_reported_to_caller() {
        let transport = MockTransport::new();
        let (manager, _events) = manager(test_config(), &transport);

        let err = manager
            .listen("127.0.0.1", 0, ListenOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
        let err = manager
            .listen("bad host", 0, ListenOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_listener_accepts_sessions_over_tcp() {
        let (manager, mut events) = SocketManager::tcp(test_config()).unwrap();

        let listener = manager
            .listen("127.0.0.1", 0, ListenOptions::default())
            .await
            .unwrap();
        let bound = manager.listener_address(listener).unwrap().unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(
            next_listener(&mut events).await.kind,
            ListenerEventKind::Listening {
                local_addr: Some(bound)
            }
        );

        let mut client = tokio::net::TcpStream::connect(bound).await.unwrap();
        let session = match next_listener(&mut events).await.kind {
            ListenerEventKind::Connection {
                session_id,
                peer_addr,
            } => {
                assert_eq!(peer_addr, client.local_addr().ok());
                session_id
            }
            other => panic!("expected connection, got {:?}", other),
        };
        assert_eq!(manager.connection_count(listener).unwrap(), 1);
        let info = manager.session(session).unwrap();
        assert_eq!(info.state, SessionState::Connected);
        assert!(info.inbound);

        client.write_all(b"hello").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 5 {
            let event = next_session(&mut events).await;
            assert_eq!(event.session_id, session);
            if let EventKind::Data(bytes) = event.kind {
                received.extend_from_slice(&bytes);
            }
        }
        assert_eq!(received, b"hello");

        manager.write(session, "world").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        manager.stop_listening(listener).unwrap();
        assert_eq!(next_listener(&mut events).await.kind, ListenerEventKind::Closed);
        assert_eq!(
            manager.listener_address(listener).unwrap_err(),
            SocketError::UnknownListener(listener)
        );

        // Already-accepted sessions outlive the listener
        manager.write(session, "still here").unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        drop(client);
        assert_eq!(next_session(&mut events).await.kind, EventKind::End);
        assert_eq!(manager.session(session).unwrap().state, SessionState::Closing);
        manager.close(session).unwrap();
        let tail = until_closed(&mut events, session).await;
        assert_eq!(kinds(&tail), vec!["closed"]);
    }

    #[tokio::test]
    async fn test_outbound_tcp_session_against_listener() {
        let (manager, mut events) = SocketManager::tcp(test_config()).unwrap();
        let listener = manager
            .listen("127.0.0.1", 0, ListenOptions::default())
            .await
            .unwrap();
        let port = manager.listener_address(listener).unwrap().unwrap().port();

        let client = manager
            .open("127.0.0.1", port, ConnectOptions::default())
            .unwrap();
        let mut server = None;
        let mut connected = false;
        while server.is_none() || !connected {
            match next(&mut events).await {
                crate::event::Notification::Listener(event) => {
                    if let ListenerEventKind::Connection { session_id, .. } = event.kind {
                        server = Some(session_id);
                    }
                }
                crate::event::Notification::Session(event) => {
                    assert_eq!(event.session_id, client);
                    assert_eq!(event.kind.name(), "connected");
                    connected = true;
                }
            }
        }
        let server = server.unwrap();
        assert_ne!(server, client);

        manager.write(client, "echo me").unwrap();
        let mut received = Vec::new();
        while received.len() < 7 {
            let event = next_session(&mut events).await;
            assert_eq!(event.session_id, server);
            if let EventKind::Data(bytes) = event.kind {
                received.extend_from_slice(&bytes);
            }
        }
        assert_eq!(received, b"echo me");

        manager.close(client).unwrap();
        let mut closed = Vec::new();
        while closed.len() < 2 {
            let event = next_session(&mut events).await;
            match event.kind {
                // The accepted side acknowledges the client's FIN
                EventKind::End => manager.close(event.session_id).unwrap(),
                EventKind::Closed => closed.push(event.session_id),
                _ => {}
            }
        }
        closed.sort();
        let mut expected = vec![client, server];
        expected.sort();
        assert_eq!(closed, expected);
        assert!(manager.registry().is_empty());
    }
}
