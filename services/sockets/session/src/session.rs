//! Core session state machine.
//!
//! A session is split in two. [`SessionHandle`] is the shared, lock-protected
//! view used by commands: it validates `write`, `close` and `start_tls`
//! synchronously against the current state and queues accepted work. The
//! session task owns the transport stream and is the only place where
//! occurrences (connect result, bytes read, write completion, TLS result,
//! FIN, errors) turn into state transitions and events, so every transition
//! of one session is serialized.

use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::dispatcher::{EventEmitter, FlowControl};
use crate::error::SocketError;
use crate::event::{EventKind, SessionId};
use crate::transport::{IoStream, LinkOptions, TlsOptions, Transport};

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Outbound connect in flight
    Connecting,
    /// Established; reads and writes flow
    Connected,
    /// Flushing pending writes before closing
    Closing,
    /// Closed normally (terminal)
    Closed,
    /// Closed by an error (terminal)
    Failed,
}

impl SessionState {
    /// Closed or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `next` is a legal forward transition from this state
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Connecting, Connected) | (Connecting, Closed) => true,
            (Connected, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Number of reads that produced Data events
    pub reads: u64,
    /// Number of writes fully handed to the transport
    pub writes_completed: u64,
    /// Timestamp of last read
    pub last_read: Option<std::time::Instant>,
    /// Timestamp of last completed write
    pub last_write: Option<std::time::Instant>,
}

/// Point-in-time view of a session
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Session id
    pub id: SessionId,
    /// `host:port` for outbound sessions, peer address for accepted ones
    pub remote: String,
    /// Created by a listener
    pub inbound: bool,
    /// Current state
    pub state: SessionState,
    /// Local endpoint
    pub local_addr: Option<SocketAddr>,
    /// Remote endpoint
    pub peer_addr: Option<SocketAddr>,
    /// A TLS upgrade was requested
    pub tls_requested: bool,
    /// The TLS upgrade completed
    pub secure: bool,
    /// Last asynchronous error
    pub last_error: Option<SocketError>,
    /// Bytes accepted by `write` but not yet on the wire
    pub pending_write_bytes: usize,
    /// Data bytes emitted but not yet taken by the consumer
    pub buffered_event_bytes: usize,
    /// Reads paused by backpressure
    pub paused: bool,
    /// Counters
    pub stats: SessionStats,
}

/// Queued outbound work, in submission order
#[derive(Debug)]
enum Outbound {
    Data(Bytes),
    StartTls(TlsOptions),
}

#[derive(Debug)]
struct SessionCore {
    state: SessionState,
    pending: VecDeque<Outbound>,
    pending_bytes: usize,
    tls_requested: bool,
    /// Upgrade accepted but not resolved; reads are held back meanwhile
    tls_pending: bool,
    secure: bool,
    close_requested: bool,
    last_error: Option<SocketError>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    stats: SessionStats,
}

impl SessionCore {
    fn new(state: SessionState) -> Self {
        Self {
            state,
            pending: VecDeque::new(),
            pending_bytes: 0,
            tls_requested: false,
            tls_pending: false,
            secure: false,
            close_requested: false,
            last_error: None,
            local_addr: None,
            peer_addr: None,
            stats: SessionStats::default(),
        }
    }

    fn advance(&mut self, id: SessionId, next: SessionState) -> bool {
        if self.state.can_advance_to(next) {
            debug!("Session {} {:?} -> {:?}", id, self.state, next);
            self.state = next;
            true
        } else {
            debug!(
                "Session {} ignoring transition {:?} -> {:?}",
                id, self.state, next
            );
            false
        }
    }

    fn abandon_writes(&mut self) -> usize {
        let abandoned = self.pending_bytes;
        self.pending.clear();
        self.pending_bytes = 0;
        self.tls_pending = false;
        abandoned
    }
}

/// Shared reference to a live session
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    remote: String,
    host: String,
    port: u16,
    inbound: bool,
    core: Mutex<SessionCore>,
    wake: Notify,
    flow: Arc<FlowControl>,
    max_pending_write_bytes: Option<usize>,
}

impl SessionHandle {
    /// Handle for a client session about to connect
    pub(crate) fn outbound(
        id: SessionId,
        host: &str,
        port: u16,
        tls: Option<TlsOptions>,
        flow: Arc<FlowControl>,
        max_pending_write_bytes: Option<usize>,
    ) -> Self {
        let mut core = SessionCore::new(SessionState::Connecting);
        if let Some(options) = tls {
            // TLS-on-connect: the upgrade runs before anything written while connecting
            core.tls_requested = true;
            core.tls_pending = true;
            core.pending.push_back(Outbound::StartTls(options));
        }
        Self {
            id,
            remote: format!("{}:{}", host, port),
            host: host.to_string(),
            port,
            inbound: false,
            core: Mutex::new(core),
            wake: Notify::new(),
            flow,
            max_pending_write_bytes,
        }
    }

    /// Handle for an accepted connection, already Connected
    pub(crate) fn inbound(
        id: SessionId,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        flow: Arc<FlowControl>,
        max_pending_write_bytes: Option<usize>,
    ) -> Self {
        let mut core = SessionCore::new(SessionState::Connected);
        core.local_addr = local_addr;
        core.peer_addr = peer_addr;
        let remote = peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            id,
            remote,
            host: String::new(),
            port: peer_addr.map(|a| a.port()).unwrap_or(0),
            inbound: true,
            core: Mutex::new(core),
            wake: Notify::new(),
            flow,
            max_pending_write_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Snapshot of the session
    pub fn info(&self) -> SessionInfo {
        let core = self.lock();
        SessionInfo {
            id: self.id,
            remote: self.remote.clone(),
            inbound: self.inbound,
            state: core.state,
            local_addr: core.local_addr,
            peer_addr: core.peer_addr,
            tls_requested: core.tls_requested,
            secure: core.secure,
            last_error: core.last_error.clone(),
            pending_write_bytes: core.pending_bytes,
            buffered_event_bytes: self.flow.buffered(),
            paused: self.flow.is_paused(),
            stats: core.stats.clone(),
        }
    }

    /// Queue bytes for transmission
    pub(crate) fn write(&self, data: Bytes) -> Result<(), SocketError> {
        let mut core = self.lock();
        match core.state {
            SessionState::Connecting | SessionState::Connected => {}
            SessionState::Closing => {
                return Err(SocketError::State {
                    operation: "write",
                    state: core.state,
                    reason: "session closing",
                })
            }
            SessionState::Closed | SessionState::Failed => {
                return Err(SocketError::State {
                    operation: "write",
                    state: core.state,
                    reason: "session terminated",
                })
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        if let Some(cap) = self.max_pending_write_bytes {
            if core.pending_bytes + data.len() > cap {
                return Err(SocketError::Capacity(format!(
                    "session {} has {} pending write bytes, {} more exceeds the cap of {}",
                    self.id,
                    core.pending_bytes,
                    data.len(),
                    cap
                )));
            }
        }
        core.pending_bytes += data.len();
        core.pending.push_back(Outbound::Data(data));
        drop(core);
        self.wake.notify_one();
        Ok(())
    }

    /// Begin closing; idempotent
    pub(crate) fn close(&self) {
        let mut core = self.lock();
        match core.state {
            SessionState::Connecting => {
                info!("Session {} cancelling connect to {}", self.id, self.remote);
                core.advance(self.id, SessionState::Closed);
                core.close_requested = true;
                core.abandon_writes();
            }
            SessionState::Connected => {
                core.advance(self.id, SessionState::Closing);
                core.close_requested = true;
            }
            SessionState::Closing => {
                if core.close_requested {
                    return;
                }
                // Acknowledges a peer half-close
                core.close_requested = true;
            }
            SessionState::Closed | SessionState::Failed => return,
        }
        drop(core);
        self.wake.notify_one();
    }

    /// Request a TLS upgrade; accepted once, and only while Connected
    pub(crate) fn start_tls(&self, options: TlsOptions) -> Result<(), SocketError> {
        let mut core = self.lock();
        if core.state != SessionState::Connected {
            return Err(SocketError::State {
                operation: "start_tls",
                state: core.state,
                reason: "session not connected",
            });
        }
        if core.tls_requested {
            return Err(SocketError::State {
                operation: "start_tls",
                state: core.state,
                reason: "tls already requested",
            });
        }
        options.validate()?;
        core.tls_requested = true;
        core.tls_pending = true;
        core.pending.push_back(Outbound::StartTls(options));
        drop(core);
        self.wake.notify_one();
        Ok(())
    }

    /// Resolves once the session leaves Connecting
    async fn left_connecting(&self) {
        loop {
            if self.state() != SessionState::Connecting {
                return;
            }
            self.wake.notified().await;
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

async fn write_step(
    writer: &mut WriteHalf<IoStream>,
    pending: Option<&[u8]>,
) -> std::io::Result<usize> {
    match pending {
        Some(buf) => writer.write(buf).await,
        None => {
            writer.flush().await?;
            Ok(0)
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The task driving one session's transport
pub(crate) struct SessionTask {
    handle: Arc<SessionHandle>,
    transport: Arc<dyn Transport>,
    emitter: EventEmitter,
    config: SessionConfig,
}

impl SessionTask {
    pub(crate) fn new(
        handle: Arc<SessionHandle>,
        transport: Arc<dyn Transport>,
        emitter: EventEmitter,
        config: SessionConfig,
    ) -> Self {
        Self {
            handle,
            transport,
            emitter,
            config,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Connect, then run the connected loop
    pub(crate) async fn run_outbound(mut self, timeout: Duration, link_options: LinkOptions) {
        let handle = self.handle.clone();
        info!(
            "Session {} connecting to {} (timeout {:?})",
            handle.id, handle.remote, timeout
        );

        let outcome = tokio::select! {
            biased;

            _ = handle.left_connecting() => None,

            res = tokio::time::timeout(
                timeout,
                self.transport.connect(handle.host(), handle.port(), &link_options),
            ) => Some(res),
        };

        let link = match outcome {
            None => return self.finish_closed(),
            Some(Err(_elapsed)) => {
                return self.fail(SocketError::ConnectFailure(format!(
                    "connect to {} timed out after {:?}",
                    handle.remote, timeout
                )))
            }
            Some(Ok(Err(e))) => return self.fail(e.into()),
            Some(Ok(Ok(link))) => link,
        };

        {
            let mut core = handle.lock();
            if !core.advance(handle.id, SessionState::Connected) {
                // close() won the race against the connect
                drop(core);
                return self.finish_closed();
            }
            core.local_addr = link.local_addr;
            core.peer_addr = link.peer_addr;
        }

        info!(
            "Session {} connected to {} (local {:?}, peer {:?})",
            handle.id, handle.remote, link.local_addr, link.peer_addr
        );
        self.emitter.emit(EventKind::Connected {
            local_addr: link.local_addr,
            peer_addr: link.peer_addr,
        });

        self.run_connected(link.stream, true).await;
    }

    /// Run an accepted session; it starts out Connected
    pub(crate) async fn run_accepted(self, stream: IoStream) {
        info!(
            "Session {} accepted from {}",
            self.handle.id, self.handle.remote
        );
        self.run_connected(stream, false).await;
    }

    /// Drive an established stream; with `await_connected` queued work is held
    /// until the consumer has taken the `Connected` event
    async fn run_connected(mut self, stream: IoStream, await_connected: bool) {
        let flow = self.emitter.flow().clone();
        let mut announced = !await_connected;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut scratch = vec![0u8; self.config.read_chunk];
        let mut current: Option<(Bytes, usize)> = None;
        let mut needs_flush = false;
        let mut read_open = true;
        let mut write_open = true;
        let mut close_deadline: Option<Instant> = None;

        loop {
            let mut upgrade = None;
            let (proceed_close, idle, tls_pending) = {
                let mut core = self.handle.lock();
                if current.is_none() && announced {
                    match core.pending.pop_front() {
                        Some(Outbound::Data(bytes)) => current = Some((bytes, 0)),
                        // Everything written before start_tls must be on the wire first
                        Some(Outbound::StartTls(options)) if !needs_flush => upgrade = Some(options),
                        Some(marker) => core.pending.push_front(marker),
                        None => {}
                    }
                }
                let proceed_close = core.state == SessionState::Closing
                    && (core.close_requested || !self.config.allow_half_open);
                let idle = current.is_none() && upgrade.is_none() && core.pending.is_empty();
                (proceed_close, idle, core.tls_pending)
            };

            if let Some(options) = upgrade {
                let stream = reader.unsplit(writer);
                match self.upgrade(stream, options).await {
                    Ok(stream) => {
                        let (r, w) = tokio::io::split(stream);
                        reader = r;
                        writer = w;
                        continue;
                    }
                    Err(e) => return self.fail(e),
                }
            }

            if proceed_close && close_deadline.is_none() {
                let deadline = Instant::now() + self.config.close_grace;
                close_deadline = Some(deadline);
                debug!(
                    "Session {} closing, grace {:?}",
                    self.handle.id, self.config.close_grace
                );
            }

            if proceed_close && write_open && idle && !needs_flush {
                // All accepted writes are on the wire; send FIN
                let deadline = close_deadline.unwrap_or_else(Instant::now);
                match tokio::time::timeout_at(deadline, writer.shutdown()).await {
                    Ok(Ok(())) => debug!("Session {} sent FIN", self.handle.id),
                    Ok(Err(e)) => debug!("Session {} shutdown failed: {}", self.handle.id, e),
                    Err(_) => debug!("Session {} shutdown timed out", self.handle.id),
                }
                write_open = false;
            }

            if !write_open && !read_open {
                return self.finish_closed();
            }

            let paused = flow.is_paused();
            let budget = flow.read_budget(self.config.read_chunk);
            let can_read = read_open && !tls_pending && budget > 0;
            let can_write = write_open && (current.is_some() || needs_flush);

            tokio::select! {
                biased;

                _ = self.handle.wake.notified() => {}

                res = write_step(&mut writer, current.as_ref().map(|(b, off)| &b[*off..])), if can_write => {
                    match res {
                        Ok(0) if current.is_some() => {
                            return self.fail(SocketError::Transport(
                                "connection closed while writing".to_string(),
                            ));
                        }
                        Ok(n) => self.on_written(&mut current, &mut needs_flush, n),
                        Err(e) => {
                            return self.fail(SocketError::Transport(format!("write failed: {}", e)));
                        }
                    }
                }

                res = reader.read(&mut scratch[..budget]), if can_read => {
                    match res {
                        Ok(0) => {
                            read_open = false;
                            self.on_peer_end();
                        }
                        Ok(n) => self.on_read(Bytes::copy_from_slice(&scratch[..n])),
                        Err(e) => {
                            return self.fail(SocketError::Transport(format!("read failed: {}", e)));
                        }
                    }
                }

                _ = flow.resumed(), if read_open && paused => {
                    trace!("Session {} reads resumed", self.handle.id);
                }

                _ = flow.connected_delivered(), if !announced => {
                    trace!("Session {} connect delivered, releasing writes", self.handle.id);
                    announced = true;
                }

                _ = sleep_until_opt(close_deadline) => {
                    let abandoned = self.handle.lock().pending_bytes;
                    warn!(
                        "Session {} close grace expired, abandoning {} pending bytes",
                        self.handle.id, abandoned
                    );
                    return self.finish_closed();
                }
            }
        }
    }

    async fn upgrade(
        &mut self,
        stream: IoStream,
        options: TlsOptions,
    ) -> Result<IoStream, SocketError> {
        info!(
            "Session {} starting TLS handshake as {:?}",
            self.handle.id, options.role
        );
        let result = tokio::time::timeout(
            self.config.tls_timeout,
            self.transport.upgrade_tls(stream, &options),
        )
        .await;

        let stream = match result {
            Err(_) => {
                return Err(SocketError::TlsFailure(format!(
                    "TLS handshake timed out after {:?}",
                    self.config.tls_timeout
                )))
            }
            Ok(Err(e)) => return Err(SocketError::TlsFailure(e.to_string())),
            Ok(Ok(stream)) => stream,
        };

        {
            let mut core = self.handle.lock();
            core.tls_pending = false;
            core.secure = true;
        }
        info!("Session {} secured", self.handle.id);
        self.emitter.emit(EventKind::Secured);
        Ok(stream)
    }

    fn on_written(&mut self, current: &mut Option<(Bytes, usize)>, needs_flush: &mut bool, n: usize) {
        let Some((bytes, offset)) = current.take() else {
            // Flush finished
            *needs_flush = false;
            return;
        };
        let offset = offset + n;
        if offset < bytes.len() {
            *current = Some((bytes, offset));
            return;
        }

        let mut core = self.handle.lock();
        core.pending_bytes = core.pending_bytes.saturating_sub(bytes.len());
        core.stats.bytes_out += bytes.len() as u64;
        core.stats.writes_completed += 1;
        core.stats.last_write = Some(std::time::Instant::now());
        drop(core);

        trace!("Session {} wrote {} bytes", self.handle.id, bytes.len());
        *needs_flush = true;
    }

    fn on_read(&mut self, bytes: Bytes) {
        {
            let mut core = self.handle.lock();
            core.stats.bytes_in += bytes.len() as u64;
            core.stats.reads += 1;
            core.stats.last_read = Some(std::time::Instant::now());
        }
        trace!("Session {} read {} bytes", self.handle.id, bytes.len());
        self.emitter.emit(EventKind::Data(bytes));
    }

    fn on_peer_end(&mut self) {
        {
            let mut core = self.handle.lock();
            if core.state == SessionState::Connected {
                core.advance(self.handle.id, SessionState::Closing);
            }
        }
        info!("Session {} peer ended the connection", self.handle.id);
        self.emitter.emit(EventKind::End);
    }

    fn fail(&mut self, err: SocketError) {
        let failed = {
            let mut core = self.handle.lock();
            let failed = core.advance(self.handle.id, SessionState::Failed);
            if failed {
                core.last_error = Some(err.clone());
            }
            core.abandon_writes();
            failed
        };
        if failed {
            warn!("Session {} failed: {}", self.handle.id, err);
            self.emitter.emit(EventKind::Error(err));
        } else {
            debug!(
                "Session {} already closed, not reporting: {}",
                self.handle.id, err
            );
        }
        self.emitter.emit(EventKind::Closed);
    }

    fn finish_closed(&mut self) {
        {
            let mut core = self.handle.lock();
            if !core.state.is_terminal() {
                core.advance(self.handle.id, SessionState::Closed);
            }
            let abandoned = core.abandon_writes();
            if abandoned > 0 {
                debug!(
                    "Session {} dropped {} unsent bytes",
                    self.handle.id, abandoned
                );
            }
        }
        info!("Session {} closed", self.handle.id);
        self.emitter.emit(EventKind::Closed);
    }
}
