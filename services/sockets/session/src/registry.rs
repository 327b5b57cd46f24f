//! Session registry: id allocation, lookup and teardown.

use dashmap::DashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::{ConnectOptions, SessionConfig};
use crate::dispatcher::EventDispatcher;
use crate::error::SocketError;
use crate::event::SessionId;
use crate::session::{SessionHandle, SessionTask};
use crate::transport::{IoStream, Link, LinkOptions, Transport};

/// Check a host/port pair and return the host in the form the transport expects
///
/// Accepts IPv4 and IPv6 literals (optionally bracketed) and DNS names.
/// Listeners may pass an empty host, meaning every interface, and port 0,
/// meaning an ephemeral port.
pub fn normalize_endpoint(host: &str, port: u16, listening: bool) -> Result<String, SocketError> {
    if port == 0 && !listening {
        return Err(SocketError::invalid("port must be in 1..=65535"));
    }
    let host = host.trim();
    if host.is_empty() {
        if listening {
            return Ok(String::new());
        }
        return Err(SocketError::invalid("address must not be empty"));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return match inner.parse::<Ipv6Addr>() {
            Ok(_) => Ok(inner.to_string()),
            Err(_) => Err(SocketError::invalid(format!("invalid IPv6 address: {}", host))),
        };
    }
    if host.len() > 253 {
        return Err(SocketError::invalid("host name longer than 253 characters"));
    }
    for label in host.trim_end_matches('.').split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(SocketError::invalid(format!("invalid host name: {}", host)));
        }
    }
    Ok(host.to_string())
}

/// An accepted session registered but not yet running
pub(crate) struct SessionLaunch {
    task: SessionTask,
    stream: IoStream,
}

impl SessionLaunch {
    pub(crate) fn id(&self) -> SessionId {
        self.task.id()
    }

    pub(crate) fn start(self) {
        tokio::spawn(self.task.run_accepted(self.stream));
    }
}

/// Owns every live session of a manager
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    next_id: AtomicU64,
    transport: Arc<dyn Transport>,
    dispatcher: EventDispatcher,
    config: SessionConfig,
}

impl SessionRegistry {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        dispatcher: EventDispatcher,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            transport,
            dispatcher,
            config,
        }
    }

    fn allocate(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an outbound session and start connecting it
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(
        &self,
        host: &str,
        port: u16,
        options: ConnectOptions,
    ) -> Result<SessionId, SocketError> {
        let host = normalize_endpoint(host, port, false)?;
        if let Some(tls) = &options.tls {
            tls.validate()?;
        }
        if options.connect_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SocketError::invalid("connect timeout must be non-zero"));
        }

        let id = self.allocate();
        let emitter = self.dispatcher.emitter(id);
        let handle = Arc::new(SessionHandle::outbound(
            id,
            &host,
            port,
            options.tls,
            emitter.flow().clone(),
            self.config.max_pending_write_bytes,
        ));
        self.sessions.insert(id, handle.clone());

        let timeout = options.connect_timeout.unwrap_or(self.config.connect_timeout);
        let link = options.link.unwrap_or_else(|| self.config.link.clone());
        let task = SessionTask::new(handle, self.transport.clone(), emitter, self.config.clone());
        tokio::spawn(task.run_outbound(timeout, link));

        info!("Session {} created for {}:{}", id, host, port);
        Ok(id)
    }

    /// Register an accepted connection as a Connected session
    pub(crate) fn adopt(&self, link: Link) -> SessionLaunch {
        let id = self.allocate();
        let emitter = self.dispatcher.emitter(id);
        let handle = Arc::new(SessionHandle::inbound(
            id,
            link.local_addr,
            link.peer_addr,
            emitter.flow().clone(),
            self.config.max_pending_write_bytes,
        ));
        self.sessions.insert(id, handle.clone());
        debug!("Session {} adopted from {:?}", id, link.peer_addr);

        SessionLaunch {
            task: SessionTask::new(handle, self.transport.clone(), emitter, self.config.clone()),
            stream: link.stream,
        }
    }

    /// Live session by id
    pub fn lookup(&self, id: SessionId) -> Result<Arc<SessionHandle>, SocketError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(SocketError::UnknownSession(id))
    }

    /// Begin closing a session; closing an already-terminal one is a no-op
    pub fn close(&self, id: SessionId) -> Result<(), SocketError> {
        self.lookup(id)?.close();
        Ok(())
    }

    /// Forget a session once its `Closed` event has been delivered, or can no
    /// longer be
    pub(crate) fn destroy(&self, id: SessionId) {
        match self.sessions.remove(&id) {
            Some((_, handle)) => {
                debug_assert!(handle.state().is_terminal());
                debug!("Session {} destroyed", id);
            }
            None => {
                error!("Session {} destroyed twice", id);
                debug_assert!(false, "session {} destroyed twice", id);
            }
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// No live sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of every live session
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub(crate) fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn default_link(&self) -> &LinkOptions {
        &self.config.link
    }
}
