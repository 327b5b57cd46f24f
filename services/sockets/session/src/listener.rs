//! Listeners turn accepted connections into sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::ListenOptions;
use crate::error::SocketError;
use crate::event::{ListenerEvent, ListenerEventKind, ListenerId};
use crate::registry::{normalize_endpoint, SessionRegistry};
use crate::transport::Acceptor;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listener
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    local_addr: Option<SocketAddr>,
    connections: AtomicUsize,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl ListenerHandle {
    /// Listener id
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Bound address, with the real port when 0 was requested
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Stop accepting; returns false if already stopped
    pub(crate) fn stop(&self) -> bool {
        let sender = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                let _ = sender.send(());
                true
            }
            None => false,
        }
    }
}

/// Bind and start accepting on `host:port`
pub(crate) async fn start(
    registry: Arc<SessionRegistry>,
    id: ListenerId,
    host: &str,
    port: u16,
    options: ListenOptions,
) -> Result<Arc<ListenerHandle>, SocketError> {
    let host = normalize_endpoint(host, port, true)?;
    let link = options
        .link
        .unwrap_or_else(|| registry.default_link().clone());
    let acceptor = registry
        .transport()
        .bind(&host, port, options.backlog, &link)
        .await?;

    let local_addr = acceptor.local_addr();
    let (stop_tx, stop_rx) = oneshot::channel();
    let handle = Arc::new(ListenerHandle {
        id,
        local_addr,
        connections: AtomicUsize::new(0),
        stop: Mutex::new(Some(stop_tx)),
    });

    info!("Listener {} listening on {:?}", id, local_addr);
    registry.dispatcher().notify_listener(ListenerEvent {
        listener_id: id,
        kind: ListenerEventKind::Listening { local_addr },
    });

    tokio::spawn(accept_loop(acceptor, handle.clone(), registry, stop_rx));
    Ok(handle)
}

async fn accept_loop(
    mut acceptor: Box<dyn Acceptor>,
    handle: Arc<ListenerHandle>,
    registry: Arc<SessionRegistry>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let id = handle.id;
    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => break,

            res = acceptor.accept() => match res {
                Ok(link) => {
                    let peer_addr = link.peer_addr;
                    let launch = registry.adopt(link);
                    let session_id = launch.id();
                    handle.connections.fetch_add(1, Ordering::Relaxed);
                    debug!("Listener {} accepted session {} from {:?}", id, session_id, peer_addr);
                    // The Connection notification precedes every event of the new session
                    registry.dispatcher().notify_listener(ListenerEvent {
                        listener_id: id,
                        kind: ListenerEventKind::Connection { session_id, peer_addr },
                    });
                    launch.start();
                }
                Err(e) => {
                    warn!("Listener {} accept failed: {}", id, e);
                    registry.dispatcher().notify_listener(ListenerEvent {
                        listener_id: id,
                        kind: ListenerEventKind::Error(e.into()),
                    });
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(acceptor);
    info!(
        "Listener {} closed after {} connections",
        id,
        handle.connection_count()
    );
    registry.dispatcher().notify_listener(ListenerEvent {
        listener_id: id,
        kind: ListenerEventKind::Closed,
    });
}
