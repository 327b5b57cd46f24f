//! Ordered event delivery with per-session flow control.
//!
//! Every session owns an [`EventEmitter`] that stamps its events with a
//! strictly increasing sequence number and refuses to emit anything after
//! `Closed`. All emitters feed one channel drained by the consumer through
//! [`EventReceiver`]. Data events are accounted against the session's
//! [`FlowControl`]: once undelivered Data reaches the high-water mark the
//! session stops reading from its transport, and reading resumes when the
//! consumer has drained it below the low-water mark.
//!
//! The same accounting tracks when a session's `Connected` event has been
//! taken, since writes queued while connecting are held until then.

use crate::event::{EventKind, ListenerEvent, Notification, SessionEvent, SessionId};
use crate::registry::SessionRegistry;
use futures::Stream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct FlowState {
    buffered: usize,
    paused: bool,
    connected_delivered: bool,
}

/// Backpressure accounting for one session
#[derive(Debug)]
pub(crate) struct FlowControl {
    state: Mutex<FlowState>,
    resume: Notify,
    delivered: Notify,
    high_water: usize,
    low_water: usize,
}

impl FlowControl {
    pub(crate) fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            state: Mutex::new(FlowState::default()),
            resume: Notify::new(),
            delivered: Notify::new(),
            high_water,
            low_water,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for Data handed to the dispatcher; returns whether reads must pause
    pub(crate) fn on_enqueued(&self, len: usize) -> bool {
        let mut state = self.lock();
        state.buffered += len;
        if state.buffered >= self.high_water && !state.paused {
            state.paused = true;
            debug!(
                "Pausing reads: {} bytes undelivered (high water {})",
                state.buffered, self.high_water
            );
        }
        state.paused
    }

    /// Account for Data taken by the consumer
    pub(crate) fn on_delivered(&self, len: usize) {
        let mut state = self.lock();
        state.buffered = state.buffered.saturating_sub(len);
        if state.paused && state.buffered < self.low_water {
            state.paused = false;
            debug!(
                "Resuming reads: {} bytes undelivered (low water {})",
                state.buffered, self.low_water
            );
            // notify_one keeps a permit if the session is not waiting yet
            self.resume.notify_one();
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub(crate) fn buffered(&self) -> usize {
        self.lock().buffered
    }

    /// Largest read that keeps buffered Data at or below the high-water mark
    pub(crate) fn read_budget(&self, chunk: usize) -> usize {
        let state = self.lock();
        if state.paused {
            0
        } else {
            chunk.min(self.high_water.saturating_sub(state.buffered))
        }
    }

    /// Wait until reads may resume
    pub(crate) async fn resumed(&self) {
        loop {
            if !self.is_paused() {
                return;
            }
            self.resume.notified().await;
        }
    }

    /// Record that the consumer took the session's `Connected` event
    pub(crate) fn on_connected_delivered(&self) {
        self.lock().connected_delivered = true;
        self.delivered.notify_one();
    }

    pub(crate) fn is_connected_delivered(&self) -> bool {
        self.lock().connected_delivered
    }

    /// Wait until the consumer has taken the `Connected` event
    pub(crate) async fn connected_delivered(&self) {
        loop {
            if self.is_connected_delivered() {
                return;
            }
            self.delivered.notified().await;
        }
    }
}

/// Channel item: the notification plus the flow it must be credited to
#[derive(Debug)]
pub(crate) struct Queued {
    notification: Notification,
    flow: Option<Arc<FlowControl>>,
}

/// Producer side shared by sessions and listeners
#[derive(Clone, Debug)]
pub(crate) struct EventDispatcher {
    tx: mpsc::UnboundedSender<Queued>,
    high_water: usize,
    low_water: usize,
    registry: Weak<SessionRegistry>,
}

impl EventDispatcher {
    pub(crate) fn new(
        high_water: usize,
        low_water: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Queued>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                high_water,
                low_water,
                registry: Weak::new(),
            },
            rx,
        )
    }

    /// Registry that forgets sessions whose `Closed` event cannot be delivered
    pub(crate) fn bound_to(self, registry: Weak<SessionRegistry>) -> Self {
        Self { registry, ..self }
    }

    /// Emitter for a new session; sequence numbers start at 1
    pub(crate) fn emitter(&self, session_id: SessionId) -> EventEmitter {
        EventEmitter {
            session_id,
            next_sequence: 1,
            flow: Arc::new(FlowControl::new(self.high_water, self.low_water)),
            tx: self.tx.clone(),
            registry: self.registry.clone(),
            finished: false,
        }
    }

    pub(crate) fn notify_listener(&self, event: ListenerEvent) {
        trace!("Listener {} notification {:?}", event.listener_id, event.kind);
        let queued = Queued {
            notification: Notification::Listener(event),
            flow: None,
        };
        if self.tx.send(queued).is_err() {
            debug!("Event receiver dropped, discarding listener notification");
        }
    }
}

/// Per-session producer; owned by the session task
#[derive(Debug)]
pub(crate) struct EventEmitter {
    session_id: SessionId,
    next_sequence: u64,
    flow: Arc<FlowControl>,
    tx: mpsc::UnboundedSender<Queued>,
    registry: Weak<SessionRegistry>,
    finished: bool,
}

impl EventEmitter {
    pub(crate) fn flow(&self) -> &Arc<FlowControl> {
        &self.flow
    }

    /// Stamp and enqueue an event; returns its sequence number
    pub(crate) fn emit(&mut self, kind: EventKind) -> Option<u64> {
        if self.finished {
            warn!(
                "Session {} dropping {} event emitted after close",
                self.session_id,
                kind.name()
            );
            return None;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let closed = kind == EventKind::Closed;
        if closed {
            self.finished = true;
        }
        let connected = matches!(kind, EventKind::Connected { .. });

        let data_len = match &kind {
            EventKind::Data(bytes) => Some(bytes.len()),
            _ => None,
        };
        if let Some(len) = data_len {
            self.flow.on_enqueued(len);
        }

        trace!(
            "Session {} event #{} {}",
            self.session_id,
            sequence,
            kind.name()
        );
        let queued = Queued {
            notification: Notification::Session(SessionEvent {
                session_id: self.session_id,
                sequence,
                kind,
            }),
            flow: (data_len.is_some() || connected).then(|| self.flow.clone()),
        };
        if self.tx.send(queued).is_err() {
            debug!(
                "Event receiver dropped, discarding event #{} of session {}",
                sequence, self.session_id
            );
            // Nobody will ever drain it, so it must not hold the session back
            if let Some(len) = data_len {
                self.flow.on_delivered(len);
            }
            if connected {
                self.flow.on_connected_delivered();
            }
            if closed {
                if let Some(registry) = self.registry.upgrade() {
                    registry.destroy(self.session_id);
                }
            }
        }
        Some(sequence)
    }
}

/// Consumer side of the event stream
///
/// Taking a session's `Closed` event off the stream is what allows the
/// registry to forget that session.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
    registry: Weak<SessionRegistry>,
}

impl EventReceiver {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Queued>, registry: Weak<SessionRegistry>) -> Self {
        Self { rx, registry }
    }

    /// Next notification; `None` once the manager and every session are gone
    pub async fn recv(&mut self) -> Option<Notification> {
        let queued = self.rx.recv().await?;
        Some(self.settle(queued))
    }

    /// Next notification if one is ready
    pub fn try_recv(&mut self) -> Option<Notification> {
        let queued = self.rx.try_recv().ok()?;
        Some(self.settle(queued))
    }

    /// Adapt into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Notification> {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
    }

    fn settle(&self, queued: Queued) -> Notification {
        let Queued { notification, flow } = queued;
        if let Notification::Session(event) = &notification {
            match &event.kind {
                EventKind::Data(bytes) => {
                    if let Some(flow) = flow {
                        flow.on_delivered(bytes.len());
                    }
                }
                EventKind::Connected { .. } => {
                    if let Some(flow) = flow {
                        flow.on_connected_delivered();
                    }
                }
                EventKind::Closed => {
                    if let Some(registry) = self.registry.upgrade() {
                        registry.destroy(event.session_id);
                    }
                }
                _ => {}
            }
        }
        notification
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        // Settle what is still queued; later sends fail and settle themselves
        self.rx.close();
        while let Ok(queued) = self.rx.try_recv() {
            self.settle(queued);
        }
    }
}
