//! A session bound to a live transport.
//!
//! [`ManagedStream`] keeps the session behind a short synchronous lock that
//! is never held across an await. Outgoing bytes are queued onto a
//! per-stream outbox while that lock is held, so the order stanzas are
//! counted in is the order they reach the wire. A forwarding task drains the
//! outbox into the transport; a slow transport only delays senders, never the
//! acknowledgment path.

use crate::error::{SessionError, StreamError, TransportError, Violation};
use crate::session::{ResumptionId, Resumed, SessionState, StreamManagementSession, TransportLoss};
use crate::transport::Transport;
use bytes::Bytes;
use sm_storage::{OutboundRecord, SequenceValue};
use sm_wire::{stream_error, FailureCondition, SmElement};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queued writes beyond which senders wait for the transport to catch up
const OUTBOX_HIGH_WATER: usize = 256;

enum Outgoing {
    Write(Bytes),
    Close,
}

/// What a stream gave up when its transport went away
#[derive(Debug)]
pub enum Departure {
    /// Resumable session, ready for the registry
    Detached(StreamManagementSession),
    /// Session discarded with these unacknowledged stanzas
    Discarded(Vec<OutboundRecord>),
    /// The stream had no session left
    Gone,
}

/// One connection's stream management session and transport
pub struct ManagedStream {
    label: String,
    session: Mutex<Option<StreamManagementSession>>,
    transport: Arc<dyn Transport>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    queued: Arc<AtomicUsize>,
    // Woken whenever the forwarder hands a write to the transport
    drained: Arc<Notify>,
    // Woken whenever acknowledgments free buffer space or the session leaves
    capacity: Notify,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ManagedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedStream")
            .field("label", &self.label)
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish()
    }
}

impl ManagedStream {
    /// Bind a session to a transport.
    ///
    /// Spawns the outbox forwarder, so this must run inside a Tokio runtime.
    pub fn new(session: StreamManagementSession, transport: Arc<dyn Transport>) -> Self {
        let label = session.label().to_string();
        let (outbox, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());

        let forwarder = tokio::spawn(forward_outbox(
            label.clone(),
            rx,
            Arc::clone(&transport),
            Arc::clone(&queued),
            Arc::clone(&drained),
        ));

        Self {
            label,
            session: Mutex::new(Some(session)),
            transport,
            outbox,
            queued,
            drained,
            capacity: Notify::new(),
            forwarder: Mutex::new(Some(forwarder)),
        }
    }

    /// Label used in log lines
    pub fn label(&self) -> &str {
        &self.label
    }

    fn lock(&self) -> MutexGuard<'_, Option<StreamManagementSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue bytes behind everything queued before them
    fn enqueue(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.outbox.send(Outgoing::Write(bytes)).is_err() {
            // The forwarder may already have reset the count
            let _ = self
                .queued
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Close the transport once everything queued so far is written
    fn close_after_flush(&self) {
        if self.outbox.send(Outgoing::Close).is_err() {
            self.transport.close();
        }
    }

    /// Wait until the outbox is below its high-water mark
    async fn wait_for_room(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.queued.load(Ordering::Acquire) < OUTBOX_HIGH_WATER || self.outbox.is_closed() {
                return;
            }
            drained.await;
        }
    }

    /// State of the attached session, if any
    pub fn state(&self) -> Option<SessionState> {
        self.lock().as_ref().map(|s| s.state())
    }

    /// Resumption identifier of the attached session
    pub fn resumption_id(&self) -> Option<ResumptionId> {
        self.lock().as_ref().and_then(|s| s.resumption_id().cloned())
    }

    /// Run `f` against the attached session
    pub fn with_session<T>(&self, f: impl FnOnce(&StreamManagementSession) -> T) -> Option<T> {
        self.lock().as_ref().map(f)
    }

    /// Send a stanza, counting and buffering it when stream management is on.
    ///
    /// Before `<enable/>` the stanza passes through untracked and `None` is
    /// returned. A full buffer fails with
    /// [`SessionError::CapacityExceeded`] and nothing is written. Waits only
    /// while the outbox is backed up, and never while holding the session.
    pub async fn send_stanza(&self, stanza: Bytes) -> Result<Option<SequenceValue>, StreamError> {
        self.wait_for_room().await;

        let mut slot = self.lock();
        let session = slot.as_mut().ok_or(StreamError::Detached)?;

        if session.state() == SessionState::Negotiating {
            self.enqueue(stanza)?;
            return Ok(None);
        }

        let outbound = session.on_outbound_stanza(stanza.clone())?;
        // Once buffered the stanza is replayed on resumption even if this write fails
        self.enqueue(stanza)?;
        if let Some(request) = outbound.request {
            self.enqueue(Bytes::from(request.to_xml()))?;
        }
        Ok(Some(outbound.seq))
    }

    /// Send a stanza, waiting for buffer space instead of failing
    pub async fn send_stanza_when_ready(&self, stanza: Bytes) -> Result<Option<SequenceValue>, StreamError> {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.send_stanza(stanza.clone()).await {
                Err(StreamError::Session(SessionError::CapacityExceeded { limit })) => {
                    debug!("[{}] Waiting for acknowledgments ({} buffered)", self.label, limit);
                    notified.await;
                }
                other => return other,
            }
        }
    }

    /// Count a stanza received from the peer, queueing `<a/>` if due
    pub fn handle_inbound_stanza(&self) -> Result<(), StreamError> {
        let mut slot = self.lock();
        let session = slot.as_mut().ok_or(StreamError::Detached)?;

        if session.state() == SessionState::Negotiating {
            return Ok(());
        }
        if let Some(ack) = session.on_inbound_stanza()? {
            self.enqueue(Bytes::from(ack.to_xml()))?;
        }
        Ok(())
    }

    /// Handle `<enable/>`, `<r/>` or `<a/>` from the peer.
    ///
    /// A protocol violation queues a stream error, closes the transport once
    /// it is written and drops the session.
    pub fn handle_element(&self, element: SmElement) -> Result<(), StreamError> {
        let mut slot = self.lock();
        let session = slot.as_mut().ok_or(StreamError::Detached)?;
        let ns = element.namespace();

        let result = match element {
            SmElement::Enable { ns, resume, .. } => match session.enable(ns, resume) {
                Ok(enabled) => Ok(Some(enabled)),
                Err(err) => {
                    let failed = SmElement::failed(ns, FailureCondition::UnexpectedRequest);
                    self.enqueue(Bytes::from(failed.to_xml()))?;
                    Err(err)
                }
            },
            SmElement::Request { .. } => session.on_peer_ack_request().map(Some),
            SmElement::Ack { h, .. } => session.on_peer_ack(SequenceValue(h)).map(|outcome| {
                if outcome.pruned > 0 {
                    self.capacity.notify_waiters();
                }
                None
            }),
            other => {
                debug!("[{}] Ignoring unexpected <{}/>", self.label, other.name());
                let failed = SmElement::failed(ns, FailureCondition::UnexpectedRequest);
                Ok(Some(failed))
            }
        };

        match result {
            Ok(Some(reply)) => {
                self.enqueue(Bytes::from(reply.to_xml()))?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) if err.is_fatal() => {
                warn!("[{}] Closing stream: {}", self.label, err);
                *slot = None;
                let condition = match err {
                    SessionError::ProtocolViolation(Violation::UnsentAcknowledged { .. }) => "undefined-condition",
                    _ => "unsupported-stanza-type",
                };
                if let Err(e) = self.enqueue(Bytes::from(stream_error(condition, &err.to_string()))) {
                    debug!("[{}] Stream error not sent: {}", self.label, e);
                }
                self.close_after_flush();
                self.capacity.notify_waiters();
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Peer closed the stream deliberately
    pub fn formal_close(&self) {
        if let Some(session) = self.lock().as_mut() {
            session.formal_close();
        }
    }

    /// Hand a session from the registry to this stream and replay its buffer
    pub fn attach_resumed(&self, session: StreamManagementSession, resumed: Resumed) -> Result<(), StreamError> {
        let mut slot = self.lock();
        let replayed = resumed.replay.len();
        *slot = Some(session);

        self.enqueue(Bytes::from(resumed.element.to_xml()))?;
        for record in resumed.replay {
            self.enqueue(record.stanza)?;
        }
        if let Some(request) = resumed.request {
            self.enqueue(Bytes::from(request.to_xml()))?;
        }
        info!("[{}] Resumed session attached, {} stanzas replayed", self.label, replayed);
        Ok(())
    }

    /// Send a management element outside the session's own flow
    pub fn send_element(&self, element: &SmElement) -> Result<(), StreamError> {
        self.write_raw(Bytes::from(element.to_xml()))
    }

    /// Queue bytes that stream management does not count, such as the stream
    /// header or the closing tag
    pub fn write_raw(&self, bytes: Bytes) -> Result<(), StreamError> {
        let _slot = self.lock();
        self.enqueue(bytes)?;
        Ok(())
    }

    /// Close the transport now, dropping anything still queued
    pub fn close_transport(&self) {
        self.transport.close();
    }

    /// Write out everything queued, then close the transport
    pub async fn finish(&self) {
        self.close_after_flush();
        let forwarder = self.forwarder.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = forwarder {
            if let Err(e) = handle.await {
                debug!("[{}] Outbox forwarder ended abnormally: {}", self.label, e);
            }
        }
    }

    /// The transport is gone: detach or discard the session
    pub fn transport_lost(&self) -> Departure {
        let taken = self.lock().take();
        let departure = match taken {
            None => Departure::Gone,
            Some(mut session) => match session.on_transport_lost() {
                Ok(TransportLoss::Detached(_)) => Departure::Detached(session),
                Ok(TransportLoss::Discarded { undelivered }) => Departure::Discarded(undelivered),
                Err(err) => {
                    debug!("[{}] Transport loss ignored: {}", self.label, err);
                    Departure::Discarded(session.close())
                }
            },
        };
        self.capacity.notify_waiters();
        departure
    }
}

/// Drain the outbox into the transport, in queue order
async fn forward_outbox(
    label: String,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    transport: Arc<dyn Transport>,
    queued: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outgoing::Write(bytes) => {
                let result = transport.send(bytes).await;
                queued.fetch_sub(1, Ordering::AcqRel);
                drained.notify_waiters();
                if let Err(e) = result {
                    debug!("[{}] Write dropped: {}", label, e);
                    break;
                }
            }
            Outgoing::Close => {
                transport.close();
                break;
            }
        }
    }
    // Anything left behind will never be written
    rx.close();
    queued.store(0, Ordering::Release);
    drained.notify_waiters();
}
