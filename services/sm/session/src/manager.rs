//! Stream manager coordinating live streams and the resumption registry
//!
//! The [`StreamManager`] opens a [`ManagedStream`] per connection, routes
//! management elements to it, parks resumable sessions in the registry when
//! their transport drops, and moves them onto a new stream on `<resume/>`.

use crate::config::{ConfigError, SmConfig};
use crate::error::{ResumeError, SessionError, StreamError};
use crate::registry::ResumptionRegistry;
use crate::session::{ResumptionId, SessionState, StreamManagementSession, TransportLoss};
use crate::stream::{Departure, ManagedStream};
use crate::transport::Transport;
use dashmap::DashMap;
use sm_storage::{OutboundRecord, SequenceValue};
use sm_wire::{FailureCondition, Namespace, SmElement};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Trait for observing session lifecycle changes
pub trait SmEventHandler: Send + Sync + std::fmt::Debug {
    /// A resumable session lost its transport and was parked
    fn notify_detached(&self, id: &ResumptionId);
    /// A detached session was resumed on a new stream
    fn notify_resumed(&self, id: &ResumptionId, replayed: usize);
    /// A session was discarded with stanzas the peer never acknowledged
    fn notify_undelivered(&self, label: &str, undelivered: Vec<OutboundRecord>);
}

/// Coordinates managed streams and the resumption registry
#[derive(Debug)]
pub struct StreamManager {
    config: Arc<SmConfig>,
    registry: Arc<ResumptionRegistry>,
    /// Attached resumable streams by resumption identifier
    live: DashMap<ResumptionId, Arc<ManagedStream>>,
    next_stream: AtomicU64,
    event_handler: Option<Arc<dyn SmEventHandler>>,
}

impl StreamManager {
    /// Create a manager with its own registry
    pub fn new(config: SmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(ResumptionRegistry::new(config.resumption_ttl));
        Ok(Self::with_registry(config, registry))
    }

    /// Create a manager around an existing registry
    pub fn with_registry(config: SmConfig, registry: Arc<ResumptionRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            live: DashMap::new(),
            next_stream: AtomicU64::new(1),
            event_handler: None,
        }
    }

    /// Set the lifecycle event handler
    pub fn set_event_handler(&mut self, handler: Arc<dyn SmEventHandler>) {
        self.event_handler = Some(handler);
    }

    /// Start background work (the registry sweep)
    pub fn start(&self) {
        self.registry.start_sweeper();
    }

    /// Shared configuration
    pub fn config(&self) -> &SmConfig {
        &self.config
    }

    /// The resumption registry
    pub fn registry(&self) -> &Arc<ResumptionRegistry> {
        &self.registry
    }

    /// Number of attached resumable streams
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Open a stream for a new connection
    pub fn open_stream(&self, transport: Arc<dyn Transport>, peer: &str) -> Arc<ManagedStream> {
        let n = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}#{}", peer, n);
        debug!("[{}] Stream opened", label);
        let session = StreamManagementSession::new(Arc::clone(&self.config), label);
        Arc::new(ManagedStream::new(session, transport))
    }

    /// Dispatch a management element received on `stream`
    pub fn process(&self, stream: &Arc<ManagedStream>, element: SmElement) -> Result<(), StreamError> {
        match element {
            SmElement::Resume { ns, previd, h } => self
                .resume(stream, ns, ResumptionId::from(previd), SequenceValue(h))
                .map(|_| ()),
            enable @ SmElement::Enable { .. } => {
                stream.handle_element(enable)?;
                if let Some(id) = stream.resumption_id() {
                    self.live.insert(id, Arc::clone(stream));
                }
                Ok(())
            }
            other => stream.handle_element(other),
        }
    }

    /// Resume a detached session on `stream`.
    ///
    /// If the session is still attached to another stream, that stream's
    /// transport is closed and the session detached first. On failure a
    /// `<failed/>` is sent and the stream keeps its fresh session.
    pub fn resume(
        &self,
        stream: &Arc<ManagedStream>,
        ns: Namespace,
        id: ResumptionId,
        h: SequenceValue,
    ) -> Result<SequenceValue, StreamError> {
        let state = stream.state();
        if state != Some(SessionState::Negotiating) {
            let failed = SmElement::failed(ns, FailureCondition::UnexpectedRequest);
            stream.send_element(&failed)?;
            return Err(SessionError::InvalidState {
                operation: "resume",
                state: state.unwrap_or(SessionState::Closed),
            }
            .into());
        }

        if let Some((_, previous)) = self.live.remove(&id) {
            if !Arc::ptr_eq(&previous, stream) {
                info!("[{}] Taking over session {} from {}", stream.label(), id, previous.label());
                previous.close_transport();
                self.connection_closed(&previous);
            }
        }

        match self.registry.resume_with(&id, |session| session.resume(ns, h)) {
            Ok((session, resumed)) => {
                let inbound_h = session.inbound_h();
                let replayed = resumed.replay.len();
                stream.attach_resumed(session, resumed)?;
                self.live.insert(id.clone(), Arc::clone(stream));
                if let Some(handler) = &self.event_handler {
                    handler.notify_resumed(&id, replayed);
                }
                Ok(inbound_h)
            }
            Err(err) => {
                info!("[{}] Resumption of {} failed: {}", stream.label(), id, err);
                stream.send_element(&failure_element(ns, &err))?;
                Err(err.into())
            }
        }
    }

    /// The transport under `stream` is gone: park or discard its session
    pub fn connection_closed(&self, stream: &Arc<ManagedStream>) -> TransportLoss {
        if let Some(id) = stream.resumption_id() {
            self.live.remove_if(&id, |_, live| Arc::ptr_eq(live, stream));
        }

        match stream.transport_lost() {
            Departure::Detached(session) => match self.registry.detach(session) {
                Ok(id) => {
                    if let Some(handler) = &self.event_handler {
                        handler.notify_detached(&id);
                    }
                    TransportLoss::Detached(id)
                }
                Err(mut rejected) => {
                    warn!("[{}] Could not park session: {}", stream.label(), rejected);
                    self.discard(stream.label(), rejected.session.close())
                }
            },
            Departure::Discarded(undelivered) => self.discard(stream.label(), undelivered),
            Departure::Gone => TransportLoss::Discarded { undelivered: Vec::new() },
        }
    }

    fn discard(&self, label: &str, undelivered: Vec<OutboundRecord>) -> TransportLoss {
        if !undelivered.is_empty() {
            if let Some(handler) = &self.event_handler {
                handler.notify_undelivered(label, undelivered.clone());
            }
        }
        TransportLoss::Discarded { undelivered }
    }

    /// Close every live stream and drop every detached session
    pub async fn shutdown(&self) {
        let streams: Vec<Arc<ManagedStream>> = self.live.iter().map(|e| Arc::clone(e.value())).collect();
        self.live.clear();
        for stream in &streams {
            stream.close_transport();
        }
        self.registry.shutdown().await;
        info!("Stream manager shut down ({} live streams closed)", streams.len());
    }
}

/// `<failed/>` answering a rejected `<resume/>`
fn failure_element(ns: Namespace, err: &ResumeError) -> SmElement {
    let (condition, text) = match err {
        ResumeError::NotFound(_) => (FailureCondition::ItemNotFound, Some("Unknown session")),
        ResumeError::Expired(_) => (FailureCondition::ItemNotFound, Some("Session expired")),
        ResumeError::Session(SessionError::ProtocolViolation(_)) => (
            FailureCondition::UnexpectedRequest,
            Some("Acknowledged more stanzas than were sent"),
        ),
        ResumeError::Session(_) => (FailureCondition::UnexpectedRequest, None),
    };
    SmElement::Failed {
        ns,
        condition: Some(condition),
        h: None,
        text: text.map(str::to_string),
    }
}
