//! Per-stream acknowledgment and resumption state.
//!
//! A [`StreamManagementSession`] counts stanzas in both directions, keeps
//! every outbound stanza until the peer acknowledges it, and decides whether
//! a dropped connection leaves the session resumable. It never touches the
//! network; callers hand it events and transmit the elements it returns.

use crate::config::SmConfig;
use crate::error::{SessionError, Violation};
use bytes::Bytes;
use sm_storage::{is_valid_ack, OutboundRecord, SequenceCounter, SequenceValue, UnacknowledgedBuffer};
use sm_wire::{Namespace, SmElement};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque token identifying a resumable session
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResumptionId(String);

impl ResumptionId {
    /// Fresh, unguessable identifier
    pub fn generate() -> Self {
        ResumptionId(Uuid::new_v4().simple().to_string())
    }

    /// Identifier as sent on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ResumptionId {
    fn from(s: String) -> Self {
        ResumptionId(s)
    }
}

impl From<&str> for ResumptionId {
    fn from(s: &str) -> Self {
        ResumptionId(s.to_string())
    }
}

impl fmt::Display for ResumptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Stream open, `<enable/>` not yet received
    Negotiating,
    /// Counting and buffering on a live transport
    Active,
    /// Transport gone, waiting in the resumption registry
    Detached,
    /// Resumption window elapsed
    Expired,
    /// Torn down for good
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Detached => "detached",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Result of counting an outbound stanza
#[derive(Debug)]
pub struct Outbound {
    /// Sequence value assigned to the stanza
    pub seq: SequenceValue,
    /// `<r/>` to send after the stanza, when the request frequency is reached
    pub request: Option<SmElement>,
}

/// Result of applying a peer acknowledgment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckOutcome {
    /// Value acknowledged
    pub acknowledged: SequenceValue,
    /// Records removed from the buffer
    pub pruned: usize,
    /// Records still awaiting acknowledgment
    pub outstanding: usize,
}

/// What happened to a session when its transport went away
#[derive(Debug)]
pub enum TransportLoss {
    /// Session is detached and can be resumed under this identifier
    Detached(ResumptionId),
    /// Session is gone; these stanzas were never acknowledged
    Discarded {
        /// Unacknowledged stanzas, oldest first
        undelivered: Vec<OutboundRecord>,
    },
}

/// Elements to send on the new transport after a successful resumption
#[derive(Debug)]
pub struct Resumed {
    /// `<resumed/>` carrying our inbound count
    pub element: SmElement,
    /// Unacknowledged stanzas to retransmit, oldest first
    pub replay: Vec<OutboundRecord>,
    /// `<r/>` to send after the replay
    pub request: Option<SmElement>,
}

/// Stream management state for one logical session
#[derive(Debug)]
pub struct StreamManagementSession {
    label: String,
    config: Arc<SmConfig>,
    state: SessionState,
    namespace: Option<Namespace>,
    outbound: SequenceCounter,
    inbound: SequenceCounter,
    // Value the peer implicitly acknowledges before its first <a/>
    ack_baseline: SequenceValue,
    last_acked_by_peer: Option<SequenceValue>,
    unacked: UnacknowledgedBuffer,
    resumption_id: Option<ResumptionId>,
    resumption_permitted: bool,
    resumable: bool,
    inbound_since_ack: u32,
    resume_count: u32,
}

impl StreamManagementSession {
    /// Create a session in the negotiating state
    pub fn new(config: Arc<SmConfig>, label: impl Into<String>) -> Self {
        let limit = config.max_unacked_buffer_size;
        Self {
            label: label.into(),
            resumption_permitted: config.resumption_enabled,
            config,
            state: SessionState::Negotiating,
            namespace: None,
            outbound: SequenceCounter::new(),
            inbound: SequenceCounter::new(),
            ack_baseline: SequenceValue::ZERO,
            last_acked_by_peer: None,
            unacked: UnacknowledgedBuffer::new(limit),
            resumption_id: None,
            resumable: false,
            inbound_since_ack: 0,
            resume_count: 0,
        }
    }

    /// Start both counters at the given values instead of zero
    pub fn with_sequence_baseline(mut self, outbound: SequenceValue, inbound: SequenceValue) -> Self {
        self.outbound = SequenceCounter::starting_at(outbound);
        self.ack_baseline = outbound;
        self.inbound = SequenceCounter::starting_at(inbound);
        self
    }

    /// Allow or refuse resumption for this session, e.g. by authentication policy
    pub fn set_resumption_permitted(&mut self, permitted: bool) {
        self.resumption_permitted = permitted && self.config.resumption_enabled;
    }

    /// Label used in log lines
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once `<enable/>` succeeded and the session is attached
    pub fn is_enabled(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Namespace negotiated by `<enable/>`
    pub fn namespace(&self) -> Option<Namespace> {
        self.namespace
    }

    /// Resumption identifier, if resumption was granted
    pub fn resumption_id(&self) -> Option<&ResumptionId> {
        self.resumption_id.as_ref()
    }

    /// True if losing the transport will detach rather than discard
    pub fn is_resumable(&self) -> bool {
        self.resumable && self.resumption_id.is_some()
    }

    /// Sequence value of the last stanza sent
    pub fn outbound_h(&self) -> SequenceValue {
        self.outbound.current()
    }

    /// Number of stanzas handled from the peer, modulo 2^32
    pub fn inbound_h(&self) -> SequenceValue {
        self.inbound.current()
    }

    /// Last value the peer acknowledged
    pub fn last_acked_by_peer(&self) -> Option<SequenceValue> {
        self.last_acked_by_peer
    }

    /// Stanzas awaiting acknowledgment
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// True if another stanza can be sent without exceeding the buffer bound
    pub fn has_capacity(&self) -> bool {
        self.unacked.has_capacity()
    }

    /// Unacknowledged stanzas, oldest first
    pub fn unacked(&self) -> impl Iterator<Item = &OutboundRecord> {
        self.unacked.iter()
    }

    /// Successful resumptions so far
    pub fn resume_count(&self) -> u32 {
        self.resume_count
    }

    /// Handle `<enable/>` and produce the `<enabled/>` reply
    pub fn enable(&mut self, ns: Namespace, request_resumption: bool) -> Result<SmElement, SessionError> {
        match self.state {
            SessionState::Negotiating => {}
            SessionState::Active => return Err(SessionError::AlreadyEnabled),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "enable",
                    state,
                })
            }
        }

        self.namespace = Some(ns);
        self.resumable = request_resumption && self.resumption_permitted;
        if self.resumable {
            self.resumption_id = Some(ResumptionId::generate());
        }
        self.state = SessionState::Active;

        info!(
            "[{}] Stream management enabled ({}), resumable={}",
            self.label,
            ns.uri(),
            self.resumable
        );

        let max = if self.resumable && self.config.advertise_max {
            Some(u32::try_from(self.config.resumption_ttl.as_secs()).unwrap_or(u32::MAX))
        } else {
            None
        };
        let location = match ns {
            Namespace::V3 if self.resumable => self.config.location.clone(),
            _ => None,
        };

        Ok(SmElement::Enabled {
            ns,
            id: self.resumption_id.as_ref().map(|id| id.to_string()),
            resume: self.resumable,
            max,
            location,
        })
    }

    /// Count and buffer a stanza about to be sent.
    ///
    /// Nothing changes when the buffer is full; the caller may retry once
    /// acknowledgments free space.
    pub fn on_outbound_stanza(&mut self, stanza: Bytes) -> Result<Outbound, SessionError> {
        let ns = self.require_active("send")?;
        if !self.unacked.has_capacity() {
            warn!(
                "[{}] Unacknowledged buffer full ({} stanzas, oldest waiting {:?}), holding back delivery",
                self.label,
                self.unacked.limit(),
                self.unacked.oldest_age().unwrap_or_default()
            );
            return Err(SessionError::CapacityExceeded {
                limit: self.unacked.limit(),
            });
        }

        let seq = self.outbound.current().next();
        self.unacked.append(seq, stanza)?;
        self.outbound.next();

        let freq = self.config.request_frequency as usize;
        let request = if freq > 0 && self.unacked.len() % freq == 0 {
            Some(SmElement::Request { ns })
        } else {
            None
        };

        debug_assert!(self.is_consistent());
        Ok(Outbound { seq, request })
    }

    /// Count a stanza handled from the peer.
    ///
    /// Returns an unsolicited `<a/>` when the configured ack frequency is reached.
    pub fn on_inbound_stanza(&mut self) -> Result<Option<SmElement>, SessionError> {
        let ns = self.require_active("receive")?;
        self.inbound.next();
        self.inbound_since_ack += 1;

        if self.config.ack_frequency > 0 && self.inbound_since_ack >= self.config.ack_frequency {
            return Ok(Some(self.ack_element(ns)));
        }
        Ok(None)
    }

    /// Answer `<r/>` with our inbound count
    pub fn on_peer_ack_request(&mut self) -> Result<SmElement, SessionError> {
        let ns = self.require_enabled("r")?;
        Ok(self.ack_element(ns))
    }

    /// Apply `<a h='..'/>` from the peer.
    ///
    /// An acknowledgment of stanzas never sent closes the session.
    pub fn on_peer_ack(&mut self, h: SequenceValue) -> Result<AckOutcome, SessionError> {
        self.require_enabled("a")?;
        self.apply_ack(h)
    }

    /// Handle loss of the underlying transport
    pub fn on_transport_lost(&mut self) -> Result<TransportLoss, SessionError> {
        match self.state {
            SessionState::Active if self.is_resumable() => {
                self.state = SessionState::Detached;
                let id = self
                    .resumption_id
                    .clone()
                    .ok_or(SessionError::InvalidState {
                        operation: "detach",
                        state: self.state,
                    })?;
                info!(
                    "[{}] Transport lost, detached with {} unacknowledged stanzas",
                    self.label,
                    self.unacked.len()
                );
                Ok(TransportLoss::Detached(id))
            }
            SessionState::Active | SessionState::Negotiating => {
                let undelivered = self.close();
                if !undelivered.is_empty() {
                    info!(
                        "[{}] Transport lost, discarding session with {} unacknowledged stanzas",
                        self.label,
                        undelivered.len()
                    );
                }
                Ok(TransportLoss::Discarded { undelivered })
            }
            state => Err(SessionError::InvalidState {
                operation: "transport loss",
                state,
            }),
        }
    }

    /// Peer closed the stream deliberately; the session will not be resumable
    pub fn formal_close(&mut self) {
        if self.resumable {
            debug!("[{}] Stream closed by peer, resumption withdrawn", self.label);
        }
        self.resumable = false;
    }

    /// Resume a detached session for a peer that handled `h` of our stanzas
    pub fn resume(&mut self, ns: Namespace, h: SequenceValue) -> Result<Resumed, SessionError> {
        if self.state != SessionState::Detached {
            return Err(SessionError::InvalidState {
                operation: "resume",
                state: self.state,
            });
        }
        let expected = self.namespace.unwrap_or_default();
        if expected != ns {
            return Err(SessionError::NamespaceMismatch { expected, got: ns });
        }
        let previd = self
            .resumption_id
            .as_ref()
            .map(|id| id.to_string())
            .ok_or(SessionError::InvalidState {
                operation: "resume",
                state: self.state,
            })?;

        self.apply_ack(h)?;

        self.state = SessionState::Active;
        self.resume_count += 1;
        self.inbound_since_ack = 0;

        let replay = self.unacked.snapshot_for_replay();
        info!(
            "[{}] Session resumed (peer h={}, replaying {} stanzas)",
            self.label,
            h,
            replay.len()
        );

        let request = (!replay.is_empty()).then_some(SmElement::Request { ns });
        Ok(Resumed {
            element: SmElement::Resumed {
                ns,
                previd,
                h: self.inbound.current().get(),
            },
            replay,
            request,
        })
    }

    /// Mark a detached session expired, handing back what it never delivered
    pub fn expire(&mut self) -> Vec<OutboundRecord> {
        self.state = SessionState::Expired;
        self.resumable = false;
        self.unacked.drain()
    }

    /// Tear the session down, handing back what it never delivered
    pub fn close(&mut self) -> Vec<OutboundRecord> {
        self.state = SessionState::Closed;
        self.resumable = false;
        self.unacked.drain()
    }

    /// Check the buffer against the counters.
    ///
    /// Holds after every operation on an active or detached session: the
    /// buffer is contiguous, starts right after the last acknowledged value
    /// and ends at the last value sent.
    pub fn is_consistent(&self) -> bool {
        if !matches!(self.state, SessionState::Active | SessionState::Detached) {
            return self.unacked.is_empty();
        }
        let acked = self.acked_through();
        match (self.unacked.oldest_seq(), self.unacked.newest_seq()) {
            (Some(oldest), Some(newest)) => {
                self.unacked.is_contiguous()
                    && oldest == acked.next()
                    && newest == self.outbound.current()
            }
            _ => acked == self.outbound.current(),
        }
    }

    fn acked_through(&self) -> SequenceValue {
        self.last_acked_by_peer.unwrap_or(self.ack_baseline)
    }

    fn ack_element(&mut self, ns: Namespace) -> SmElement {
        self.inbound_since_ack = 0;
        SmElement::Ack {
            ns,
            h: self.inbound.current().get(),
        }
    }

    fn apply_ack(&mut self, h: SequenceValue) -> Result<AckOutcome, SessionError> {
        let old_h = self.acked_through();
        if !is_valid_ack(old_h, h, self.unacked.newest_seq()) {
            let last_sent = self.outbound.current();
            warn!(
                "[{}] Peer acknowledged h={} but only {} stanzas were sent (last acknowledged {}), closing",
                self.label, h, last_sent, old_h
            );
            let dropped = self.close();
            debug!("[{}] Dropped {} unacknowledged stanzas", self.label, dropped.len());
            return Err(Violation::UnsentAcknowledged { h, last_sent }.into());
        }

        let pruned = self.unacked.prune_up_to(h);
        self.last_acked_by_peer = Some(h);
        debug_assert!(self.is_consistent());

        Ok(AckOutcome {
            acknowledged: h,
            pruned,
            outstanding: self.unacked.len(),
        })
    }

    fn require_active(&self, operation: &'static str) -> Result<Namespace, SessionError> {
        match (self.state, self.namespace) {
            (SessionState::Active, Some(ns)) => Ok(ns),
            (state, _) => Err(SessionError::InvalidState { operation, state }),
        }
    }

    // Management elements before <enable/> are fatal
    fn require_enabled(&mut self, element: &'static str) -> Result<Namespace, SessionError> {
        if self.state == SessionState::Negotiating {
            warn!("[{}] <{}/> received before <enable/>, closing", self.label, element);
            self.close();
            return Err(Violation::NotEnabled { element }.into());
        }
        self.require_active(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> SmConfig {
        SmConfig {
            request_frequency: 0,
            ..SmConfig::default()
        }
    }

    fn session_with(config: SmConfig) -> StreamManagementSession {
        StreamManagementSession::new(Arc::new(config), "test")
    }

    fn enabled_session() -> StreamManagementSession {
        let mut session = session_with(config());
        session.enable(Namespace::V3, true).unwrap();
        session
    }

    fn send(session: &mut StreamManagementSession, n: usize) {
        for i in 0..n {
            session
                .on_outbound_stanza(Bytes::from(format!("<message id='{}'/>", i)))
                .unwrap();
        }
    }

    fn unacked_seqs(session: &StreamManagementSession) -> Vec<u32> {
        session.unacked().map(|r| r.seq.get()).collect()
    }

    #[test]
    fn test_enable_grants_resumption() {
        let mut session = session_with(SmConfig {
            location: Some("sm.example.net:5222".into()),
            ..config()
        });
        let enabled = session.enable(Namespace::V3, true).unwrap();

        let id = session.resumption_id().unwrap().to_string();
        assert_eq!(
            enabled,
            SmElement::Enabled {
                ns: Namespace::V3,
                id: Some(id),
                resume: true,
                max: Some(300),
                location: Some("sm.example.net:5222".into()),
            }
        );
        assert!(session.is_resumable());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_enable_without_resumption() {
        let mut session = session_with(config());
        let enabled = session.enable(Namespace::V2, false).unwrap();
        assert_eq!(
            enabled,
            SmElement::Enabled {
                ns: Namespace::V2,
                id: None,
                resume: false,
                max: None,
                location: None,
            }
        );
        assert!(!session.is_resumable());
    }

    #[test]
    fn test_enable_v2_omits_location() {
        let mut session = session_with(SmConfig {
            location: Some("sm.example.net".into()),
            ..config()
        });
        match session.enable(Namespace::V2, true).unwrap() {
            SmElement::Enabled { location, resume, .. } => {
                assert!(resume);
                assert_eq!(location, None);
            }
            other => panic!("unexpected element {:?}", other),
        }
    }

    #[test]
    fn test_enable_refused_by_policy() {
        let mut session = session_with(config());
        session.set_resumption_permitted(false);
        session.enable(Namespace::V3, true).unwrap();
        assert!(!session.is_resumable());
        assert!(session.resumption_id().is_none());
    }

    #[test]
    fn test_enable_twice() {
        let mut session = enabled_session();
        assert_eq!(
            session.enable(Namespace::V3, true).unwrap_err(),
            SessionError::AlreadyEnabled
        );
    }

    #[test]
    fn test_send_before_enable_rejected() {
        let mut session = session_with(config());
        let err = session.on_outbound_stanza(Bytes::from_static(b"<message/>")).unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                operation: "send",
                state: SessionState::Negotiating
            }
        );
    }

    #[test]
    fn test_request_before_enable_is_fatal() {
        let mut session = session_with(config());
        let err = session.on_peer_ack_request().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Closed);

        let mut session = session_with(config());
        let err = session.on_peer_ack(SequenceValue(0)).unwrap_err();
        assert_eq!(
            err,
            SessionError::ProtocolViolation(Violation::NotEnabled { element: "a" })
        );
    }

    #[test]
    fn test_outbound_assigns_consecutive_values() {
        let mut session = enabled_session();
        let a = session.on_outbound_stanza(Bytes::from_static(b"a")).unwrap();
        let b = session.on_outbound_stanza(Bytes::from_static(b"b")).unwrap();
        assert_eq!(a.seq, SequenceValue(1));
        assert_eq!(b.seq, SequenceValue(2));
        assert_eq!(session.outbound_h(), SequenceValue(2));
        assert_eq!(unacked_seqs(&session), vec![1, 2]);
    }

    #[test]
    fn test_request_frequency() {
        let mut session = session_with(SmConfig {
            request_frequency: 3,
            ..config()
        });
        session.enable(Namespace::V3, false).unwrap();

        let requests: Vec<bool> = (0..6)
            .map(|_| {
                session
                    .on_outbound_stanza(Bytes::from_static(b"x"))
                    .unwrap()
                    .request
                    .is_some()
            })
            .collect();
        assert_eq!(requests, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_ack_frequency() {
        let mut session = session_with(SmConfig {
            ack_frequency: 2,
            ..config()
        });
        session.enable(Namespace::V3, false).unwrap();

        assert_eq!(session.on_inbound_stanza().unwrap(), None);
        assert_eq!(
            session.on_inbound_stanza().unwrap(),
            Some(SmElement::Ack { ns: Namespace::V3, h: 2 })
        );
        assert_eq!(session.on_inbound_stanza().unwrap(), None);
    }

    #[test]
    fn test_ack_request_reports_inbound_count() {
        let mut session = enabled_session();
        for _ in 0..4 {
            assert_eq!(session.on_inbound_stanza().unwrap(), None);
        }
        assert_eq!(
            session.on_peer_ack_request().unwrap(),
            SmElement::Ack { ns: Namespace::V3, h: 4 }
        );
    }

    #[test]
    fn test_capacity_exceeded_is_recoverable() {
        let mut session = session_with(SmConfig {
            max_unacked_buffer_size: 2,
            ..config()
        });
        session.enable(Namespace::V3, true).unwrap();
        send(&mut session, 2);

        let err = session.on_outbound_stanza(Bytes::from_static(b"late")).unwrap_err();
        assert_eq!(err, SessionError::CapacityExceeded { limit: 2 });
        assert!(!err.is_fatal());
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.outbound_h(), SequenceValue(2));

        session.on_peer_ack(SequenceValue(1)).unwrap();
        let out = session.on_outbound_stanza(Bytes::from_static(b"late")).unwrap();
        assert_eq!(out.seq, SequenceValue(3));
        assert!(session.is_consistent());
    }

    #[test]
    fn test_monotonic_pruning() {
        let mut session = enabled_session();
        send(&mut session, 5);

        let outcome = session.on_peer_ack(SequenceValue(2)).unwrap();
        assert_eq!(
            outcome,
            AckOutcome {
                acknowledged: SequenceValue(2),
                pruned: 2,
                outstanding: 3
            }
        );
        assert_eq!(unacked_seqs(&session), vec![3, 4, 5]);

        let outcome = session.on_peer_ack(SequenceValue(5)).unwrap();
        assert_eq!(outcome.pruned, 3);
        assert_eq!(session.unacked_len(), 0);
        assert!(session.is_consistent());
    }

    #[test]
    fn test_repeated_ack_is_idempotent() {
        let mut session = enabled_session();
        send(&mut session, 3);
        session.on_peer_ack(SequenceValue(2)).unwrap();

        let outcome = session.on_peer_ack(SequenceValue(2)).unwrap();
        assert_eq!(outcome.pruned, 0);
        assert_eq!(unacked_seqs(&session), vec![3]);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_ack_of_unsent_stanzas_closes_session() {
        let mut session = enabled_session();
        send(&mut session, 3);

        let err = session.on_peer_ack(SequenceValue(4)).unwrap_err();
        assert_eq!(
            err,
            SessionError::ProtocolViolation(Violation::UnsentAcknowledged {
                h: SequenceValue(4),
                last_sent: SequenceValue(3)
            })
        );
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.unacked_len(), 0);
    }

    #[test]
    fn test_ack_with_nothing_sent_must_be_zero() {
        let mut session = enabled_session();
        assert!(session.on_peer_ack(SequenceValue(0)).is_ok());

        let mut session = enabled_session();
        assert!(session.on_peer_ack(SequenceValue(1)).unwrap_err().is_fatal());
    }

    #[test]
    fn test_backwards_ack_rejected() {
        let mut session = enabled_session();
        send(&mut session, 5);
        session.on_peer_ack(SequenceValue(4)).unwrap();

        let err = session.on_peer_ack(SequenceValue(3)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_wrap_tolerance() {
        let mut session = session_with(config()).with_sequence_baseline(SequenceValue::MAX, SequenceValue::ZERO);
        session.enable(Namespace::V3, true).unwrap();

        let out = session.on_outbound_stanza(Bytes::from_static(b"wrapped")).unwrap();
        assert_eq!(out.seq, SequenceValue(0));

        let outcome = session.on_peer_ack(SequenceValue(0)).unwrap();
        assert_eq!(outcome.pruned, 1);
        assert_eq!(session.unacked_len(), 0);

        // Nothing new sent since: repeating h=0 is a no-op
        let outcome = session.on_peer_ack(SequenceValue(0)).unwrap();
        assert_eq!(outcome.pruned, 0);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.is_consistent());
    }

    #[test]
    fn test_window_spanning_wrap() {
        let mut session =
            session_with(config()).with_sequence_baseline(SequenceValue(u32::MAX - 2), SequenceValue::ZERO);
        session.enable(Namespace::V3, false).unwrap();
        send(&mut session, 5);
        assert_eq!(unacked_seqs(&session), vec![u32::MAX - 1, u32::MAX, 0, 1, 2]);

        session.on_peer_ack(SequenceValue(u32::MAX)).unwrap();
        assert_eq!(unacked_seqs(&session), vec![0, 1, 2]);

        session.on_peer_ack(SequenceValue(1)).unwrap();
        assert_eq!(unacked_seqs(&session), vec![2]);

        assert!(session.on_peer_ack(SequenceValue(3)).unwrap_err().is_fatal());
    }

    #[test]
    fn test_inbound_counter_wraps() {
        let mut session =
            session_with(config()).with_sequence_baseline(SequenceValue::ZERO, SequenceValue::MAX);
        session.enable(Namespace::V3, false).unwrap();
        session.on_inbound_stanza().unwrap();
        assert_eq!(
            session.on_peer_ack_request().unwrap(),
            SmElement::Ack { ns: Namespace::V3, h: 0 }
        );
    }

    #[test]
    fn test_transport_loss_detaches_resumable() {
        let mut session = enabled_session();
        send(&mut session, 2);
        let id = session.resumption_id().cloned().unwrap();

        match session.on_transport_lost().unwrap() {
            TransportLoss::Detached(detached) => assert_eq!(detached, id),
            other => panic!("expected detach, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Detached);
        assert_eq!(session.unacked_len(), 2);
        assert!(session.is_consistent());
    }

    #[test]
    fn test_transport_loss_discards_non_resumable() {
        let mut session = session_with(config());
        session.enable(Namespace::V3, false).unwrap();
        send(&mut session, 3);
        session.on_peer_ack(SequenceValue(1)).unwrap();

        match session.on_transport_lost().unwrap() {
            TransportLoss::Discarded { undelivered } => {
                let seqs: Vec<u32> = undelivered.iter().map(|r| r.seq.get()).collect();
                assert_eq!(seqs, vec![2, 3]);
            }
            other => panic!("expected discard, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_formal_close_prevents_detach() {
        let mut session = enabled_session();
        send(&mut session, 1);
        session.formal_close();
        assert!(matches!(
            session.on_transport_lost().unwrap(),
            TransportLoss::Discarded { .. }
        ));
    }

    #[test]
    fn test_transport_loss_twice() {
        let mut session = enabled_session();
        session.on_transport_lost().unwrap();
        assert!(matches!(
            session.on_transport_lost(),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_resumption_round_trip() {
        let mut session = enabled_session();
        send(&mut session, 3);
        for _ in 0..7 {
            session.on_inbound_stanza().unwrap();
        }
        let id = session.resumption_id().cloned().unwrap();
        session.on_transport_lost().unwrap();

        let resumed = session.resume(Namespace::V3, SequenceValue(1)).unwrap();
        assert_eq!(
            resumed.element,
            SmElement::Resumed {
                ns: Namespace::V3,
                previd: id.to_string(),
                h: 7
            }
        );
        let replayed: Vec<Bytes> = resumed.replay.iter().map(|r| r.stanza.clone()).collect();
        assert_eq!(
            replayed,
            vec![
                Bytes::from("<message id='1'/>"),
                Bytes::from("<message id='2'/>")
            ]
        );
        // Replayed stanzas keep the values they were first sent with
        assert_eq!(resumed.replay.iter().map(|r| r.seq.get()).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(resumed.request, Some(SmElement::Request { ns: Namespace::V3 }));
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.resume_count(), 1);

        // Counting continues from where it left off
        let out = session.on_outbound_stanza(Bytes::from_static(b"next")).unwrap();
        assert_eq!(out.seq, SequenceValue(4));
    }

    #[test]
    fn test_resume_with_everything_acknowledged() {
        let mut session = enabled_session();
        send(&mut session, 2);
        session.on_transport_lost().unwrap();

        let resumed = session.resume(Namespace::V3, SequenceValue(2)).unwrap();
        assert!(resumed.replay.is_empty());
        assert_eq!(resumed.request, None);
    }

    #[test]
    fn test_resume_rejects_backwards_h() {
        let mut session = enabled_session();
        send(&mut session, 5);
        session.on_peer_ack(SequenceValue(4)).unwrap();
        session.on_transport_lost().unwrap();

        let err = session.resume(Namespace::V3, SequenceValue(3)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_resume_namespace_mismatch_is_not_fatal() {
        let mut session = enabled_session();
        session.on_transport_lost().unwrap();

        let err = session.resume(Namespace::V2, SequenceValue(0)).unwrap_err();
        assert_eq!(
            err,
            SessionError::NamespaceMismatch {
                expected: Namespace::V3,
                got: Namespace::V2
            }
        );
        assert!(!err.is_fatal());
        assert_eq!(session.state(), SessionState::Detached);
    }

    #[test]
    fn test_resume_requires_detached() {
        let mut session = enabled_session();
        assert!(matches!(
            session.resume(Namespace::V3, SequenceValue(0)),
            Err(SessionError::InvalidState { operation: "resume", .. })
        ));
    }

    #[test]
    fn test_expire_drains_buffer() {
        let mut session = enabled_session();
        send(&mut session, 2);
        session.on_transport_lost().unwrap();
        let dropped = session.expire();
        assert_eq!(dropped.len(), 2);
        assert_eq!(session.state(), SessionState::Expired);
        assert!(session.is_consistent());
    }

    #[test]
    fn test_max_reflects_ttl() {
        let mut session = session_with(SmConfig {
            resumption_ttl: Duration::from_secs(42),
            ..config()
        });
        match session.enable(Namespace::V3, true).unwrap() {
            SmElement::Enabled { max, .. } => assert_eq!(max, Some(42)),
            other => panic!("unexpected element {:?}", other),
        }
    }

    #[test]
    fn test_resumption_ids_are_unique() {
        let a = ResumptionId::generate();
        let b = ResumptionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
