//! Error types for stream management sessions.

use crate::session::{ResumptionId, SessionState, StreamManagementSession};
use sm_storage::{BufferError, SequenceValue};
use sm_wire::{Namespace, WireError};
use thiserror::Error;

/// Peer behaviour that cannot be recovered from
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The peer acknowledged stanzas that were never sent
    #[error("peer acknowledged h={h} but the last stanza sent was {last_sent}")]
    UnsentAcknowledged {
        /// Value the peer acknowledged
        h: SequenceValue,
        /// Sequence value of the last stanza sent
        last_sent: SequenceValue,
    },
    /// A management element arrived before `<enable/>`
    #[error("<{element}/> received before stream management was enabled")]
    NotEnabled {
        /// Element local name
        element: &'static str,
    },
}

/// Session state machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not allowed in the current state
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the session was in
        state: SessionState,
    },
    /// `<enable/>` on a session that already has stream management
    #[error("stream management is already enabled")]
    AlreadyEnabled,
    /// Unacknowledged buffer is full; delivery must wait for acknowledgments
    #[error("unacknowledged buffer full ({limit} stanzas)")]
    CapacityExceeded {
        /// Configured bound
        limit: usize,
    },
    /// Fatal peer misbehaviour; the session has been torn down
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),
    /// `<resume/>` used a different namespace than `<enable/>` did
    #[error("namespace mismatch: session uses {expected}, request used {got}")]
    NamespaceMismatch {
        /// Namespace the session was enabled with
        expected: Namespace,
        /// Namespace of the request
        got: Namespace,
    },
    /// Buffer invariant broken
    #[error("buffer error: {0}")]
    Buffer(BufferError),
}

impl SessionError {
    /// True if the session was torn down by this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ProtocolViolation(_))
    }
}

impl From<BufferError> for SessionError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::CapacityExceeded { limit } => SessionError::CapacityExceeded { limit },
            other => SessionError::Buffer(other),
        }
    }
}

/// Resumption lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResumeError {
    /// No detached session carries this identifier
    #[error("no detached session for resumption id {0}")]
    NotFound(ResumptionId),
    /// The session existed but its TTL elapsed
    #[error("resumption id {0} has expired")]
    Expired(ResumptionId),
    /// The detached session refused the resumption
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Resumption registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Only detached sessions with an identifier can be registered
    #[error("session in state {state} cannot be registered for resumption")]
    NotResumable {
        /// State the session was in
        state: SessionState,
    },
    /// Identifier already present
    #[error("resumption id {0} is already registered")]
    Duplicate(ResumptionId),
    /// The registry has been shut down
    #[error("resumption registry is shut down")]
    ShutDown,
}

/// A session the registry refused to park, handed back to the caller
#[derive(Error, Debug)]
#[error("{reason}")]
pub struct DetachError {
    /// Why the session was refused
    pub reason: RegistryError,
    /// The refused session, still holding its unacknowledged stanzas
    pub session: StreamManagementSession,
}

/// Transport adapter errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport is closed
    #[error("transport closed")]
    Closed,
    /// I/O failure while writing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a managed stream
#[derive(Error, Debug)]
pub enum StreamError {
    /// Session state machine error
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Resumption failed; the caller falls back to a fresh session
    #[error(transparent)]
    Resume(#[from] ResumeError),
    /// Registry rejected the session
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Malformed element
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The stream no longer owns a session
    #[error("stream has no session attached")]
    Detached,
}
