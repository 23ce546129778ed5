//! Stream management element model.
//!
//! Every element a peer can exchange on the management channel is a variant of
//! [`SmElement`]. Sequence values travel as plain `u32`; interpretation of those
//! numbers (wrap-around, validation) belongs to the storage and session crates.

use std::fmt;

/// Stanza error namespace used inside `<failed/>`
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Stream error namespace used inside `<stream:error/>`
pub const NS_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// XEP-0198 protocol namespace version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// `urn:xmpp:sm:2`
    V2,
    /// `urn:xmpp:sm:3`
    V3,
}

impl Namespace {
    /// Namespace URI
    pub fn uri(&self) -> &'static str {
        match self {
            Namespace::V2 => "urn:xmpp:sm:2",
            Namespace::V3 => "urn:xmpp:sm:3",
        }
    }

    /// Look up a namespace by URI
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "urn:xmpp:sm:2" => Some(Namespace::V2),
            "urn:xmpp:sm:3" => Some(Namespace::V3),
            _ => None,
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::V3
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

/// Stanza error condition carried by `<failed/>`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCondition {
    /// The request is not valid in the current stream state
    UnexpectedRequest,
    /// The session to resume does not exist (or no longer exists)
    ItemNotFound,
}

impl FailureCondition {
    /// Element name of the condition
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCondition::UnexpectedRequest => "unexpected-request",
            FailureCondition::ItemNotFound => "item-not-found",
        }
    }

    /// Look up a condition by element name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "unexpected-request" => Some(FailureCondition::UnexpectedRequest),
            "item-not-found" => Some(FailureCondition::ItemNotFound),
            _ => None,
        }
    }
}

/// A stream management element
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SmElement {
    /// `<enable/>`: peer asks to turn stream management on
    Enable {
        /// Protocol namespace
        ns: Namespace,
        /// Whether the peer wants a resumable session
        resume: bool,
        /// Preferred maximum resumption time in seconds
        max: Option<u32>,
    },
    /// `<enabled/>`: stream management is on
    Enabled {
        /// Protocol namespace
        ns: Namespace,
        /// Resumption identifier, present when resumption was granted
        id: Option<String>,
        /// Whether the session is resumable
        resume: bool,
        /// Maximum resumption time in seconds
        max: Option<u32>,
        /// Preferred reconnection host
        location: Option<String>,
    },
    /// `<r/>`: request an acknowledgment
    Request {
        /// Protocol namespace
        ns: Namespace,
    },
    /// `<a h="N"/>`: acknowledge N handled stanzas
    Ack {
        /// Protocol namespace
        ns: Namespace,
        /// Handled stanza count, modulo 2^32
        h: u32,
    },
    /// `<resume/>`: resume a detached session on this stream
    Resume {
        /// Protocol namespace
        ns: Namespace,
        /// Identifier from the earlier `<enabled/>`
        previd: String,
        /// Stanzas the peer handled from us
        h: u32,
    },
    /// `<resumed/>`: resumption succeeded
    Resumed {
        /// Protocol namespace
        ns: Namespace,
        /// Identifier of the resumed session
        previd: String,
        /// Stanzas we handled from the peer
        h: u32,
    },
    /// `<failed/>`: negotiation or resumption failed
    Failed {
        /// Protocol namespace
        ns: Namespace,
        /// Stanza error condition
        condition: Option<FailureCondition>,
        /// Stanzas handled, when known
        h: Option<u32>,
        /// Human readable explanation
        text: Option<String>,
    },
}

impl SmElement {
    /// Namespace the element is qualified with
    pub fn namespace(&self) -> Namespace {
        match self {
            SmElement::Enable { ns, .. }
            | SmElement::Enabled { ns, .. }
            | SmElement::Request { ns }
            | SmElement::Ack { ns, .. }
            | SmElement::Resume { ns, .. }
            | SmElement::Resumed { ns, .. }
            | SmElement::Failed { ns, .. } => *ns,
        }
    }

    /// Local element name
    pub fn name(&self) -> &'static str {
        match self {
            SmElement::Enable { .. } => "enable",
            SmElement::Enabled { .. } => "enabled",
            SmElement::Request { .. } => "r",
            SmElement::Ack { .. } => "a",
            SmElement::Resume { .. } => "resume",
            SmElement::Resumed { .. } => "resumed",
            SmElement::Failed { .. } => "failed",
        }
    }

    /// Shorthand for a `<failed/>` with a condition and no extra data
    pub fn failed(ns: Namespace, condition: FailureCondition) -> Self {
        SmElement::Failed {
            ns,
            condition: Some(condition),
            h: None,
            text: None,
        }
    }
}

impl fmt::Display for SmElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}
