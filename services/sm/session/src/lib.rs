//! Reliable delivery sessions for XMPP streams (XEP-0198 stream management).
//!
//! This crate holds the per-stream acknowledgment state machine, the registry
//! that keeps detached sessions resumable for a bounded time, and the glue
//! that binds a session to a byte transport.
//!
//! ## Features
//!
//! - **Session state machine**: enable, count, acknowledge, detach, resume
//! - **Wrap-tolerant acknowledgments**: 32-bit counters compared modulo 2^32
//! - **Bounded retransmission buffer**: backpressure instead of unbounded growth
//! - **Resumption registry**: TTL expiry with a periodic sweep
//! - **Session takeover**: a resume on a new connection evicts a half-dead one
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use sm_session::{ChannelTransport, SmConfig, StreamManager};
//! use sm_wire::{Namespace, SmElement};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = StreamManager::new(SmConfig::default())?;
//! manager.start();
//!
//! let (transport, mut outgoing) = ChannelTransport::new("client", 64);
//! let stream = manager.open_stream(transport, "127.0.0.1:40000");
//!
//! manager.process(&stream, SmElement::Enable { ns: Namespace::V3, resume: true, max: None })?;
//! stream.send_stanza(Bytes::from_static(b"<message/>")).await?;
//!
//! while let Some(bytes) = outgoing.recv().await {
//!     println!("-> {}", String::from_utf8_lossy(&bytes));
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod manager;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

// Re-export main types
pub use config::{ConfigError, SmConfig};
pub use error::{DetachError, RegistryError, ResumeError, SessionError, StreamError, TransportError, Violation};
pub use manager::{SmEventHandler, StreamManager};
pub use registry::{DetachedSnapshot, ResumptionRegistry};
pub use session::{
    AckOutcome, Outbound, ResumptionId, Resumed, SessionState, StreamManagementSession, TransportLoss,
};
pub use stream::{Departure, ManagedStream};
pub use transport::{listen_tcp, run_writer, ChannelTransport, CloseCallback, Transport};
