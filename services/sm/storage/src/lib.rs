//! Sequence arithmetic and retransmission storage for stream management.
//!
//! This crate holds the pieces of the reliability layer that involve no I/O:
//! the 32-bit wrap-around sequence space, the acknowledgment validator that
//! works inside it, and the bounded buffer of stanzas awaiting acknowledgment.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod sequence;

// Re-export main types
pub use buffer::{BufferError, OutboundRecord, UnacknowledgedBuffer};
pub use sequence::{is_valid_ack, SequenceCounter, SequenceValue, HALF_WINDOW};
