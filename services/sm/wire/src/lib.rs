//! XEP-0198 wire elements, XML encoding/decoding and element framing.
//!
//! This crate provides the protocol-boundary representation of stream
//! management: the element model, a codec for the namespace-qualified XML
//! forms, and a framer that cuts an XMPP byte stream into first-level elements.
//!
//! ## Elements
//!
//! ```text
//! <enable resume='true'/>                 peer -> server
//! <enabled id='TOKEN' resume='true'/>     server -> peer
//! <r/>                                    either direction
//! <a h='N'/>                              either direction
//! <resume previd='TOKEN' h='N'/>          peer -> server, on a new connection
//! <resumed previd='TOKEN' h='M'/>         server -> peer
//! <failed>condition</failed>              server -> peer
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod element;
pub mod error;
pub mod framing;

// Re-export main types
pub use codec::{parse_element, parse_xml_bool, stream_error};
pub use element::{FailureCondition, Namespace, SmElement, NS_STANZAS, NS_STREAMS};
pub use error::WireError;
pub use framing::{extract_frame, extract_frame_bounded, Frame, DEFAULT_MAX_FRAME_SIZE};
