//! Top-level element framing for an XMPP byte stream.
//!
//! A TCP stream carries one long `<stream:stream>` document. The stream
//! management layer works on the first-level children of that document, so the
//! reader has to cut the byte stream into those children as they arrive.

use crate::error::WireError;
use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

/// Default maximum frame size (64 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// One unit cut from the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<stream:stream ...>` opening tag
    StreamOpen(String),
    /// `</stream:stream>`
    StreamClose,
    /// A complete first-level element (stanza or management element)
    Element(String),
}

fn is_stream_tag(full: &[u8], local: &[u8]) -> bool {
    full == b"stream:stream" || local == b"stream"
}

fn to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Cut one frame from the front of `buffer`.
///
/// Returns the frame and the number of bytes it consumed, or `None` when the
/// buffer does not yet hold a complete frame. The caller advances its buffer.
pub fn extract_frame(buffer: &[u8]) -> Option<(Frame, usize)> {
    let first = buffer
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))?;
    if buffer[first..].starts_with(b"</stream:stream>") {
        return Some((Frame::StreamClose, first + b"</stream:stream>".len()));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut start: Option<usize> = None;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Start(e)) => {
                if start.is_none() && is_stream_tag(e.name().as_ref(), e.name().local_name().as_ref()) {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::StreamOpen(to_string(&buffer[pos..end])), end));
                }
                if depth == 0 {
                    start = Some(pos);
                }
                depth += 1;
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::Element(to_string(&buffer[pos..end])), end));
                }
            }
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(e.name().as_ref(), e.name().local_name().as_ref()) {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::StreamClose, end));
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start {
                        let end = reader.buffer_position() as usize;
                        return Some((Frame::Element(to_string(&buffer[s..end])), end));
                    }
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::Eof) => return None,
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => return None,
            Err(e) => {
                warn!(error = ?e, "XML framing error");
                return None;
            }
        }
    }
}

/// Cut one frame from the front of `buffer`, refusing frames longer than
/// `max_frame_size`.
///
/// Fails as soon as a complete frame, or the unfinished frame buffered so far,
/// is over the limit, so a peer cannot make the reader buffer without bound.
pub fn extract_frame_bounded(buffer: &[u8], max_frame_size: usize) -> Result<Option<(Frame, usize)>, WireError> {
    match extract_frame(buffer) {
        Some((_, used)) if used > max_frame_size => Err(WireError::FrameTooLarge { limit: max_frame_size }),
        Some(found) => Ok(Some(found)),
        None if buffer.len() > max_frame_size => Err(WireError::FrameTooLarge { limit: max_frame_size }),
        None => Ok(None),
    }
}
