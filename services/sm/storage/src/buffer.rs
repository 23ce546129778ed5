//! Retransmission buffer for stanzas awaiting peer acknowledgment.

use crate::sequence::SequenceValue;
use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The configured bound has been reached
    #[error("unacknowledged buffer full ({limit} stanzas)")]
    CapacityExceeded {
        /// Configured bound
        limit: usize,
    },
    /// A record was appended out of order
    #[error("out of sequence append: expected {expected}, got {got}")]
    OutOfSequence {
        /// Sequence value that would keep the buffer contiguous
        expected: SequenceValue,
        /// Sequence value that was offered
        got: SequenceValue,
    },
}

/// A stanza sent to the peer and not yet acknowledged
#[derive(Clone, Debug)]
pub struct OutboundRecord {
    /// Sequence value the peer acknowledges this stanza with
    pub seq: SequenceValue,
    /// Stanza payload, opaque to this layer
    pub stanza: Bytes,
    /// When the stanza was first handed to the transport
    pub queued_at: Instant,
}

/// Ordered, bounded collection of unacknowledged outbound stanzas
#[derive(Debug)]
pub struct UnacknowledgedBuffer {
    records: VecDeque<OutboundRecord>,
    limit: usize,
}

impl UnacknowledgedBuffer {
    /// Create an empty buffer holding at most `limit` records
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit,
        }
    }

    /// Configured bound
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing awaits acknowledgment
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when another record can be appended
    pub fn has_capacity(&self) -> bool {
        self.records.len() < self.limit
    }

    /// Sequence value of the oldest buffered record
    pub fn oldest_seq(&self) -> Option<SequenceValue> {
        self.records.front().map(|r| r.seq)
    }

    /// Sequence value of the newest buffered record
    pub fn newest_seq(&self) -> Option<SequenceValue> {
        self.records.back().map(|r| r.seq)
    }

    /// Iterate records oldest first
    pub fn iter(&self) -> impl Iterator<Item = &OutboundRecord> {
        self.records.iter()
    }

    /// Append a record tagged with `seq`.
    ///
    /// `seq` must directly follow the newest buffered value.
    pub fn append(&mut self, seq: SequenceValue, stanza: Bytes) -> Result<(), BufferError> {
        if !self.has_capacity() {
            return Err(BufferError::CapacityExceeded { limit: self.limit });
        }
        if let Some(newest) = self.newest_seq() {
            if seq != newest.next() {
                return Err(BufferError::OutOfSequence {
                    expected: newest.next(),
                    got: seq,
                });
            }
        }

        trace!("Buffered stanza seq={} len={}", seq, stanza.len());
        self.records.push_back(OutboundRecord {
            seq,
            stanza,
            queued_at: Instant::now(),
        });
        Ok(())
    }

    /// Remove every record not newer than `acked`, returning how many went.
    ///
    /// The caller validates `acked` first, so it always lies within the
    /// buffered window or equals the value just before it.
    pub fn prune_up_to(&mut self, acked: SequenceValue) -> usize {
        let before = self.records.len();
        while let Some(front) = self.records.front() {
            if front.seq.is_newer_than(acked) {
                break;
            }
            self.records.pop_front();
        }
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(
                "Pruned {} acknowledged stanzas through h={} ({} remaining)",
                removed,
                acked,
                self.records.len()
            );
        }
        removed
    }

    /// Current contents, oldest first, for retransmission.
    ///
    /// The buffer is left untouched so a second replay (after another dropped
    /// connection) sees whatever is still unacknowledged at that point.
    pub fn snapshot_for_replay(&self) -> Vec<OutboundRecord> {
        self.records.iter().cloned().collect()
    }

    /// Empty the buffer, handing back what it held
    pub fn drain(&mut self) -> Vec<OutboundRecord> {
        self.records.drain(..).collect()
    }

    /// Age of the oldest record
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.records.front().map(|r| r.queued_at.elapsed())
    }

    /// True when records carry consecutive sequence values
    pub fn is_contiguous(&self) -> bool {
        self.records
            .iter()
            .zip(self.records.iter().skip(1))
            .all(|(a, b)| b.seq == a.seq.next())
    }
}
