//! Wrap-around sequence arithmetic.
//!
//! Stanza counts are exchanged as unsigned 32-bit values that wrap from
//! `2^32 - 1` back to `0`. Ordering between two values is only meaningful
//! inside a half window: `b` is not older than `a` when the forward distance
//! from `a` to `b` is less than `2^31`.

use std::fmt;

/// Half of the sequence space
pub const HALF_WINDOW: u32 = 1 << 31;

/// A 32-bit stanza sequence value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SequenceValue(pub u32);

impl SequenceValue {
    /// Zero, the value before any stanza was counted
    pub const ZERO: SequenceValue = SequenceValue(0);
    /// Largest value before the counter wraps
    pub const MAX: SequenceValue = SequenceValue(u32::MAX);

    /// Raw value
    pub fn get(self) -> u32 {
        self.0
    }

    /// The value following this one, wrapping to zero after `MAX`
    pub fn next(self) -> Self {
        SequenceValue(self.0.wrapping_add(1))
    }

    /// Forward distance from `self` to `to`, modulo 2^32
    pub fn forward_distance(self, to: SequenceValue) -> u32 {
        to.0.wrapping_sub(self.0)
    }

    /// True if `self` is equal to or ahead of `old` within the half window
    pub fn is_not_older_than(self, old: SequenceValue) -> bool {
        old.forward_distance(self) < HALF_WINDOW
    }

    /// True if `self` is strictly ahead of `other` within the half window
    pub fn is_newer_than(self, other: SequenceValue) -> bool {
        self != other && self.is_not_older_than(other)
    }
}

impl From<u32> for SequenceValue {
    fn from(v: u32) -> Self {
        SequenceValue(v)
    }
}

impl fmt::Display for SequenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic stanza counter with wrap-around
#[derive(Clone, Debug, Default)]
pub struct SequenceCounter {
    value: SequenceValue,
}

impl SequenceCounter {
    /// Counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose current value is `value`
    pub fn starting_at(value: SequenceValue) -> Self {
        Self { value }
    }

    /// Increment and return the new value
    pub fn next(&mut self) -> SequenceValue {
        self.value = self.value.next();
        self.value
    }

    /// Current value
    pub fn current(&self) -> SequenceValue {
        self.value
    }
}

/// Decide whether a peer acknowledgment is acceptable.
///
/// `old_h` is the last value the peer acknowledged (or the session baseline),
/// `last_unacked` the sequence value of the newest stanza still awaiting
/// acknowledgment. A repeat of `old_h` is always fine; anything else must fall
/// within the stanzas actually sent and not yet acknowledged.
pub fn is_valid_ack(
    old_h: SequenceValue,
    received_h: SequenceValue,
    last_unacked: Option<SequenceValue>,
) -> bool {
    if received_h == old_h {
        return true;
    }
    match last_unacked {
        Some(last) => old_h.forward_distance(received_h) <= old_h.forward_distance(last),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = u32::MAX;

    #[test]
    fn test_counter_wraps() {
        let mut counter = SequenceCounter::starting_at(SequenceValue(MAX - 1));
        assert_eq!(counter.next(), SequenceValue(MAX));
        assert_eq!(counter.next(), SequenceValue(0));
        assert_eq!(counter.next(), SequenceValue(1));
        assert_eq!(counter.current(), SequenceValue(1));
        assert_eq!(counter.current(), SequenceValue(1));
    }

    #[test]
    fn test_forward_distance_across_wrap() {
        assert_eq!(SequenceValue(MAX).forward_distance(SequenceValue(0)), 1);
        assert_eq!(SequenceValue(MAX - 2).forward_distance(SequenceValue(3)), 6);
        assert_eq!(SequenceValue(5).forward_distance(SequenceValue(5)), 0);
        assert_eq!(SequenceValue(5).forward_distance(SequenceValue(4)), MAX);
    }

    #[test]
    fn test_ordering_within_half_window() {
        assert!(SequenceValue(0).is_newer_than(SequenceValue(MAX)));
        assert!(!SequenceValue(MAX).is_newer_than(SequenceValue(0)));
        assert!(SequenceValue(7).is_not_older_than(SequenceValue(7)));
        assert!(!SequenceValue(7).is_newer_than(SequenceValue(7)));
        // Exactly half a window apart is treated as older in both directions
        assert!(!SequenceValue(HALF_WINDOW).is_not_older_than(SequenceValue(0)));
        assert!(SequenceValue(HALF_WINDOW - 1).is_not_older_than(SequenceValue(0)));
    }

    /// (old_h, received_h, last_unacked, expected, naive `<=` verdict)
    ///
    /// The naive column is what plain `<=` against `last_unacked` (or against
    /// `old_h` when nothing is outstanding) would answer. Rows where it differs
    /// from the expected verdict are the ones the modular comparison exists for.
    const ACK_TABLE: &[(u32, u32, Option<u32>, bool, bool)] = &[
        // nothing outstanding
        (0, 0, None, true, true),
        (4, 4, None, true, true),
        (4, 3, None, false, true),
        (4, 5, None, false, false),
        (MAX, 0, None, false, true),
        // ordinary window
        (0, 1, Some(1), true, true),
        (0, 2, Some(1), false, false),
        (0, 0, Some(3), true, true),
        (2, 1, Some(3), false, true),
        (2, 3, Some(3), true, true),
        // window spanning the wrap
        (MAX, 0, Some(0), true, true),
        (MAX - 1, MAX, Some(1), true, false),
        (MAX - 2, MAX - 1, Some(0), true, false),
        (MAX - 1, 1, Some(1), true, true),
        (MAX - 1, 2, Some(1), false, false),
        (MAX - 1, MAX - 2, Some(1), false, false),
        (MAX, MAX, Some(0), true, true),
        // window ending exactly at MAX
        (MAX - 3, MAX, Some(MAX), true, true),
        (MAX - 3, 0, Some(MAX), false, true),
    ];

    #[test]
    fn test_ack_validation_table() {
        for &(old, received, last, expected, naive) in ACK_TABLE {
            let verdict = is_valid_ack(
                SequenceValue(old),
                SequenceValue(received),
                last.map(SequenceValue),
            );
            assert_eq!(
                verdict, expected,
                "old_h={} h={} last_unacked={:?}",
                old, received, last
            );

            let naive_verdict = match last {
                Some(l) => received == old || received <= l,
                None => received <= old,
            };
            assert_eq!(
                naive_verdict, naive,
                "naive column mismatch for old_h={} h={}",
                old, received
            );
        }
    }

    #[test]
    fn test_ack_table_covers_naive_failures() {
        let false_accepts = ACK_TABLE
            .iter()
            .filter(|(_, _, _, expected, naive)| !expected && *naive)
            .count();
        let false_rejects = ACK_TABLE
            .iter()
            .filter(|(_, _, _, expected, naive)| *expected && !naive)
            .count();
        assert!(false_accepts > 0);
        assert!(false_rejects > 0);
    }
}
