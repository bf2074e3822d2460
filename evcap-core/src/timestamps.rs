//! Timestamp reconstruction.
//!
//! Devices send a narrow tick counter (15 bits on the packed protocol, 16 bits
//! on the serial protocol). The tracker expands it into a 31-bit wrapped
//! timestamp plus an overflow counter, which together form the full 64-bit
//! timestamp returned by [`TimestampTracker::full`]. One tick is 1 µs on both
//! protocols.
//!
//! The tracker is a pure state machine; callers log anomalies.

use crate::types::full_timestamp;

/// Result of feeding one timestamp symbol to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Full timestamp after the update
    pub full: i64,
    /// The 32-bit expanded space wrapped: the overflow counter was incremented
    pub big_wrap: bool,
}

/// Wrap-expanding timestamp state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampTracker {
    last_short: u16,
    wrap_add: i32,
    wrap_overflow: i32,
    last: i32,
    current: i32,
}

impl TimestampTracker {
    /// Creates a tracker at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current wrapped timestamp in µs.
    #[inline]
    pub fn current(&self) -> i32 {
        self.current
    }

    /// Previous wrapped timestamp in µs.
    #[inline]
    pub fn last(&self) -> i32 {
        self.last
    }

    /// Number of big wraps since start or the last reset.
    #[inline]
    pub fn overflow(&self) -> i32 {
        self.wrap_overflow
    }

    /// Accumulated wrap offset added to the narrow counter.
    #[inline]
    pub fn wrap_add(&self) -> i32 {
        self.wrap_add
    }

    /// Full 64-bit timestamp in µs.
    #[inline]
    pub fn full(&self) -> i64 {
        full_timestamp(self.wrap_overflow, self.current)
    }

    /// Returns false if the last update moved time backwards.
    #[inline]
    pub fn is_monotonic(&self) -> bool {
        self.current >= self.last
    }

    /// Zeroes every field, including the overflow counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Applies an absolute 15-bit counter value from a packed timestamp word.
    ///
    /// Wraps of that counter arrive as separate symbols, see [`Self::apply_wrap`].
    pub fn apply_counter(&mut self, counter: u16) -> Advance {
        self.last = self.current;
        self.current = self.wrap_add + i32::from(counter & 0x7FFF);

        Advance {
            full: self.full(),
            big_wrap: false,
        }
    }

    /// Applies a packed wrap symbol announcing `count` wraps of `wrap_step` ticks.
    ///
    /// When the accumulated offset would leave the 31-bit space, the remainder
    /// is carried into a fresh offset and the overflow counter is incremented.
    pub fn apply_wrap(&mut self, count: u16, wrap_step: i32) -> Advance {
        let wrap_sum = i64::from(self.wrap_add) + i64::from(wrap_step) * i64::from(count);

        if wrap_sum > i64::from(i32::MAX) {
            self.wrap_add = (wrap_sum - i64::from(i32::MAX) - 1) as i32;
            self.last = 0;
            self.current = self.wrap_add;
            self.wrap_overflow += 1;

            Advance {
                full: self.full(),
                big_wrap: true,
            }
        } else {
            self.wrap_add = wrap_sum as i32;
            self.last = self.current;
            self.current = self.wrap_add;

            Advance {
                full: self.full(),
                big_wrap: false,
            }
        }
    }

    /// Applies a 16-bit counter sample from the serial protocol.
    ///
    /// A sample lower than the previous one is a counter wrap and adds
    /// `wrap_step`. The wrap that would push the offset past the 31-bit
    /// ceiling is a big wrap instead: offset and timestamps restart from zero
    /// and the overflow counter is incremented. The sample that caused a big
    /// wrap carries no time of its own.
    pub fn apply_sample(&mut self, sample: u16, wrap_step: i32) -> Advance {
        let wrapped = sample < self.last_short;
        self.last_short = sample;

        if wrapped && self.wrap_add == i32::MAX - (wrap_step - 1) {
            self.wrap_add = 0;
            self.last = 0;
            self.current = 0;
            self.wrap_overflow += 1;

            return Advance {
                full: self.full(),
                big_wrap: true,
            };
        }

        if wrapped {
            self.wrap_add += wrap_step;
        }

        self.last = self.current;
        self.current = self.wrap_add + i32::from(sample);

        Advance {
            full: self.full(),
            big_wrap: false,
        }
    }
}
