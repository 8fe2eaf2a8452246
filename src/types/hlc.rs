/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Hybrid logical clock.
//!
//! Persistent versions are timestamped with an [`HlcTimestamp`]: physical microseconds
//! since the Unix epoch plus a logical tie-breaker, ordered lexicographically. The
//! logical component makes timestamps strictly increasing even when the wall clock
//! stalls or steps backwards between two deliveries.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

/// A hybrid logical clock reading: `(physical_microseconds, logical_tick)`, ordered
/// lexicographically.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct HlcTimestamp {
    pub micros: u64,
    pub logical: u16,
}

impl HlcTimestamp {
    pub const fn new(micros: u64, logical: u16) -> Self {
        Self { micros, logical }
    }

    /// The zero timestamp, ordered before every reading a clock can produce.
    pub const fn epoch() -> Self {
        Self {
            micros: 0,
            logical: 0,
        }
    }
}

impl Display for HlcTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.micros, self.logical)
    }
}

/// Issues strictly increasing [`HlcTimestamp`]s from the local wall clock.
pub struct HybridClock {
    last: HlcTimestamp,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            last: HlcTimestamp::epoch(),
        }
    }

    /// Read the clock. Never returns a timestamp less than or equal to the previous
    /// reading from this instance.
    pub fn now(&mut self) -> HlcTimestamp {
        let physical = wall_clock_micros();
        let next = if physical > self.last.micros {
            HlcTimestamp::new(physical, 0)
        } else {
            HlcTimestamp::new(self.last.micros, self.last.logical + 1)
        };
        self.last = next;
        next
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Nanoseconds since the Unix epoch, the unit of the table's liveness frontier.
pub(crate) fn wall_clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_lexicographically() {
        assert!(HlcTimestamp::new(5, 0) < HlcTimestamp::new(6, 0));
        assert!(HlcTimestamp::new(5, 1) < HlcTimestamp::new(6, 0));
        assert!(HlcTimestamp::new(5, 0) < HlcTimestamp::new(5, 1));
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let mut clock = HybridClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }
}
