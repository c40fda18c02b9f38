//! Wraparound arithmetic for fixed-width CSC counters.
//!
//! Revolution counters and event timers on a CSC sensor are free-running
//! hardware counters. Every delta between two readings must be taken modulo
//! the counter width; plain subtraction breaks at the wrap boundary.

/// Forward distance from `old` to `new` modulo 2^16.
#[inline]
pub fn delta16(new: u16, old: u16) -> u16 {
    new.wrapping_sub(old)
}

/// Forward distance from `old` to `new` modulo 2^32.
#[inline]
pub fn delta32(new: u32, old: u32) -> u32 {
    new.wrapping_sub(old)
}
