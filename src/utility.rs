//! Utility functions for rowcache
//!
//! Small arithmetic helpers shared by the arena and the hash index.

use std::time::{SystemTime, UNIX_EPOCH};

/// Check if a value is a power of two
#[inline]
pub const fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Round up to the next power of two
///
/// Returns the smallest power of two that is `>= n`. Zero rounds to one.
/// Values above `2^63` saturate to `2^63`.
#[inline]
pub const fn next_power_of_two(mut n: u64) -> u64 {
    if n == 0 {
        return 1;
    }
    if n > (1 << 63) {
        return 1 << 63;
    }
    n -= 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n |= n >> 32;
    n + 1
}

/// Divide rounding up.
#[inline]
pub const fn div_ceil(n: u64, d: u64) -> u64 {
    n / d + (n % d != 0) as u64
}

/// Seconds since the Unix epoch, zero if the clock is before 1970.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
