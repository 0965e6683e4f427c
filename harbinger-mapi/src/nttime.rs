//! NT time: 100-nanosecond ticks since 1601-01-01 UTC.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NT epoch (1601) and the Unix epoch (1970).
pub const NT_EPOCH_OFFSET_SECS: u64 = 11_644_473_600;

const TICKS_PER_SECOND: u64 = 10_000_000;

#[must_use]
pub const fn unix_to_nt(unix_secs: u64) -> u64 {
    (unix_secs + NT_EPOCH_OFFSET_SECS) * TICKS_PER_SECOND
}

#[must_use]
pub const fn nt_to_unix(nt: u64) -> u64 {
    nt / TICKS_PER_SECOND - NT_EPOCH_OFFSET_SECS
}

/// Current wall-clock time as NT time.
#[must_use]
pub fn nt_now() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    unix_to_nt(elapsed.as_secs())
}
