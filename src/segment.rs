//! Time quantization.
//!
//! Wall-clock milliseconds are bucketed into fixed-width segments. Every
//! pending queue is indexed by segment so the loop can fetch "everything due
//! up to segment S" with one range scan.

use chrono::Utc;
use tracing::warn;

/// Width of one segment in milliseconds.
pub const SEGMENT_MS: i64 = 100;

const YEAR_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_segment(ms: i64) -> i64 {
    ms.div_euclid(SEGMENT_MS)
}

pub fn from_segment(segment: i64) -> i64 {
    segment * SEGMENT_MS
}

pub fn current_segment() -> i64 {
    to_segment(now_ms())
}

/// The earliest segment a write made now can be observed in.
pub fn next_segment() -> i64 {
    current_segment() + 1
}

/// Number of whole segments covering `ms`, rounded up.
pub fn segments_in(ms: i64) -> i64 {
    (ms + SEGMENT_MS - 1).div_euclid(SEGMENT_MS)
}

/// Clamp a requested execution time into `[now - 1y, now + 5y]`.
///
/// Times too far in the past run now; times too far in the future are
/// pulled back to the upper bound.
pub fn bound_scheduled_time(ms: i64) -> i64 {
    bound_at(ms, now_ms())
}

fn bound_at(ms: i64, now: i64) -> i64 {
    if ms < now - YEAR_MS {
        warn!(requested_ms = ms, now_ms = now, "scheduled time too far in the past, running now");
        return now;
    }
    let upper = now + 5 * YEAR_MS;
    if ms > upper {
        warn!(requested_ms = ms, now_ms = now, "scheduled time too far in the future, clamping");
        return upper;
    }
    ms
}
