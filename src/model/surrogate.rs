//! Surrogate-id encoding
//!
//! A surrogate id is a monotonic 64-bit key that totally orders every record
//! version across all resource types. The high bits carry a coarse wall-clock
//! timestamp (milliseconds since the Unix epoch) and the low bits an
//! intra-millisecond sequence, so a version's last-modified instant is derived
//! from its id rather than stored separately. The visibility watermark
//! operates on this ordering.

use chrono::{DateTime, Utc};

/// Monotonic 64-bit order key for record versions.
pub type SurrogateId = i64;

/// Low bits reserved for the intra-millisecond sequence.
pub const SEQUENCE_BITS: u32 = 16;

/// Highest sequence value that fits in one millisecond tick.
pub const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

/// Compose a surrogate id from a millisecond timestamp and a sequence offset.
pub fn from_parts(timestamp_millis: i64, sequence: i64) -> SurrogateId {
    (timestamp_millis << SEQUENCE_BITS) | (sequence & MAX_SEQUENCE)
}

/// Surrogate id for the first slot of the given instant's tick. Useful as a
/// range cutoff when comparing against wall-clock dates.
pub fn from_datetime(instant: DateTime<Utc>) -> SurrogateId {
    from_parts(instant.timestamp_millis(), 0)
}

/// Millisecond timestamp component of a surrogate id.
pub fn timestamp_millis(id: SurrogateId) -> i64 {
    id >> SEQUENCE_BITS
}

/// Intra-millisecond sequence component of a surrogate id.
pub fn sequence(id: SurrogateId) -> i64 {
    id & MAX_SEQUENCE
}

/// Last-modified instant encoded in a surrogate id.
pub fn last_modified(id: SurrogateId) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp_millis(id)).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
