use crate::model::{DAY_MS, HOUR_MS, Ms};

/// Earliest accepted instant (1970-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// Latest accepted instant (9999-12-31T23:59:59.999Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest single appointment or lock.
pub const MAX_SPAN_DURATION_MS: Ms = DAY_MS;
/// Widest availability query, in days (inclusive range).
pub const MAX_QUERY_DAYS: i64 = 93;
/// Upper bound on a caller-supplied lock TTL.
pub const MAX_LOCK_TTL_MS: Ms = 2 * HOUR_MS;
/// Longest accepted service, in minutes.
pub const MAX_SERVICE_MINUTES: i64 = 24 * 60;
/// Smallest slot granularity for calendar splitting.
pub const MIN_SLOT_MINUTES: i64 = 5;

pub const MAX_INTERVALS_PER_STAFF: usize = 100_000;
pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;

/// Largest appointment-count correction accepted by one workload upsert.
pub const MAX_WORKLOAD_APPOINTMENTS_DELTA: i64 = 10_000;
/// Largest booked-minutes correction accepted by one workload upsert.
pub const MAX_WORKLOAD_MINUTES_DELTA: i64 = MAX_WORKLOAD_APPOINTMENTS_DELTA * MAX_SERVICE_MINUTES;
