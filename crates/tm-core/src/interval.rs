//! Half-open time intervals and minute arithmetic.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;

const MILLIS_PER_MINUTE: i64 = 60_000;

/// A half-open interval `[start, end)` with `end > start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidInterval {
                start: start.to_rfc3339_opts(SecondsFormat::Millis, true),
                end: end.to_rfc3339_opts(SecondsFormat::Millis, true),
            });
        }
        Ok(Self { start, end })
    }

    /// Two half-open intervals overlap iff each starts before the other ends.
    /// Touching intervals (`a.end == b.start`) do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

/// `[a_start, a_end)` and `[b_start, b_end)` overlap.
#[must_use]
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

/// Elapsed minutes between two instants, rounded up to the next whole minute.
///
/// A partial minute always counts as a full one. Non-positive spans are 0.
#[must_use]
pub fn minutes_ceil(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let elapsed = end.signed_duration_since(start);
    let millis = elapsed.num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    let whole = millis / MILLIS_PER_MINUTE;
    if millis % MILLIS_PER_MINUTE == 0 {
        whole
    } else {
        whole + 1
    }
}

/// Truncates an instant to the millisecond precision used in storage.
#[must_use]
pub fn storage_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}
