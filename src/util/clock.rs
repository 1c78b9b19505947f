//! Wall-clock helpers shared by queue scoring and persistence.

use chrono::{DateTime, Utc};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds since the Unix epoch for an arbitrary instant.
#[must_use]
pub fn unix_ms_of(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotone_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: after 2020, before 2100.
        assert!(a > 1_577_836_800_000);
        assert!(a < 4_102_444_800_000);
    }

    #[test]
    fn unix_ms_of_matches_timestamp() {
        let at = Utc::now();
        assert_eq!(unix_ms_of(at), at.timestamp_millis());
    }
}
