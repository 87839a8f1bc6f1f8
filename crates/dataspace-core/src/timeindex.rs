// ── Time-indexed paths ──
//
// Historical logs and archived files live under hour buckets:
// `<root>/TimeIndex/<year>/<MM>/<DD>/<HH>`, in a fixed local zone.

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::error::CoreError;

pub const TIME_INDEX_SEGMENT: &str = "TimeIndex";

/// Bucket path for a zoned timestamp.
pub fn time_index_path_for<Z: TimeZone>(root: &str, local: &DateTime<Z>) -> String {
    format!(
        "{root}/{TIME_INDEX_SEGMENT}/{}/{:02}/{:02}/{:02}",
        local.year(),
        local.month(),
        local.day(),
        local.hour()
    )
}

/// Bucket path for an epoch timestamp (seconds) interpreted in `zone`.
pub fn time_index_path(root: &str, epoch_secs: i64, zone: Tz) -> Result<String, CoreError> {
    let utc = DateTime::from_timestamp(epoch_secs, 0).ok_or_else(|| CoreError::Config {
        message: format!("timestamp {epoch_secs} is out of range"),
    })?;
    Ok(time_index_path_for(root, &utc.with_timezone(&zone)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono_tz::Europe::Stockholm;
    use chrono_tz::UTC;

    use super::*;

    #[test]
    fn pads_month_day_and_hour() {
        // 2024-03-05 07:30:00 UTC
        assert_eq!(
            time_index_path("logs/sensor", 1_709_623_800, UTC).unwrap(),
            "logs/sensor/TimeIndex/2024/03/05/07"
        );
    }

    #[test]
    fn buckets_in_local_zone() {
        // 2024-01-31 23:30 UTC is 2024-02-01 00:30 in Stockholm (CET).
        assert_eq!(
            time_index_path("a", 1_706_743_800, Stockholm).unwrap(),
            "a/TimeIndex/2024/02/01/00"
        );
        // Summer time: 2024-07-01 10:00 UTC is 12:00 CEST.
        assert_eq!(
            time_index_path("a", 1_719_828_000, Stockholm).unwrap(),
            "a/TimeIndex/2024/07/01/12"
        );
    }

    #[test]
    fn rejects_out_of_range_timestamps() {
        assert!(time_index_path("a", i64::MAX, UTC).is_err());
    }
}
