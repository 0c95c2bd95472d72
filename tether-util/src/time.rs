use chrono::{DateTime, Duration, Utc};
use std::time::SystemTime;

/// Time utilities for working with timestamps and deadlines
pub struct TimeUtils;

impl TimeUtils {
    /// Get current UTC timestamp
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// Convert SystemTime to `DateTime<Utc>`
    pub fn from_system_time(system_time: SystemTime) -> DateTime<Utc> {
        system_time.into()
    }

    /// Get timestamp in milliseconds since Unix epoch
    pub fn timestamp_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Deadline in UTC for a timeout expressed in milliseconds; `None` for a
    /// zero timeout (no deadline).
    pub fn deadline_from_millis(timeout_ms: u64) -> Option<DateTime<Utc>> {
        if timeout_ms == 0 {
            None
        } else {
            Some(Utc::now() + Duration::milliseconds(timeout_ms as i64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_advances() {
        let first = TimeUtils::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(TimeUtils::now() > first);
    }

    #[test]
    fn test_timestamp_millis() {
        let ts = TimeUtils::timestamp_millis();
        let year_2020_millis = 1_577_836_800_000i64;
        assert!(ts > year_2020_millis);
    }

    #[test]
    fn test_deadline_from_millis() {
        assert!(TimeUtils::deadline_from_millis(0).is_none());
        let deadline = TimeUtils::deadline_from_millis(5000).unwrap();
        let delta = deadline - TimeUtils::now();
        assert!(delta.num_milliseconds() > 4000);
        assert!(delta.num_milliseconds() <= 5000);
    }

    #[test]
    fn test_from_system_time() {
        let dt = TimeUtils::from_system_time(SystemTime::now());
        let diff = TimeUtils::now() - dt;
        assert!(diff.num_seconds().abs() < 2);
    }
}
