use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Time window used by rate limits and windowed cost limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowUnit {
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
}

impl WindowUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowUnit::Second => "s",
            WindowUnit::Minute => "m",
            WindowUnit::Hour => "h",
            WindowUnit::Day => "d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            WindowUnit::Second => Duration::from_secs(1),
            WindowUnit::Minute => Duration::from_secs(60),
            WindowUnit::Hour => Duration::from_secs(3600),
            WindowUnit::Day => Duration::from_secs(86_400),
        }
    }

    /// Sub-bucket inside the current window that an increment at `now` lands in.
    pub fn bucket(&self, now: DateTime<Utc>) -> i64 {
        match self {
            WindowUnit::Second => now.timestamp_millis() * 10,
            WindowUnit::Minute => now.timestamp(),
            WindowUnit::Hour => now.minute() as i64,
            WindowUnit::Day => now.hour() as i64,
        }
    }

    /// Time left until the current window rolls over. Never zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let window_ms = self.duration().as_millis() as i64;
        let elapsed = now.timestamp_millis().rem_euclid(window_ms);
        Duration::from_millis((window_ms - elapsed).max(1) as u64)
    }

    /// Cost limits only accept hourly and daily windows.
    pub fn is_cost_unit(&self) -> bool {
        matches!(self, WindowUnit::Hour | WindowUnit::Day)
    }
}

impl fmt::Display for WindowUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(WindowUnit::Second),
            "m" => Ok(WindowUnit::Minute),
            "h" => Ok(WindowUnit::Hour),
            "d" => Ok(WindowUnit::Day),
            other => Err(format!("unknown window unit '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_per_unit() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 13, 59, 30).unwrap();
        assert_eq!(WindowUnit::Second.bucket(now), now.timestamp_millis() * 10);
        assert_eq!(WindowUnit::Minute.bucket(now), now.timestamp());
        assert_eq!(WindowUnit::Hour.bucket(now), 59);
        assert_eq!(WindowUnit::Day.bucket(now), 13);
    }

    #[test]
    fn test_remaining_ends_at_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 13, 59, 30).unwrap();
        assert_eq!(WindowUnit::Hour.remaining(now), Duration::from_secs(30));
        assert_eq!(WindowUnit::Minute.remaining(now), Duration::from_secs(30));
        assert_eq!(
            WindowUnit::Day.remaining(now),
            Duration::from_secs(10 * 3600 + 30)
        );

        let on_boundary = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        assert_eq!(
            WindowUnit::Hour.remaining(on_boundary),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("h".parse::<WindowUnit>().unwrap(), WindowUnit::Hour);
        assert!("w".parse::<WindowUnit>().is_err());
        let unit: WindowUnit = serde_json::from_str("\"d\"").unwrap();
        assert_eq!(unit, WindowUnit::Day);
        assert!(unit.is_cost_unit());
        assert!(!WindowUnit::Minute.is_cost_unit());
    }
}
