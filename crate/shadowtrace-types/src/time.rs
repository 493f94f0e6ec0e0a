use std::fmt;
use std::time::{Duration, SystemTime};

/// Time as duration since the start of the UNIX epoch.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Debug,
)]
#[serde(transparent)]
pub struct UnixTime(Duration);

impl UnixTime {
    /// Start of the UNIX epoch.
    pub const ZERO: UnixTime = UnixTime(Duration::ZERO);

    /// The current time.
    ///
    /// A clock set before the epoch reads as [UnixTime::ZERO].
    pub fn now() -> Self {
        UnixTime::from_system_time(SystemTime::now())
    }

    /// Create a new UNIX time with the given secs and fractional nanosecs.
    pub fn new(secs: u64, nsecs: u32) -> Self {
        UnixTime(Duration::new(secs, nsecs))
    }

    pub fn from_secs(secs: u64) -> Self {
        UnixTime::new(secs, 0)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        time.duration_since(SystemTime::UNIX_EPOCH)
            .map(UnixTime)
            .unwrap_or(UnixTime::ZERO)
    }

    pub fn as_system_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + self.0
    }

    /// Seconds since start of the UNIX epoch.
    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    /// Nanoseconds since the start of the second.
    pub fn subsec_nanos(&self) -> u32 {
        self.0.subsec_nanos()
    }
}

impl From<Duration> for UnixTime {
    fn from(value: Duration) -> Self {
        UnixTime(value)
    }
}

/// RFC 3339 in UTC, with millisecond precision.
impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            humantime::format_rfc3339_millis(self.as_system_time())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_millis() {
        // 2009-02-13T23:31:30.333
        let t = UnixTime::new(1234567890, 333999111);
        assert_eq!("2009-02-13T23:31:30.333Z", t.to_string());
    }

    #[test]
    fn before_epoch_is_zero() {
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(UnixTime::ZERO, UnixTime::from_system_time(before));
    }

    #[test]
    fn system_time_conversion() {
        let t = UnixTime::new(1640995200, 5);
        assert_eq!(t, UnixTime::from_system_time(t.as_system_time()));
    }
}
