use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Port used when an address does not name one (NetBIOS session service).
pub const DEFAULT_SMB_PORT: u16 = 139;

/// Identity of a pooled session partition.
///
/// Two keys are equal when host and port are equal; an unspecified port is
/// distinct from an explicit `139` even though both connect to the same place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    host: String,
    port: Option<u16>,
}

impl SessionKey {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port as written in the address, `None` when it was omitted.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port actually dialed.
    pub fn resolved_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SMB_PORT)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Windows FILETIME: 100-nanosecond ticks since 1601-01-01 UTC.
///
/// A zero value means the server did not report the time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileTime(pub u64);

impl FileTime {
    pub const UNSET: FileTime = FileTime(0);

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let secs = time.timestamp() + FILETIME_UNIX_OFFSET_SECS;
        if secs < 0 {
            return FileTime::UNSET;
        }
        let ticks = secs * TICKS_PER_SECOND + i64::from(time.timestamp_subsec_nanos() / 100);
        FileTime(u64::try_from(ticks).unwrap_or(0))
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if self.is_unset() {
            return None;
        }
        let ticks = i64::try_from(self.0).ok()?;
        let secs = ticks.div_euclid(TICKS_PER_SECOND) - FILETIME_UNIX_OFFSET_SECS;
        let nanos = u32::try_from(ticks.rem_euclid(TICKS_PER_SECOND) * 100).ok()?;
        Utc.timestamp_opt(secs, nanos).single()
    }

    pub fn to_unix_millis(&self) -> i64 {
        self.to_datetime().map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_display() {
        assert_eq!(SessionKey::new("fs01", None).to_string(), "fs01");
        assert_eq!(SessionKey::new("fs01", Some(445)).to_string(), "fs01:445");
    }

    #[test]
    fn test_session_key_equality_includes_port() {
        let implicit = SessionKey::new("fs01", None);
        let explicit = SessionKey::new("fs01", Some(139));
        assert_ne!(implicit, explicit);
        assert_eq!(implicit.resolved_port(), explicit.resolved_port());
        assert_eq!(SessionKey::new("fs01", Some(1234)), SessionKey::new("fs01", Some(1234)));
    }

    #[test]
    fn test_filetime_unix_epoch() {
        // 1970-01-01T00:00:00Z
        let ft = FileTime(116_444_736_000_000_000);
        assert_eq!(ft.to_unix_millis(), 0);
        assert_eq!(FileTime::from_datetime(ft.to_datetime().unwrap()), ft);
    }

    #[test]
    fn test_filetime_unset() {
        assert!(FileTime::UNSET.to_datetime().is_none());
        assert_eq!(FileTime::UNSET.to_unix_millis(), 0);
    }

    #[test]
    fn test_filetime_subsecond_precision() {
        let time = Utc.timestamp_opt(1_700_000_000, 123_456_700).unwrap();
        let ft = FileTime::from_datetime(time);
        assert_eq!(ft.to_datetime(), Some(time));
    }
}
