use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::StorageError;

/// Julian day number of the Unix epoch (1970-01-01T00:00:00Z).
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;
const MILLIS_PER_DAY: f64 = 86_400_000.0;
const MICROS_PER_DAY: f64 = 86_400_000_000.0;

/// Text layouts SQLite's date functions produce, tried in order after RFC 3339.
const STORE_TEXT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Storage timestamp with microsecond precision, always UTC.
///
/// Serializes as RFC 3339 with six fractional digits and a `Z` suffix, which is
/// also the text form written to datetime columns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StorageDatetime(pub DateTime<Utc>);

impl Serialize for StorageDatetime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for StorageDatetime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StorageDatetime::parse_text(&s).map_err(serde::de::Error::custom)
    }
}

impl StorageDatetime {
    pub fn now() -> Self {
        StorageDatetime::from(Utc::now())
    }

    pub fn inner(&self) -> &DateTime<Utc> {
        &self.0
    }

    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    /// Parse RFC 3339 or one of SQLite's `YYYY-MM-DD HH:MM:SS[.fff]` forms.
    ///
    /// Text without an offset is taken as UTC, matching `CURRENT_TIMESTAMP`.
    pub fn parse_text(text: &str) -> Result<Self, StorageError> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(StorageDatetime(truncate_micros(dt.with_timezone(&Utc))));
        }
        for format in STORE_TEXT_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return Ok(StorageDatetime(truncate_micros(naive.and_utc())));
            }
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(StorageDatetime(naive.and_utc()));
            }
        }
        Err(invalid(format!("unrecognized datetime text: {:?}", text)))
    }

    /// Seconds since the Unix epoch, as stored in integer datetime columns.
    pub fn from_unix_seconds(seconds: i64) -> Result<Self, StorageError> {
        DateTime::from_timestamp(seconds, 0)
            .map(StorageDatetime)
            .ok_or_else(|| invalid(format!("unix time out of range: {}", seconds)))
    }

    pub fn to_unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    /// Julian day number, as stored in real datetime columns.
    ///
    /// A double near 2.4 million days only carries tens of microseconds, so the
    /// result is rounded to milliseconds like SQLite's own date functions.
    pub fn from_julian_day(day: f64) -> Result<Self, StorageError> {
        let millis = ((day - UNIX_EPOCH_JULIAN_DAY) * MILLIS_PER_DAY).round();
        if !millis.is_finite() || millis.abs() > (i64::MAX / 1000) as f64 {
            return Err(invalid(format!("julian day out of range: {}", day)));
        }
        DateTime::from_timestamp_millis(millis as i64)
            .map(StorageDatetime)
            .ok_or_else(|| invalid(format!("julian day out of range: {}", day)))
    }

    pub fn to_julian_day(&self) -> f64 {
        self.0.timestamp_micros() as f64 / MICROS_PER_DAY + UNIX_EPOCH_JULIAN_DAY
    }
}

impl Default for StorageDatetime {
    fn default() -> Self {
        Self::now()
    }
}

impl std::fmt::Display for StorageDatetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for StorageDatetime {
    fn from(dt: DateTime<Utc>) -> Self {
        StorageDatetime(truncate_micros(dt))
    }
}

impl From<StorageDatetime> for DateTime<Utc> {
    fn from(dt: StorageDatetime) -> Self {
        dt.0
    }
}

fn invalid(message: String) -> StorageError {
    StorageError::SerializationError(<serde_json::Error as serde::de::Error>::custom(message))
}

fn truncate_micros(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(dt.timestamp_micros()).unwrap_or(dt)
}
