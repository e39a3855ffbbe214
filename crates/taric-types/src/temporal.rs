use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Rendering used for issue dates derived from a backend's last-modified time.
pub const ISSUE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Render a backend last-modified time as an issue date (UTC, seconds precision).
pub fn format_issue_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format(ISSUE_DATE_FORMAT)
        .to_string()
}

/// Returns `true` if `bytes` has ASCII digits everywhere except at the given
/// separator positions, which must hold the given separator bytes.
fn has_shape(bytes: &[u8], separators: &[(usize, u8)]) -> bool {
    bytes.iter().enumerate().all(|(i, b)| {
        match separators.iter().find(|(pos, _)| *pos == i) {
            Some((_, sep)) => b == sep,
            None => b.is_ascii_digit(),
        }
    })
}

const DATE_SHAPE: &[(usize, u8)] = &[(4, b'-'), (7, b'-')];
const DATETIME_SHAPE: &[(usize, u8)] = &[
    (4, b'-'),
    (7, b'-'),
    (10, b'T'),
    (13, b':'),
    (16, b':'),
];
const DATETIME_MILLIS_SHAPE: &[(usize, u8)] = &[
    (4, b'-'),
    (7, b'-'),
    (10, b'T'),
    (13, b':'),
    (16, b':'),
    (19, b'.'),
];

// ---------------------------------------------------------------------------
// DeltaDate
// ---------------------------------------------------------------------------

/// A calendar day in `YYYY-MM-DD` form, used to select index entries whose
/// issue date falls on that day.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeltaDate(NaiveDate);

impl DeltaDate {
    /// Parse a strict `YYYY-MM-DD` date that names a real calendar day.
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        let invalid = || TypeError::InvalidDate(text.to_string());
        if text.len() != 10 || !has_shape(text.as_bytes(), DATE_SHAPE) {
            return Err(invalid());
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| invalid())
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date)
    }

    /// The UTC day before today.
    pub fn yesterday() -> Self {
        let today = Utc::now().date_naive();
        Self(today.pred_opt().unwrap_or(today))
    }

    /// Returns `true` if an issue date string falls on this day.
    ///
    /// Issue dates are ISO-8601 strings, so this is a prefix match.
    pub fn matches(&self, issue_date: &str) -> bool {
        issue_date.starts_with(&self.to_string())
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for DeltaDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl fmt::Debug for DeltaDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeltaDate({self})")
    }
}

impl TryFrom<String> for DeltaDate {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeltaDate> for String {
    fn from(date: DeltaDate) -> Self {
        date.to_string()
    }
}

// ---------------------------------------------------------------------------
// ModTime
// ---------------------------------------------------------------------------

/// Client-supplied modification timestamp attached to an upload.
///
/// Accepted forms: `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS`, and
/// `YYYY-MM-DDTHH:MM:SS.mmm`. The original text is kept verbatim because it
/// becomes the published issue date; the parsed value is interpreted as UTC
/// wherever a point in time is needed.
#[derive(Clone, PartialEq, Eq)]
pub struct ModTime {
    text: String,
    at: NaiveDateTime,
}

impl ModTime {
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        let invalid = || TypeError::InvalidTimestamp(text.to_string());
        let bytes = text.as_bytes();

        let at = match bytes.len() {
            10 if has_shape(bytes, DATE_SHAPE) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|d| d.and_time(NaiveTime::MIN))
                .map_err(|_| invalid())?,
            19 if has_shape(bytes, DATETIME_SHAPE) => {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").map_err(|_| invalid())?
            }
            23 if has_shape(bytes, DATETIME_MILLIS_SHAPE) => {
                let whole = NaiveDateTime::parse_from_str(&text[..19], "%Y-%m-%dT%H:%M:%S")
                    .map_err(|_| invalid())?;
                let millis: i64 = text[20..].parse().map_err(|_| invalid())?;
                whole + chrono::Duration::milliseconds(millis)
            }
            _ => return Err(invalid()),
        };

        Ok(Self {
            text: text.to_string(),
            at,
        })
    }

    /// The timestamp exactly as the client sent it.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The timestamp as a naive date-time (no zone attached).
    pub fn naive(&self) -> NaiveDateTime {
        self.at
    }

    /// The timestamp as a point in time, reading it as UTC.
    pub fn to_system_time(&self) -> SystemTime {
        SystemTime::from(Utc.from_utc_datetime(&self.at))
    }
}

impl fmt::Display for ModTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for ModTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModTime({})", self.text)
    }
}
