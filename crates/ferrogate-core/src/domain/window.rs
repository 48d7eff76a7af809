use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::ValidationError;

/// RFC3339 timestamp guaranteed to be UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDateTime(OffsetDateTime);

impl UtcDateTime {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    /// Accepts RFC3339 with a `Z` offset, or a bare `YYYY-MM-DD` date at midnight.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let not_utc = || ValidationError::TimestampNotUtc {
            value: trimmed.to_owned(),
        };

        if let Ok(date) = Date::parse(trimmed, format_description!("[year]-[month]-[day]")) {
            return Ok(Self(date.midnight().assume_utc()));
        }

        let parsed = OffsetDateTime::parse(trimmed, &Rfc3339).map_err(|_| not_utc())?;
        Self::from_offset_datetime(parsed).map_err(|_| not_utc())
    }

    pub fn from_offset_datetime(value: OffsetDateTime) -> Result<Self, ValidationError> {
        if value.offset() != UtcOffset::UTC {
            return Err(ValidationError::TimestampNotUtc {
                value: value
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| String::from("<unformattable>")),
            });
        }

        Ok(Self(value))
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }

    /// Upstream query format: whole seconds with a `Z` suffix.
    pub fn format_api(self) -> String {
        self.0
            .replace_nanosecond(0)
            .unwrap_or(self.0)
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
            ))
            .unwrap_or_else(|_| String::from("<unformattable>"))
    }

    fn checked_add(self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration).map(Self)
    }
}

impl Display for UtcDateTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_api())
    }
}

impl Serialize for UtcDateTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.format_api())
    }
}

impl<'de> Deserialize<'de> for UtcDateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}

/// Half-open query window `[from, until)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    from: UtcDateTime,
    until: UtcDateTime,
}

impl DateWindow {
    pub fn new(from: UtcDateTime, until: UtcDateTime) -> Result<Self, ValidationError> {
        if from >= until {
            return Err(ValidationError::EmptyWindow {
                from: from.format_api(),
                until: until.format_api(),
            });
        }
        Ok(Self { from, until })
    }

    pub fn parse(from: &str, until: &str) -> Result<Self, ValidationError> {
        Self::new(UtcDateTime::parse(from)?, UtcDateTime::parse(until)?)
    }

    pub const fn from(self) -> UtcDateTime {
        self.from
    }

    pub const fn until(self) -> UtcDateTime {
        self.until
    }

    pub fn length(self) -> Duration {
        self.until.0 - self.from.0
    }

    /// Splits into consecutive chunks of at most `max_days` days; each chunk
    /// starts where the previous one ended and the last ends at `until`.
    pub fn slice(self, max_days: u32) -> Result<Vec<Self>, ValidationError> {
        if max_days == 0 {
            return Err(ValidationError::ZeroSliceDays);
        }

        let step = Duration::days(i64::from(max_days));
        let mut chunks = Vec::new();
        let mut start = self.from;
        while start < self.until {
            let end = start
                .checked_add(step)
                .map_or(self.until, |candidate| candidate.min(self.until));
            chunks.push(Self { from: start, until: end });
            start = end;
        }
        Ok(chunks)
    }
}

impl Display for DateWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_only_as_midnight_utc() {
        let parsed = UtcDateTime::parse("2024-01-01").expect("must parse");
        assert_eq!(parsed.format_api(), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn rejects_non_utc_offsets() {
        let err = UtcDateTime::parse("2024-01-01T00:00:00+02:00").expect_err("must fail");
        assert!(matches!(err, ValidationError::TimestampNotUtc { .. }));
    }

    #[test]
    fn api_format_drops_fractional_seconds() {
        let parsed = UtcDateTime::parse("2024-01-01T12:30:45.123Z").expect("must parse");
        assert_eq!(parsed.format_api(), "2024-01-01T12:30:45Z");
    }

    #[test]
    fn ninety_days_with_32_day_ceiling_needs_three_slices() {
        let window = DateWindow::parse("2024-01-01", "2024-03-31").expect("valid window");

        let slices = window.slice(32).expect("must slice");

        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].from(), window.from());
        assert_eq!(slices[0].until().format_api(), "2024-02-02T00:00:00Z");
        assert_eq!(slices[1].from(), slices[0].until());
        assert_eq!(slices[1].until().format_api(), "2024-03-05T00:00:00Z");
        assert_eq!(slices[2].until(), window.until());
    }

    #[test]
    fn window_shorter_than_ceiling_is_one_slice() {
        let window = DateWindow::parse("2024-01-01", "2024-01-05").expect("valid window");
        assert_eq!(window.slice(7).expect("must slice"), vec![window]);
    }

    #[test]
    fn empty_window_is_rejected() {
        let err = DateWindow::parse("2024-01-05", "2024-01-05").expect_err("must fail");
        assert!(matches!(err, ValidationError::EmptyWindow { .. }));
    }
}
