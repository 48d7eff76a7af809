use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Calendar unit of an aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl IntervalUnit {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "w",
            Self::Month => "mo",
        }
    }

    /// Interval counts the upstream accepts for this unit.
    const fn allowed_counts(self) -> &'static [u32] {
        match self {
            Self::Minute => &[1, 5, 15, 30],
            Self::Hour => &[1, 4],
            Self::Day => &[1, 7],
            Self::Week | Self::Month => &[1],
        }
    }
}

/// Bucket size for aggregated queries; drives tiered date-range ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Granularity {
    unit: IntervalUnit,
    count: u32,
}

impl Granularity {
    pub const ONE_DAY: Self = Self {
        unit: IntervalUnit::Day,
        count: 1,
    };

    pub fn new(unit: IntervalUnit, count: u32) -> Result<Self, ValidationError> {
        if !unit.allowed_counts().contains(&count) {
            return Err(ValidationError::InvalidGranularity {
                value: format!("{count}{}", unit.suffix()),
            });
        }
        Ok(Self { unit, count })
    }

    pub const fn unit(self) -> IntervalUnit {
        self.unit
    }

    pub const fn count(self) -> u32 {
        self.count
    }

    /// Buckets shorter than one day.
    pub const fn is_intraday(self) -> bool {
        matches!(self.unit, IntervalUnit::Minute | IntervalUnit::Hour)
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

impl FromStr for Granularity {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let invalid = || ValidationError::InvalidGranularity {
            value: normalized.clone(),
        };

        let split = normalized
            .find(|ch: char| !ch.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, suffix) = normalized.split_at(split);
        let count = digits.parse::<u32>().map_err(|_| invalid())?;
        let unit = match suffix {
            "m" => IntervalUnit::Minute,
            "h" => IntervalUnit::Hour,
            "d" => IntervalUnit::Day,
            "w" => IntervalUnit::Week,
            "mo" => IntervalUnit::Month,
            _ => return Err(invalid()),
        };

        Self::new(unit, count)
    }
}

impl TryFrom<String> for Granularity {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

impl From<Granularity> for String {
    fn from(value: Granularity) -> Self {
        value.to_string()
    }
}
