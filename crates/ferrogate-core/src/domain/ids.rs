use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Remote endpoint path relative to the API root, e.g. `trades/ohlcv`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId(String);

impl EndpointId {
    /// Parse and normalize an endpoint id to lowercase without surrounding slashes.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEndpoint);
        }

        let normalized = trimmed.to_ascii_lowercase();
        for (index, ch) in normalized.chars().enumerate() {
            let valid = ch.is_ascii_alphanumeric() || ch == '/' || ch == '-' || ch == '_';
            if !valid {
                return Err(ValidationError::EndpointInvalidChar { ch, index });
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for EndpointId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for EndpointId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EndpointId> for String {
    fn from(value: EndpointId) -> Self {
        value.0
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Trading venue market identifier.
    MarketId
);
numeric_id!(
    /// Instrument identifier; an instrument spans one or more markets.
    InstrumentId
);
numeric_id!(
    /// Delivery sequence identifier (e.g. monthly, quarterly).
    SequenceId
);
numeric_id!(
    /// One delivery period within a sequence.
    SequenceItemId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_endpoint() {
        let parsed = EndpointId::parse(" /Trades/OHLCV/ ").expect("endpoint should parse");
        assert_eq!(parsed.as_str(), "trades/ohlcv");
    }

    #[test]
    fn rejects_empty_endpoint() {
        let err = EndpointId::parse(" / ").expect_err("must fail");
        assert_eq!(err, ValidationError::EmptyEndpoint);
    }

    #[test]
    fn rejects_query_characters() {
        let err = EndpointId::parse("trades?from=now").expect_err("must fail");
        assert!(matches!(err, ValidationError::EndpointInvalidChar { ch: '?', .. }));
    }

    #[test]
    fn numeric_ids_serialize_transparently() {
        let json = serde_json::to_string(&MarketId(10_000_065)).expect("serializes");
        assert_eq!(json, "10000065");
    }
}
