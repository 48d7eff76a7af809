use thiserror::Error;

use crate::dispatcher::DispatchError;
use crate::planner::PlanError;

/// Validation and contract errors exposed by `ferrogate-core`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("endpoint id cannot be empty")]
    EmptyEndpoint,
    #[error("endpoint id contains invalid character '{ch}' at index {index}")]
    EndpointInvalidChar { ch: char, index: usize },

    #[error("invalid contract type '{value}', expected one of SinglePeriod, Spread, PeriodSpread, Range, PeriodRange")]
    InvalidContractType { value: String },
    #[error("{contract_type} contracts need {expected} sequence item(s), got {actual}")]
    SequenceItemArity {
        contract_type: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("contract must reference exactly one of marketId or instrumentId")]
    AmbiguousSubject,

    #[error("invalid granularity '{value}', expected forms like 5m, 1h, 1d, 1w, 1mo")]
    InvalidGranularity { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("window start {from} must be before end {until}")]
    EmptyWindow { from: String, until: String },
    #[error("max days per slice must be positive")]
    ZeroSliceDays,

    #[error("field '{field}' must be positive")]
    NonPositive { field: &'static str },
    #[error("field '{field}' must be within ({min}, {max}]")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
}

/// Environment or programmatic configuration errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("environment variable {name} has unparsable value '{value}'")]
    Unparsable { name: &'static str, value: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
