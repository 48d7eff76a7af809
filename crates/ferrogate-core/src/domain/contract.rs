use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{InstrumentId, MarketId, SequenceId, SequenceItemId, ValidationError};

/// Contract shape understood by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractType {
    SinglePeriod,
    Spread,
    PeriodSpread,
    Range,
    PeriodRange,
}

impl ContractType {
    pub const ALL: [Self; 5] = [
        Self::SinglePeriod,
        Self::Spread,
        Self::PeriodSpread,
        Self::Range,
        Self::PeriodRange,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SinglePeriod => "SinglePeriod",
            Self::Spread => "Spread",
            Self::PeriodSpread => "PeriodSpread",
            Self::Range => "Range",
            Self::PeriodRange => "PeriodRange",
        }
    }

    /// Number of sequence items a contract of this type references.
    pub const fn item_arity(self) -> usize {
        match self {
            Self::SinglePeriod => 1,
            Self::Spread | Self::PeriodSpread => 2,
            Self::Range | Self::PeriodRange => 4,
        }
    }
}

impl Display for ContractType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ValidationError::InvalidContractType {
                value: trimmed.to_owned(),
            })
    }
}

/// What a contract trades on: a single venue market or a cross-venue instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Market(MarketId),
    Instrument(InstrumentId),
}

impl Subject {
    pub const fn market(self) -> Option<MarketId> {
        match self {
            Self::Market(id) => Some(id),
            Self::Instrument(_) => None,
        }
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market(id) => write!(f, "market:{id}"),
            Self::Instrument(id) => write!(f, "instrument:{id}"),
        }
    }
}

/// One queryable contract. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ContractSpecRecord", into = "ContractSpecRecord")]
pub struct ContractSpec {
    subject: Subject,
    sequence: SequenceId,
    items: Vec<SequenceItemId>,
    contract_type: ContractType,
}

impl ContractSpec {
    pub fn new(
        subject: Subject,
        sequence: SequenceId,
        items: Vec<SequenceItemId>,
        contract_type: ContractType,
    ) -> Result<Self, ValidationError> {
        let expected = contract_type.item_arity();
        if items.len() != expected {
            return Err(ValidationError::SequenceItemArity {
                contract_type: contract_type.as_str(),
                expected,
                actual: items.len(),
            });
        }

        Ok(Self {
            subject,
            sequence,
            items,
            contract_type,
        })
    }

    /// Shorthand for the common single-period market contract.
    pub fn single_period(market: MarketId, sequence: SequenceId, item: SequenceItemId) -> Self {
        Self {
            subject: Subject::Market(market),
            sequence,
            items: vec![item],
            contract_type: ContractType::SinglePeriod,
        }
    }

    pub const fn subject(&self) -> Subject {
        self.subject
    }

    pub const fn sequence(&self) -> SequenceId {
        self.sequence
    }

    pub fn items(&self) -> &[SequenceItemId] {
        &self.items
    }

    /// First (front) sequence item; every contract type has at least one.
    pub fn front_item(&self) -> SequenceItemId {
        self.items[0]
    }

    pub const fn contract_type(&self) -> ContractType {
        self.contract_type
    }
}

impl Display for ContractSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/seq:{}/", self.subject, self.sequence)?;
        for (index, item) in self.items.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{item}")?;
        }
        write!(f, " ({})", self.contract_type)
    }
}

/// Wire form of a contract spec: either `market_id` or `instrument_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContractSpecRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    market_id: Option<MarketId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instrument_id: Option<InstrumentId>,
    sequence_id: SequenceId,
    sequence_item_ids: Vec<SequenceItemId>,
    contract_type: ContractType,
}

impl TryFrom<ContractSpecRecord> for ContractSpec {
    type Error = ValidationError;

    fn try_from(record: ContractSpecRecord) -> Result<Self, Self::Error> {
        let subject = match (record.market_id, record.instrument_id) {
            (Some(market), None) => Subject::Market(market),
            (None, Some(instrument)) => Subject::Instrument(instrument),
            _ => return Err(ValidationError::AmbiguousSubject),
        };
        Self::new(
            subject,
            record.sequence_id,
            record.sequence_item_ids,
            record.contract_type,
        )
    }
}

impl From<ContractSpec> for ContractSpecRecord {
    fn from(spec: ContractSpec) -> Self {
        let (market_id, instrument_id) = match spec.subject {
            Subject::Market(id) => (Some(id), None),
            Subject::Instrument(id) => (None, Some(id)),
        };
        Self {
            market_id,
            instrument_id,
            sequence_id: spec.sequence,
            sequence_item_ids: spec.items,
            contract_type: spec.contract_type,
        }
    }
}
