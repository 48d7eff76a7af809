//! Static description of what each upstream endpoint can batch and how long a
//! date range it accepts in one call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EndpointId, Granularity};

/// Which entity dimension an endpoint can batch over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchDimension {
    /// Several sequence items of one market/sequence in a single call.
    BySequenceItem,
    /// Everything for one market in a single call.
    ByMarket,
    None,
}

/// Maximum contracts per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchLimit {
    Unsupported,
    AtMost(usize),
    Unlimited,
}

impl BatchLimit {
    /// Chunk size for a batch, or `None` when batching is unsupported.
    pub fn chunk_size(self, total: usize) -> Option<usize> {
        match self {
            Self::Unsupported | Self::AtMost(0) => None,
            Self::AtMost(limit) => Some(limit),
            Self::Unlimited => Some(total.max(1)),
        }
    }
}

/// Longest date range accepted by one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeLimit {
    Unbounded,
    Days(u32),
    /// Depends on whether buckets are shorter than a day.
    Tiered { intraday: u32, daily: u32 },
}

impl RangeLimit {
    /// Ceiling in days for `granularity`; daily buckets are assumed when none is given.
    pub fn max_days(self, granularity: Option<Granularity>) -> Option<u32> {
        match self {
            Self::Unbounded => None,
            Self::Days(days) => Some(days),
            Self::Tiered { intraday, daily } => {
                let granularity = granularity.unwrap_or(Granularity::ONE_DAY);
                Some(if granularity.is_intraday() { intraday } else { daily })
            }
        }
    }
}

/// Capabilities of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub batch_dimension: BatchDimension,
    pub max_batch: BatchLimit,
    pub max_range: RangeLimit,
}

impl CapabilityDescriptor {
    pub const fn new(
        batch_dimension: BatchDimension,
        max_batch: BatchLimit,
        max_range: RangeLimit,
    ) -> Self {
        Self {
            batch_dimension,
            max_batch,
            max_range,
        }
    }

    /// One contract per call, no range ceiling.
    pub const fn single() -> Self {
        Self::new(BatchDimension::None, BatchLimit::Unsupported, RangeLimit::Unbounded)
    }

    pub fn supports_bulk(&self) -> bool {
        self.batch_dimension != BatchDimension::None
            && !matches!(self.max_batch, BatchLimit::Unsupported | BatchLimit::AtMost(0))
    }
}

/// Endpoint capability lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMatrix {
    entries: BTreeMap<EndpointId, CapabilityDescriptor>,
}

impl Default for CapabilityMatrix {
    fn default() -> Self {
        Self::upstream()
    }
}

impl CapabilityMatrix {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Published limits of the upstream trading data API.
    pub fn upstream() -> Self {
        const BULK_ITEMS: BatchLimit = BatchLimit::AtMost(50);
        let rows = [
            (
                "trades",
                CapabilityDescriptor::new(BatchDimension::BySequenceItem, BULK_ITEMS, RangeLimit::Days(32)),
            ),
            (
                "trades/ohlcv",
                CapabilityDescriptor::new(
                    BatchDimension::BySequenceItem,
                    BULK_ITEMS,
                    RangeLimit::Tiered {
                        intraday: 92,
                        daily: 1827,
                    },
                ),
            ),
            (
                "trades/private",
                CapabilityDescriptor::new(BatchDimension::BySequenceItem, BULK_ITEMS, RangeLimit::Days(32)),
            ),
            ("trades/last", CapabilityDescriptor::single()),
            (
                "trades/activity",
                CapabilityDescriptor::new(BatchDimension::ByMarket, BatchLimit::Unlimited, RangeLimit::Days(7)),
            ),
            (
                "orders/book",
                CapabilityDescriptor::new(BatchDimension::None, BatchLimit::Unsupported, RangeLimit::Days(60)),
            ),
            (
                "orders/book/top",
                CapabilityDescriptor::new(BatchDimension::None, BatchLimit::Unsupported, RangeLimit::Days(60)),
            ),
        ];

        let mut matrix = Self::empty();
        for (endpoint, descriptor) in rows {
            if let Ok(endpoint) = EndpointId::parse(endpoint) {
                matrix.entries.insert(endpoint, descriptor);
            }
        }
        matrix
    }

    pub fn with(mut self, endpoint: EndpointId, descriptor: CapabilityDescriptor) -> Self {
        self.insert(endpoint, descriptor);
        self
    }

    pub fn insert(&mut self, endpoint: EndpointId, descriptor: CapabilityDescriptor) {
        self.entries.insert(endpoint, descriptor);
    }

    pub fn get(&self, endpoint: &EndpointId) -> Option<&CapabilityDescriptor> {
        self.entries.get(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
