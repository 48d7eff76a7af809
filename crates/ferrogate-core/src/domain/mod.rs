//! # Domain Types
//!
//! Identifiers and value types shared by the planner, executor and dispatcher.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`EndpointId`] | Normalized remote endpoint path |
//! | [`MarketId`], [`InstrumentId`] | What a contract trades on |
//! | [`SequenceId`], [`SequenceItemId`] | Delivery sequence and period |
//! | [`ContractSpec`] | One queryable contract |
//! | [`Granularity`] | Aggregation bucket size |
//! | [`DateWindow`] | Half-open UTC query window with slicing |
//!
//! All types validate at construction; an invalid `ContractSpec` cannot be
//! built or deserialized.

mod contract;
mod granularity;
mod ids;
mod window;

pub use contract::{ContractSpec, ContractType, Subject};
pub use granularity::{Granularity, IntervalUnit};
pub use ids::{EndpointId, InstrumentId, MarketId, SequenceId, SequenceItemId};
pub use window::{DateWindow, UtcDateTime};
