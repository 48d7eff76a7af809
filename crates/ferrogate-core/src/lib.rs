//! # Ferrogate Core
//!
//! Client-side dispatch layer for a market data API with strict rate limits,
//! per-endpoint date-range ceilings and uneven batching support.
//!
//! ## Overview
//!
//! - **Admission control**: a dual-window rate gate with a safety margin,
//!   burst spacing and adaptive throttling after upstream rejections
//! - **Resilience**: retry with capped exponential backoff and jitter, and a
//!   three-state circuit breaker per endpoint
//! - **Bulk planning**: contract lists are grouped into the fewest calls the
//!   endpoint's capabilities allow, sliced by date range when needed
//! - **Bulk execution**: plans run with bounded concurrency and every
//!   requested contract gets either data or a typed failure
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Response cache hook with TTL storage |
//! | [`capability`] | Per-endpoint batching and date-range limits |
//! | [`circuit_breaker`] | Circuit breaker for resilient calls |
//! | [`config`] | Dispatch configuration and environment overrides |
//! | [`dispatcher`] | Gated, retried execution of one logical call |
//! | [`domain`] | Contracts, ids, granularities and date windows |
//! | [`error`] | Core error types |
//! | [`executor`] | Bounded-concurrency plan execution |
//! | [`http_client`] | reqwest transport and status-code classification |
//! | [`planner`] | Bulk query planning |
//! | [`retry`] | Retry policy with exponential backoff |
//! | [`throttling`] | Dual-window rate gate |
//! | [`transport`] | Transport and failure classifier contracts |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use ferrogate_core::{
//!     ApiAuth, BulkExecutor, BulkPlanner, ContractSpec, DispatchConfig, Dispatcher, EndpointId,
//!     MarketId, ParamsEncoder, ReqwestTransport, SequenceId, SequenceItemId, StatusClassifier,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DispatchConfig::from_env()?;
//!     let transport = ReqwestTransport::new(ApiAuth::ApiKey(std::env::var("API_KEY")?));
//!     let dispatcher = Arc::new(Dispatcher::from_config(transport, &config)?);
//!
//!     let specs = (1..=60)
//!         .map(|item| ContractSpec::single_period(MarketId(10), SequenceId(20), SequenceItemId(item)))
//!         .collect::<Vec<_>>();
//!     let plan = BulkPlanner::default().plan(&specs, &EndpointId::parse("trades/last")?)?;
//!
//!     let executor = BulkExecutor::new(dispatcher, ParamsEncoder::new(), StatusClassifier);
//!     let result = executor.run(&plan, config.concurrency, &CancellationToken::new()).await;
//!     for (spec, error) in result.failures() {
//!         eprintln!("{spec}: {error}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │  BulkPlanner    │────▶│ CapabilityMatrix │
//! └────────┬────────┘     └──────────────────┘
//!          │ QueryPlan
//!          ▼
//! ┌─────────────────┐
//! │  BulkExecutor   │  bounded worker pool
//! └────────┬────────┘
//!          │ one SubQuery
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │  Dispatcher     │────▶│ CircuitBreaker   │
//! │                 │────▶│ RateGate         │
//! │                 │────▶│ RetryPolicy      │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Transport       │
//! │ (reqwest/noop)  │
//! └─────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Retries happen inside the dispatcher; only the terminal outcome crosses
//! its boundary:
//!
//! ```rust
//! use ferrogate_core::{DispatchError, FailureKind};
//!
//! fn handle_error(error: &DispatchError) {
//!     match error {
//!         DispatchError::BreakerOpen { retry_in, .. } => {
//!             // Endpoint is unhealthy; try again after `retry_in`
//!             let _ = retry_in;
//!         }
//!         DispatchError::Fatal { failure, .. } if failure.kind() == FailureKind::Authentication => {
//!             // Report to user
//!         }
//!         DispatchError::Exhausted { .. } => {
//!             // Upstream kept failing
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! Events are emitted through `tracing`; installing a subscriber is left to
//! the application. Gate and breaker state can be polled with
//! [`RateGate::utilization`] and [`Dispatcher::breaker_snapshots`].

pub mod cache;
pub mod capability;
pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod planner;
pub mod retry;
pub mod throttling;
pub mod transport;

// Re-export commonly used types at crate root for convenience

// Caching
pub use cache::{CacheMode, ResponseCache, TtlCache};

// Capabilities
pub use capability::{
    BatchDimension, BatchLimit, CapabilityDescriptor, CapabilityMatrix, RangeLimit,
};

// Circuit breaker
pub use circuit_breaker::{
    BreakerPermit, BreakerRejected, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitState,
};

// Configuration
pub use config::DispatchConfig;

// Dispatch
pub use dispatcher::{BreakerWaitPolicy, DispatchError, Dispatcher, DispatcherBuilder};

// Domain models
pub use domain::{
    ContractSpec, ContractType, DateWindow, EndpointId, Granularity, InstrumentId, IntervalUnit,
    MarketId, SequenceId, SequenceItemId, Subject, UtcDateTime,
};

// Error types
pub use error::{ConfigError, CoreError, ValidationError};

// Bulk execution
pub use executor::{BulkEntry, BulkExecutor, BulkResult, ParamsEncoder, SubQueryEncoder};

// HTTP client types
pub use http_client::{
    ApiAuth, ApiRequest, ApiResponse, NoopTransport, ReqwestTransport, StatusClassifier,
};

// Planning
pub use planner::{BulkPlanner, PlanError, QueryMode, QueryPlan, SubQuery};

// Retry logic
pub use retry::{RetryAttempt, RetryDecision, RetryPolicy};

// Throttling
pub use throttling::{
    AdmissionDenied, BudgetUsage, DenyReason, GateUtilization, RateGate, RateGateConfig,
    TokenBudget,
};

// Transport contracts
pub use transport::{
    Classification, Failure, FailureClassifier, FailureKind, Transport, TransportError,
    TransportErrorKind,
};
