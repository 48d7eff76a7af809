//! Runs a [`QueryPlan`] through a [`Dispatcher`] with bounded concurrency.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::http_client::ApiRequest;
use crate::planner::{QueryMode, QueryPlan, SubQuery};
use crate::transport::{FailureClassifier, Transport};
use crate::{ContractSpec, Subject};

/// Builds the transport request for one sub-query.
pub trait SubQueryEncoder<R>: Send + Sync {
    fn encode(&self, sub_query: &SubQuery) -> R;
}

impl<R, F> SubQueryEncoder<R> for F
where
    F: Fn(&SubQuery) -> R + Send + Sync,
{
    fn encode(&self, sub_query: &SubQuery) -> R {
        self(sub_query)
    }
}

const ITEM_PARAMS: [&str; 4] = [
    "sequenceItemId",
    "secondSequenceItemId",
    "thirdSequenceItemId",
    "fourthSequenceItemId",
];

/// Encodes sub-queries as upstream query parameters.
#[derive(Debug, Clone, Default)]
pub struct ParamsEncoder {
    extra: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl ParamsEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter sent with every sub-query, e.g. `ohlcvInterval`.
    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.extra.insert(name.into(), value.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl SubQueryEncoder<ApiRequest> for ParamsEncoder {
    fn encode(&self, sub_query: &SubQuery) -> ApiRequest {
        let mut request = ApiRequest::new();
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }

        let specs = sub_query.specs();
        if let Some((subject, sequence)) = sub_query.partition() {
            request = match subject {
                Subject::Market(id) => request.with_param("marketId", id),
                Subject::Instrument(id) => request.with_param("instrumentId", id),
            };
            request = request.with_param("sequenceId", sequence);
        }

        match sub_query.mode() {
            QueryMode::BulkBySequenceItem => {
                let items = specs
                    .iter()
                    .map(|spec| spec.front_item().to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                request = request
                    .with_param("sequenceItemId", items)
                    .with_param("contractType", "SinglePeriod");
            }
            QueryMode::BulkByMarket => {}
            QueryMode::Single => {
                if let Some(spec) = specs.first() {
                    for (name, item) in ITEM_PARAMS.iter().zip(spec.items()) {
                        request = request.with_param(*name, item);
                    }
                    request = request.with_param("contractType", spec.contract_type());
                }
            }
        }

        if let Some(window) = sub_query.window() {
            request = request
                .with_param("from", window.from().format_api())
                .with_param("until", window.until().format_api());
        }

        for (name, value) in &self.extra {
            request = request.with_param(name.clone(), value);
        }
        request
    }
}

/// Result for one requested contract. Successful entries hold the response of
/// every call that covered the contract, in chronological slice order; bulk
/// responses are shared between the contracts they cover.
#[derive(Debug)]
pub struct BulkEntry<R> {
    pub spec: ContractSpec,
    pub outcome: Result<Vec<Arc<R>>, DispatchError>,
}

impl<R> BulkEntry<R> {
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// One entry per requested contract, in the plan's input order.
#[derive(Debug)]
pub struct BulkResult<R> {
    plan_id: Uuid,
    entries: Vec<BulkEntry<R>>,
}

impl<R> BulkResult<R> {
    pub const fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn entries(&self) -> &[BulkEntry<R>] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BulkEntry<R>> {
        self.entries
    }

    pub fn get(&self, spec: &ContractSpec) -> Option<&BulkEntry<R>> {
        self.entries.iter().find(|entry| &entry.spec == spec)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ContractSpec, &DispatchError)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.outcome.as_ref().err().map(|error| (&entry.spec, error)))
    }
}

/// Drives plans through a dispatcher.
pub struct BulkExecutor<T: Transport> {
    dispatcher: Arc<Dispatcher<T>>,
    encoder: Arc<dyn SubQueryEncoder<T::Request>>,
    classifier: Arc<dyn FailureClassifier<T::Response>>,
}

impl<T: Transport> std::fmt::Debug for BulkExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkExecutor")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> BulkExecutor<T> {
    pub fn new<E, C>(dispatcher: Arc<Dispatcher<T>>, encoder: E, classifier: C) -> Self
    where
        E: SubQueryEncoder<T::Request> + 'static,
        C: FailureClassifier<T::Response> + 'static,
    {
        Self {
            dispatcher,
            encoder: Arc::new(encoder),
            classifier: Arc::new(classifier),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    /// Executes every sub-query, at most `concurrency` at a time, and records
    /// each outcome against every contract it covers. One failing sub-query
    /// never affects the others.
    pub async fn run(
        &self,
        plan: &QueryPlan,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> BulkResult<T::Response> {
        let limit = concurrency.max(1);
        let mut outcomes = stream::iter(plan.sub_queries().iter().enumerate())
            .map(|(index, sub_query)| async move {
                let request = self.encoder.encode(sub_query);
                let outcome = self
                    .dispatcher
                    .execute(sub_query.endpoint(), request, self.classifier.as_ref(), cancel)
                    .await;
                (index, outcome)
            })
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let positions: HashMap<&ContractSpec, usize> = plan
            .specs()
            .iter()
            .enumerate()
            .map(|(position, spec)| (spec, position))
            .collect();
        let mut entries = plan
            .specs()
            .iter()
            .map(|spec| BulkEntry {
                spec: spec.clone(),
                outcome: Ok(Vec::new()),
            })
            .collect::<Vec<_>>();

        for (index, outcome) in outcomes {
            let covered = plan.sub_queries()[index]
                .specs()
                .iter()
                .filter_map(|spec| positions.get(spec).copied());
            match outcome {
                Ok(response) => {
                    let response = Arc::new(response);
                    for position in covered {
                        if let Ok(responses) = &mut entries[position].outcome {
                            responses.push(Arc::clone(&response));
                        }
                    }
                }
                Err(error) => {
                    for position in covered {
                        if entries[position].outcome.is_ok() {
                            entries[position].outcome = Err(error.clone());
                        }
                    }
                }
            }
        }

        let result = BulkResult {
            plan_id: plan.id(),
            entries,
        };
        info!(
            plan_id = %plan.id(),
            endpoint = %plan.endpoint(),
            sub_queries = plan.len(),
            succeeded = result.success_count(),
            failed = result.failure_count(),
            "bulk run finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::BulkPlanner;
    use crate::{ContractType, DateWindow, EndpointId, MarketId, SequenceId, SequenceItemId};

    fn spec(item: u64) -> ContractSpec {
        ContractSpec::single_period(MarketId(10), SequenceId(20), SequenceItemId(item))
    }

    fn endpoint(name: &str) -> EndpointId {
        EndpointId::parse(name).expect("valid endpoint")
    }

    #[test]
    fn bulk_sub_query_joins_front_items() {
        let plan = BulkPlanner::default()
            .plan(&[spec(1), spec(2), spec(3)], &endpoint("trades"))
            .expect("plans");

        let request = ParamsEncoder::new().encode(&plan.sub_queries()[0]);

        assert_eq!(request.param("marketId"), Some("10"));
        assert_eq!(request.param("sequenceId"), Some("20"));
        assert_eq!(request.param("sequenceItemId"), Some("1,2,3"));
        assert_eq!(request.param("contractType"), Some("SinglePeriod"));
        assert_eq!(request.param("from"), None);
    }

    #[test]
    fn single_spread_names_each_item() {
        let spread = ContractSpec::new(
            Subject::Market(MarketId(10)),
            SequenceId(20),
            vec![SequenceItemId(5), SequenceItemId(6)],
            ContractType::Spread,
        )
        .expect("valid spread");
        let plan = BulkPlanner::default()
            .plan(&[spread], &endpoint("orders/book"))
            .expect("plans");

        let request = ParamsEncoder::new()
            .with_param("depth", 5)
            .encode(&plan.sub_queries()[0]);

        assert_eq!(request.param("sequenceItemId"), Some("5"));
        assert_eq!(request.param("secondSequenceItemId"), Some("6"));
        assert_eq!(request.param("thirdSequenceItemId"), None);
        assert_eq!(request.param("contractType"), Some("Spread"));
        assert_eq!(request.param("depth"), Some("5"));
    }

    #[test]
    fn windowed_sub_query_carries_api_timestamps() {
        let window = DateWindow::parse("2024-01-01", "2024-01-03").expect("valid window");
        let plan = BulkPlanner::default()
            .plan_window(&[spec(1)], &endpoint("trades/activity"), window, None)
            .expect("plans");

        let request = ParamsEncoder::new().encode(&plan.sub_queries()[0]);

        assert_eq!(request.param("from"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(request.param("until"), Some("2024-01-03T00:00:00Z"));
        assert_eq!(request.param("sequenceItemId"), None);
    }
}
