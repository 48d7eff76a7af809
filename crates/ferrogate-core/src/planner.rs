//! Turns a set of contract specs into the fewest calls an endpoint allows.
//!
//! Planning is a pure function of the input specs and the endpoint's
//! [`CapabilityDescriptor`]; nothing here performs I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::capability::{BatchDimension, CapabilityDescriptor, CapabilityMatrix};
use crate::{
    ContractSpec, ContractType, DateWindow, EndpointId, Granularity, SequenceId, Subject,
    ValidationError,
};

/// Planning failures. All are fatal; no partial plan is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("endpoint '{endpoint}' has no capability descriptor")]
    UnknownEndpoint { endpoint: EndpointId },

    #[error("cannot plan an empty contract list")]
    EmptyInput,

    #[error("contract {spec} was requested more than once")]
    DuplicateSpec { spec: String },

    #[error("internal planning error: {missing} contract(s) uncovered, {duplicated} covered more than once")]
    Incomplete { missing: usize, duplicated: usize },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// How a sub-query addresses the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    BulkBySequenceItem,
    BulkByMarket,
    Single,
}

impl QueryMode {
    pub const fn is_bulk(self) -> bool {
        !matches!(self, Self::Single)
    }
}

/// One planned remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubQuery {
    endpoint: EndpointId,
    mode: QueryMode,
    specs: Vec<ContractSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    window: Option<DateWindow>,
}

impl SubQuery {
    fn new(endpoint: &EndpointId, mode: QueryMode, specs: Vec<ContractSpec>) -> Self {
        Self {
            endpoint: endpoint.clone(),
            mode,
            specs,
            window: None,
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub const fn mode(&self) -> QueryMode {
        self.mode
    }

    /// Covered specs, in caller order.
    pub fn specs(&self) -> &[ContractSpec] {
        &self.specs
    }

    pub const fn window(&self) -> Option<DateWindow> {
        self.window
    }

    /// Shared subject and sequence; every sub-query covers one partition.
    pub fn partition(&self) -> Option<(Subject, SequenceId)> {
        self.specs
            .first()
            .map(|spec| (spec.subject(), spec.sequence()))
    }

    fn with_window(&self, window: DateWindow) -> Self {
        Self {
            window: Some(window),
            ..self.clone()
        }
    }
}

/// Ordered sub-queries covering an input spec set exactly once (per window
/// slice, when windowed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryPlan {
    id: Uuid,
    endpoint: EndpointId,
    specs: Vec<ContractSpec>,
    sub_queries: Vec<SubQuery>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    slices: Vec<DateWindow>,
}

impl QueryPlan {
    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// Input specs in caller order.
    pub fn specs(&self) -> &[ContractSpec] {
        &self.specs
    }

    pub fn sub_queries(&self) -> &[SubQuery] {
        &self.sub_queries
    }

    /// Date slices the plan was replicated across; empty for unwindowed plans.
    pub fn slices(&self) -> &[DateWindow] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.sub_queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_queries.is_empty()
    }

    pub fn bulk_count(&self) -> usize {
        self.sub_queries
            .iter()
            .filter(|query| query.mode.is_bulk())
            .count()
    }

    pub fn single_count(&self) -> usize {
        self.len() - self.bulk_count()
    }
}

/// Plans bulk queries against a [`CapabilityMatrix`].
#[derive(Debug, Clone, Default)]
pub struct BulkPlanner {
    matrix: Arc<CapabilityMatrix>,
}

impl BulkPlanner {
    pub fn new(matrix: CapabilityMatrix) -> Self {
        Self {
            matrix: Arc::new(matrix),
        }
    }

    pub fn with_shared(matrix: Arc<CapabilityMatrix>) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &CapabilityMatrix {
        &self.matrix
    }

    pub fn plan(&self, specs: &[ContractSpec], endpoint: &EndpointId) -> Result<QueryPlan, PlanError> {
        let descriptor = self.descriptor(endpoint)?;
        let sub_queries = plan_sub_queries(specs, endpoint, descriptor)?;
        verify_coverage(specs, &sub_queries)?;

        let plan = QueryPlan {
            id: Uuid::new_v4(),
            endpoint: endpoint.clone(),
            specs: specs.to_vec(),
            sub_queries,
            slices: Vec::new(),
        };
        debug!(
            plan_id = %plan.id,
            endpoint = %endpoint,
            specs = specs.len(),
            bulk = plan.bulk_count(),
            single = plan.single_count(),
            "planned bulk query"
        );
        Ok(plan)
    }

    /// Plans `specs` then repeats every sub-query for each slice of `window`
    /// that fits the endpoint's range ceiling. Bulk sub-queries stay ahead of
    /// singles; within each group slices are chronological.
    pub fn plan_window(
        &self,
        specs: &[ContractSpec],
        endpoint: &EndpointId,
        window: DateWindow,
        granularity: Option<Granularity>,
    ) -> Result<QueryPlan, PlanError> {
        let descriptor = self.descriptor(endpoint)?;
        let base = plan_sub_queries(specs, endpoint, descriptor)?;
        verify_coverage(specs, &base)?;

        let slices = match descriptor.max_range.max_days(granularity) {
            Some(max_days) => window.slice(max_days)?,
            None => vec![window],
        };

        let (bulk, single): (Vec<&SubQuery>, Vec<&SubQuery>) =
            base.iter().partition(|query| query.mode.is_bulk());
        let mut sub_queries = Vec::with_capacity(base.len() * slices.len());
        for group in [bulk, single] {
            for slice in &slices {
                sub_queries.extend(group.iter().map(|query| query.with_window(*slice)));
            }
        }

        for slice in &slices {
            let in_slice = sub_queries
                .iter()
                .filter(|query| query.window == Some(*slice))
                .cloned()
                .collect::<Vec<_>>();
            verify_coverage(specs, &in_slice)?;
        }

        let plan = QueryPlan {
            id: Uuid::new_v4(),
            endpoint: endpoint.clone(),
            specs: specs.to_vec(),
            sub_queries,
            slices,
        };
        debug!(
            plan_id = %plan.id,
            endpoint = %endpoint,
            specs = specs.len(),
            slices = plan.slices.len(),
            sub_queries = plan.len(),
            "planned windowed bulk query"
        );
        Ok(plan)
    }

    fn descriptor(&self, endpoint: &EndpointId) -> Result<&CapabilityDescriptor, PlanError> {
        self.matrix
            .get(endpoint)
            .ok_or_else(|| PlanError::UnknownEndpoint {
                endpoint: endpoint.clone(),
            })
    }
}

fn plan_sub_queries(
    specs: &[ContractSpec],
    endpoint: &EndpointId,
    descriptor: &CapabilityDescriptor,
) -> Result<Vec<SubQuery>, PlanError> {
    if specs.is_empty() {
        return Err(PlanError::EmptyInput);
    }

    let mut seen = HashSet::with_capacity(specs.len());
    for spec in specs {
        if !seen.insert(spec) {
            return Err(PlanError::DuplicateSpec {
                spec: spec.to_string(),
            });
        }
    }

    let mut bulk = Vec::new();
    let mut single = Vec::new();
    for partition in partition(specs) {
        match descriptor.batch_dimension {
            BatchDimension::BySequenceItem => {
                let (eligible, rest): (Vec<ContractSpec>, Vec<ContractSpec>) = partition
                    .into_iter()
                    .partition(|spec| spec.contract_type() == ContractType::SinglePeriod);
                match descriptor.max_batch.chunk_size(eligible.len()) {
                    Some(size) if !eligible.is_empty() => {
                        bulk.extend(eligible.chunks(size).map(|chunk| {
                            SubQuery::new(endpoint, QueryMode::BulkBySequenceItem, chunk.to_vec())
                        }));
                    }
                    _ => single.extend(eligible),
                }
                single.extend(rest);
            }
            BatchDimension::ByMarket => {
                let by_market = matches!(partition[0].subject(), Subject::Market(_));
                match descriptor.max_batch.chunk_size(partition.len()) {
                    Some(size) if by_market => {
                        bulk.extend(partition.chunks(size).map(|chunk| {
                            SubQuery::new(endpoint, QueryMode::BulkByMarket, chunk.to_vec())
                        }));
                    }
                    _ => single.extend(partition),
                }
            }
            BatchDimension::None => single.extend(partition),
        }
    }

    bulk.extend(
        single
            .into_iter()
            .map(|spec| SubQuery::new(endpoint, QueryMode::Single, vec![spec])),
    );
    Ok(bulk)
}

/// Groups specs by `(subject, sequence)` in order of first appearance,
/// keeping caller order within each group.
fn partition(specs: &[ContractSpec]) -> Vec<Vec<ContractSpec>> {
    let mut index: HashMap<(Subject, SequenceId), usize> = HashMap::new();
    let mut groups: Vec<Vec<ContractSpec>> = Vec::new();
    for spec in specs {
        let key = (spec.subject(), spec.sequence());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(spec.clone());
    }
    groups
}

fn verify_coverage(specs: &[ContractSpec], sub_queries: &[SubQuery]) -> Result<(), PlanError> {
    let mut counts: HashMap<&ContractSpec, usize> = specs.iter().map(|spec| (spec, 0)).collect();
    let mut duplicated = 0;
    for spec in sub_queries.iter().flat_map(|query| query.specs.iter()) {
        match counts.get_mut(spec) {
            Some(count) => {
                *count += 1;
                if *count > 1 {
                    duplicated += 1;
                }
            }
            // Covering something that was never requested is as wrong as a duplicate.
            None => duplicated += 1,
        }
    }
    let missing = counts.values().filter(|count| **count == 0).count();

    if missing > 0 || duplicated > 0 {
        return Err(PlanError::Incomplete {
            missing,
            duplicated,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BatchLimit, RangeLimit};
    use crate::{InstrumentId, MarketId, SequenceItemId};

    fn spec(market: u64, sequence: u64, item: u64) -> ContractSpec {
        ContractSpec::single_period(MarketId(market), SequenceId(sequence), SequenceItemId(item))
    }

    fn endpoint(name: &str) -> EndpointId {
        EndpointId::parse(name).expect("valid endpoint")
    }

    fn covered(plan: &QueryPlan) -> Vec<ContractSpec> {
        plan.sub_queries()
            .iter()
            .flat_map(|query| query.specs().iter().cloned())
            .collect()
    }

    #[test]
    fn sixty_specs_split_into_fifty_and_ten() {
        let specs = (0..60).map(|item| spec(1, 2, item)).collect::<Vec<_>>();
        let plan = BulkPlanner::default()
            .plan(&specs, &endpoint("trades"))
            .expect("plans");

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.sub_queries()[0].specs().len(), 50);
        assert_eq!(plan.sub_queries()[1].specs().len(), 10);
        assert!(plan
            .sub_queries()
            .iter()
            .all(|query| query.mode() == QueryMode::BulkBySequenceItem));
        assert_eq!(covered(&plan), specs);
    }

    #[test]
    fn unbatched_endpoint_plans_one_call_per_spec() {
        let specs = vec![spec(1, 2, 3), spec(1, 2, 4), spec(5, 6, 7)];
        let plan = BulkPlanner::default()
            .plan(&specs, &endpoint("orders/book"))
            .expect("plans");

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.single_count(), 3);
    }

    #[test]
    fn bulk_queries_are_scheduled_before_singles() {
        let spread = ContractSpec::new(
            Subject::Market(MarketId(1)),
            SequenceId(2),
            vec![SequenceItemId(8), SequenceItemId(9)],
            ContractType::Spread,
        )
        .expect("valid spread");
        let specs = vec![spread.clone(), spec(1, 2, 3), spec(4, 5, 6)];

        let plan = BulkPlanner::default()
            .plan(&specs, &endpoint("trades"))
            .expect("plans");

        let modes = plan
            .sub_queries()
            .iter()
            .map(SubQuery::mode)
            .collect::<Vec<_>>();
        assert_eq!(
            modes,
            vec![
                QueryMode::BulkBySequenceItem,
                QueryMode::BulkBySequenceItem,
                QueryMode::Single
            ]
        );
        assert_eq!(plan.sub_queries()[2].specs(), &[spread]);
    }

    #[test]
    fn by_market_collapses_each_partition() {
        let specs = vec![spec(1, 2, 3), spec(1, 2, 4), spec(1, 9, 5), spec(7, 2, 3)];
        let plan = BulkPlanner::default()
            .plan(&specs, &endpoint("trades/activity"))
            .expect("plans");

        assert_eq!(plan.len(), 3);
        assert!(plan
            .sub_queries()
            .iter()
            .all(|query| query.mode() == QueryMode::BulkByMarket));
        assert_eq!(plan.sub_queries()[0].specs(), &specs[..2]);
    }

    #[test]
    fn by_market_falls_back_to_single_for_instruments() {
        let instrument = ContractSpec::new(
            Subject::Instrument(InstrumentId(4)),
            SequenceId(2),
            vec![SequenceItemId(3)],
            ContractType::SinglePeriod,
        )
        .expect("valid spec");

        let plan = BulkPlanner::default()
            .plan(&[instrument], &endpoint("trades/activity"))
            .expect("plans");

        assert_eq!(plan.sub_queries()[0].mode(), QueryMode::Single);
    }

    #[test]
    fn duplicates_and_empty_input_are_rejected() {
        let planner = BulkPlanner::default();
        let trades = endpoint("trades");

        assert_eq!(planner.plan(&[], &trades), Err(PlanError::EmptyInput));
        assert!(matches!(
            planner.plan(&[spec(1, 2, 3), spec(1, 2, 3)], &trades),
            Err(PlanError::DuplicateSpec { .. })
        ));
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let err = BulkPlanner::default()
            .plan(&[spec(1, 2, 3)], &endpoint("settlements"))
            .expect_err("must fail");
        assert!(matches!(err, PlanError::UnknownEndpoint { .. }));
    }

    #[test]
    fn coverage_check_reports_gaps_and_duplicates() {
        let specs = vec![spec(1, 2, 3), spec(1, 2, 4)];
        let trades = endpoint("trades");
        let lopsided = vec![
            SubQuery::new(&trades, QueryMode::Single, vec![specs[0].clone()]),
            SubQuery::new(&trades, QueryMode::Single, vec![specs[0].clone()]),
        ];

        assert_eq!(
            verify_coverage(&specs, &lopsided),
            Err(PlanError::Incomplete {
                missing: 1,
                duplicated: 1
            })
        );
    }

    #[test]
    fn windowed_plan_repeats_sub_queries_per_slice() {
        let specs = vec![spec(1, 2, 3), spec(1, 2, 4)];
        let window = DateWindow::parse("2024-01-01", "2024-03-31").expect("valid window");

        let plan = BulkPlanner::default()
            .plan_window(&specs, &endpoint("trades"), window, None)
            .expect("plans");

        assert_eq!(plan.slices().len(), 3);
        assert_eq!(plan.len(), 3);
        let windows = plan
            .sub_queries()
            .iter()
            .filter_map(SubQuery::window)
            .collect::<Vec<_>>();
        assert_eq!(windows, plan.slices());
    }

    #[test]
    fn unbounded_endpoint_keeps_window_whole() {
        let matrix = CapabilityMatrix::empty().with(
            endpoint("snapshots"),
            CapabilityDescriptor::new(
                BatchDimension::BySequenceItem,
                BatchLimit::Unlimited,
                RangeLimit::Unbounded,
            ),
        );
        let window = DateWindow::parse("2020-01-01", "2024-01-01").expect("valid window");

        let plan = BulkPlanner::new(matrix)
            .plan_window(&[spec(1, 2, 3)], &endpoint("snapshots"), window, None)
            .expect("plans");

        assert_eq!(plan.slices(), &[window]);
        assert_eq!(plan.sub_queries()[0].window(), Some(window));
    }
}
