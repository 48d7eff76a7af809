use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheMode, ResponseCache};
use crate::circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
};
use crate::retry::{RetryAttempt, RetryDecision, RetryPolicy};
use crate::throttling::{GateUtilization, RateGate, RateGateConfig};
use crate::transport::{Classification, Failure, FailureClassifier, Transport};
use crate::{DispatchConfig, EndpointId, ValidationError};

/// What to do when an endpoint's breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerWaitPolicy {
    /// Fail immediately with [`DispatchError::BreakerOpen`].
    #[default]
    FailFast,
    /// Suspend until the reset timeout elapses, then probe.
    WaitForReset,
}

/// Terminal outcome of a logical call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("circuit breaker for '{endpoint}' is open; retry in {}ms", retry_in.as_millis())]
    BreakerOpen {
        endpoint: EndpointId,
        retry_in: Duration,
        /// Failure of this call's previous attempt, when that attempt is
        /// what tripped the breaker.
        last: Option<Failure>,
    },

    #[error("call to '{endpoint}' failed after {attempts} attempt(s): {failure}")]
    Fatal {
        endpoint: EndpointId,
        attempts: u32,
        failure: Failure,
    },

    #[error("call to '{endpoint}' still failing after {attempts} attempt(s): {last}")]
    Exhausted {
        endpoint: EndpointId,
        attempts: u32,
        last: Failure,
    },

    #[error("call to '{endpoint}' was cancelled")]
    Cancelled { endpoint: EndpointId },
}

impl DispatchError {
    pub fn endpoint(&self) -> &EndpointId {
        match self {
            Self::BreakerOpen { endpoint, .. }
            | Self::Fatal { endpoint, .. }
            | Self::Exhausted { endpoint, .. }
            | Self::Cancelled { endpoint } => endpoint,
        }
    }

    /// Underlying transport failure, if the call reached the transport.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Fatal { failure, .. } => Some(failure),
            Self::Exhausted { last, .. } => Some(last),
            Self::BreakerOpen { last, .. } => last.as_ref(),
            Self::Cancelled { .. } => None,
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

type SharedCache<T> =
    Arc<dyn ResponseCache<<T as Transport>::Request, <T as Transport>::Response>>;

/// Executes logical calls against one upstream API through a shared rate
/// gate, per-endpoint circuit breakers and a retry policy.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    cache: Option<SharedCache<T>>,
    cache_mode: CacheMode,
    gate: Arc<RateGate>,
    endpoint_gates: HashMap<EndpointId, Arc<RateGate>>,
    breaker_config: CircuitBreakerConfig,
    breakers: RwLock<BTreeMap<EndpointId, Arc<CircuitBreaker>>>,
    retry: RetryPolicy,
    wait_policy: BreakerWaitPolicy,
}

impl<T: Transport> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("retry", &self.retry)
            .field("wait_policy", &self.wait_policy)
            .field("cached", &self.cache.is_some())
            .field("cache_mode", &self.cache_mode)
            .field("breakers", &self.breakers.read().len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Dispatcher<T> {
    pub fn builder(transport: T) -> DispatcherBuilder<T> {
        DispatcherBuilder::new(Arc::new(transport))
    }

    pub fn from_config(transport: T, config: &DispatchConfig) -> Result<Self, ValidationError> {
        Self::builder(transport)
            .rate_gate(config.rate_gate.clone())
            .circuit_breaker(config.circuit_breaker)
            .retry_policy(config.retry)
            .breaker_wait_policy(config.breaker_wait)
            .build()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Shared gate, used by every endpoint without its own override.
    pub fn rate_gate(&self) -> &RateGate {
        &self.gate
    }

    fn gate_for(&self, endpoint: &EndpointId) -> &RateGate {
        self.endpoint_gates.get(endpoint).unwrap_or(&self.gate)
    }

    /// Breaker for `endpoint`, created on first use.
    pub fn breaker(&self, endpoint: &EndpointId) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(endpoint) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(self.breaker_config).with_name(endpoint.as_str()))
        }))
    }

    pub fn breaker_snapshots(&self) -> Vec<(EndpointId, BreakerSnapshot)> {
        let now = Instant::now();
        self.breakers
            .read()
            .iter()
            .map(|(endpoint, breaker)| (endpoint.clone(), breaker.snapshot(now)))
            .collect()
    }

    pub fn gate_utilization(&self, endpoint: &EndpointId) -> GateUtilization {
        self.gate_for(endpoint).utilization(Instant::now())
    }

    pub const fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    /// Runs one logical call to completion: breaker check, rate-gate
    /// admission, one transport attempt, classification, then retry or
    /// return. Each attempt is gated like a fresh call. The response cache,
    /// if any, is consulted with the dispatcher's default [`CacheMode`].
    pub async fn execute<C>(
        &self,
        endpoint: &EndpointId,
        request: T::Request,
        classifier: &C,
        cancel: &CancellationToken,
    ) -> Result<T::Response, DispatchError>
    where
        C: FailureClassifier<T::Response> + ?Sized,
    {
        self.execute_with_mode(endpoint, request, classifier, self.cache_mode, cancel)
            .await
    }

    /// [`execute`](Self::execute) with an explicit cache mode for this call.
    pub async fn execute_with_mode<C>(
        &self,
        endpoint: &EndpointId,
        request: T::Request,
        classifier: &C,
        mode: CacheMode,
        cancel: &CancellationToken,
    ) -> Result<T::Response, DispatchError>
    where
        C: FailureClassifier<T::Response> + ?Sized,
    {
        if cancel.is_cancelled() {
            return Err(cancelled(endpoint));
        }

        let cache = self.cache.as_deref();
        if mode.reads() {
            if let Some(response) = cache.and_then(|cache| cache.lookup(endpoint, &request)) {
                debug!(endpoint = %endpoint, "served from cache");
                return Ok(response);
            }
        }

        let response = self.dispatch(endpoint, &request, classifier, cancel).await?;
        if mode.writes() {
            if let Some(cache) = cache {
                cache.store(endpoint, &request, &response);
            }
        }
        Ok(response)
    }

    async fn dispatch<C>(
        &self,
        endpoint: &EndpointId,
        request: &T::Request,
        classifier: &C,
        cancel: &CancellationToken,
    ) -> Result<T::Response, DispatchError>
    where
        C: FailureClassifier<T::Response> + ?Sized,
    {
        let breaker = self.breaker(endpoint);
        let gate = self.gate_for(endpoint);
        let mut attempt = RetryAttempt::first(self.retry.max_attempts);
        let mut last_failure: Option<Failure> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(endpoint));
            }

            let permit = match self.acquire_breaker(&breaker, endpoint, cancel).await {
                Ok(permit) => permit,
                Err(DispatchError::BreakerOpen {
                    endpoint, retry_in, ..
                }) => {
                    return Err(DispatchError::BreakerOpen {
                        endpoint,
                        retry_in,
                        last: last_failure,
                    })
                }
                Err(err) => return Err(err),
            };
            self.admit(gate, endpoint, cancel).await?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(endpoint)),
                outcome = self.transport.send(endpoint, request.clone(), cancel) => outcome,
            };
            let now = Instant::now();
            let classification = classifier.classify(outcome);
            let decision = self.retry.decide(attempt, &classification);

            let failure = match classification {
                Classification::Success(response) => {
                    permit.succeed();
                    return Ok(response);
                }
                Classification::Fatal(failure) => {
                    permit.fail(now);
                    warn!(
                        endpoint = %endpoint,
                        attempt = attempt.number(),
                        error = %failure,
                        "call failed fatally"
                    );
                    return Err(DispatchError::Fatal {
                        endpoint: endpoint.clone(),
                        attempts: attempt.number(),
                        failure,
                    });
                }
                Classification::Retryable(failure) => {
                    permit.fail(now);
                    failure
                }
            };

            if failure.is_rate_limited() {
                gate.record_rejection(now);
            }

            match decision {
                RetryDecision::Retry { delay } => {
                    if self.wait_policy == BreakerWaitPolicy::FailFast {
                        if let Some(retry_in) = breaker.open_remaining(now) {
                            if retry_in > delay {
                                warn!(
                                    endpoint = %endpoint,
                                    attempt = attempt.number(),
                                    retry_in_ms = retry_in.as_millis() as u64,
                                    error = %failure,
                                    "breaker opened; abandoning retries"
                                );
                                return Err(DispatchError::BreakerOpen {
                                    endpoint: endpoint.clone(),
                                    retry_in,
                                    last: Some(failure),
                                });
                            }
                        }
                    }
                    warn!(
                        endpoint = %endpoint,
                        attempt = attempt.number(),
                        max_attempts = attempt.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying after retryable failure"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(cancelled(endpoint)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.next();
                    last_failure = Some(failure);
                }
                RetryDecision::Exhausted | RetryDecision::Stop => {
                    warn!(
                        endpoint = %endpoint,
                        attempts = attempt.number(),
                        error = %failure,
                        "retries exhausted"
                    );
                    return Err(DispatchError::Exhausted {
                        endpoint: endpoint.clone(),
                        attempts: attempt.number(),
                        last: failure,
                    });
                }
            }
        }
    }

    async fn acquire_breaker<'b>(
        &self,
        breaker: &'b CircuitBreaker,
        endpoint: &EndpointId,
        cancel: &CancellationToken,
    ) -> Result<BreakerPermit<'b>, DispatchError> {
        loop {
            let rejected = match breaker.try_acquire(Instant::now()) {
                Ok(permit) => return Ok(permit),
                Err(rejected) => rejected,
            };

            match self.wait_policy {
                BreakerWaitPolicy::FailFast => {
                    debug!(endpoint = %endpoint, retry_in_ms = rejected.retry_in.as_millis() as u64, "breaker open; failing fast");
                    return Err(DispatchError::BreakerOpen {
                        endpoint: endpoint.clone(),
                        retry_in: rejected.retry_in,
                        last: None,
                    });
                }
                BreakerWaitPolicy::WaitForReset => {
                    debug!(endpoint = %endpoint, retry_in_ms = rejected.retry_in.as_millis() as u64, "breaker open; waiting for reset");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(cancelled(endpoint)),
                        _ = tokio::time::sleep(rejected.retry_in) => {}
                    }
                }
            }
        }
    }

    async fn admit(
        &self,
        gate: &RateGate,
        endpoint: &EndpointId,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        loop {
            let denied = match gate.try_admit(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(denied) => denied,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(endpoint)),
                _ = tokio::time::sleep_until(denied.wait_until) => {}
            }
        }
    }
}

fn cancelled(endpoint: &EndpointId) -> DispatchError {
    debug!(endpoint = %endpoint, "call cancelled");
    DispatchError::Cancelled {
        endpoint: endpoint.clone(),
    }
}

/// Composition root for a [`Dispatcher`].
pub struct DispatcherBuilder<T: Transport> {
    transport: Arc<T>,
    cache: Option<SharedCache<T>>,
    cache_mode: CacheMode,
    gate: RateGateConfig,
    endpoint_gates: Vec<(EndpointId, RateGateConfig)>,
    breaker: CircuitBreakerConfig,
    retry: RetryPolicy,
    wait_policy: BreakerWaitPolicy,
}

impl<T: Transport> std::fmt::Debug for DispatcherBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("gate", &self.gate)
            .field("endpoint_gates", &self.endpoint_gates)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("wait_policy", &self.wait_policy)
            .field("cached", &self.cache.is_some())
            .field("cache_mode", &self.cache_mode)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> DispatcherBuilder<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            cache: None,
            cache_mode: CacheMode::default(),
            gate: RateGateConfig::default(),
            endpoint_gates: Vec::new(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            wait_policy: BreakerWaitPolicy::default(),
        }
    }

    pub fn rate_gate(mut self, config: RateGateConfig) -> Self {
        self.gate = config;
        self
    }

    /// Gives `endpoint` its own gate instead of the shared one.
    pub fn endpoint_rate_gate(mut self, endpoint: EndpointId, config: RateGateConfig) -> Self {
        self.endpoint_gates.push((endpoint, config));
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn breaker_wait_policy(mut self, policy: BreakerWaitPolicy) -> Self {
        self.wait_policy = policy;
        self
    }

    /// Consults `cache` before sending and stores successful responses.
    pub fn response_cache(mut self, cache: SharedCache<T>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Default [`CacheMode`] for [`Dispatcher::execute`].
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn build(self) -> Result<Dispatcher<T>, ValidationError> {
        self.retry.validate()?;
        if self.breaker.failure_threshold == 0 {
            return Err(ValidationError::NonPositive {
                field: "failure_threshold",
            });
        }
        if self.breaker.successes_to_close == 0 {
            return Err(ValidationError::NonPositive {
                field: "successes_to_close",
            });
        }

        let mut endpoint_gates = HashMap::with_capacity(self.endpoint_gates.len());
        for (endpoint, config) in self.endpoint_gates {
            endpoint_gates.insert(endpoint, Arc::new(RateGate::new(config)?));
        }

        Ok(Dispatcher {
            transport: self.transport,
            cache: self.cache,
            cache_mode: self.cache_mode,
            gate: Arc::new(RateGate::new(self.gate)?),
            endpoint_gates,
            breaker_config: self.breaker,
            breakers: RwLock::new(BTreeMap::new()),
            retry: self.retry,
            wait_policy: self.wait_policy,
        })
    }
}
