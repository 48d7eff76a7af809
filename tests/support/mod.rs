//! Shared fakes for the behaviour tests.
//!
//! Each test binary compiles this module on its own, so helpers only one
//! suite needs carry `#[allow(dead_code)]`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use ferrogate_core::{
    ApiRequest, ApiResponse, ContractSpec, EndpointId, MarketId, RateGateConfig, RetryPolicy,
    SequenceId, SequenceItemId, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type Reply = Result<ApiResponse, TransportError>;

type Handler = Box<dyn Fn(&EndpointId, &ApiRequest, u32) -> Reply + Send + Sync>;

/// In-memory transport answering from a handler, optionally after a delay.
pub struct FakeTransport {
    handler: Handler,
    delay: Duration,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sent_at: Mutex<Vec<Instant>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&EndpointId, &ApiRequest, u32) -> Reply + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            sent_at: Mutex::new(Vec::new()),
        }
    }

    /// Replies in order, then `200 []` once the script runs out.
    #[allow(dead_code)]
    pub fn scripted(replies: Vec<Reply>) -> Self {
        let replies = Mutex::new(VecDeque::from(replies));
        Self::new(move |_, _, _| {
            replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ApiResponse::ok_json("[]")))
        })
    }

    pub fn always(status: u16) -> Self {
        Self::new(move |_, _, _| Ok(ApiResponse::with_status(status, "{\"error\":\"scripted\"}")))
    }

    pub fn ok() -> Self {
        Self::always(200)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn call_times(&self) -> Vec<Instant> {
        self.sent_at.lock().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for FakeTransport {
    type Request = ApiRequest;
    type Response = ApiResponse;

    fn send<'a>(
        &'a self,
        endpoint: &'a EndpointId,
        request: ApiRequest,
        _cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Reply> + Send + 'a>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.sent_at.lock().push(Instant::now());

            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.handler)(endpoint, &request, call)
        })
    }
}

pub fn endpoint(name: &str) -> EndpointId {
    EndpointId::parse(name).expect("valid endpoint")
}

#[allow(dead_code)]
pub fn spec(market: u64, sequence: u64, item: u64) -> ContractSpec {
    ContractSpec::single_period(MarketId(market), SequenceId(sequence), SequenceItemId(item))
}

/// Default limits without burst spacing.
pub fn relaxed_gate() -> RateGateConfig {
    RateGateConfig {
        min_spacing: Duration::ZERO,
        ..RateGateConfig::default()
    }
}

/// Deterministic backoff: 1s, 2s, 4s, ...
pub fn steady_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        jitter: false,
    }
}
