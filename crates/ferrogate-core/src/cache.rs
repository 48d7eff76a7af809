//! Response caching hook consulted by the dispatcher.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::http_client::{ApiRequest, ApiResponse};
use crate::EndpointId;

/// How a call interacts with the dispatcher's response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve a fresh cached response if present; otherwise call the upstream
    /// and store the successful response.
    #[default]
    Use,
    /// Always call the upstream, then store the new response.
    Refresh,
    /// Neither read from nor write to the cache.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        matches!(self, Self::Use | Self::Refresh)
    }
}

/// Storage for successful responses. Only successes are ever stored; a hit
/// skips the breaker, the rate gate and the transport.
pub trait ResponseCache<Req, Resp>: Send + Sync {
    fn lookup(&self, endpoint: &EndpointId, request: &Req) -> Option<Resp>;

    fn store(&self, endpoint: &EndpointId, request: &Req, response: &Resp);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: ApiResponse,
    expires_at: Instant,
}

/// In-memory TTL cache for [`ApiResponse`]s, keyed by endpoint plus encoded
/// query string. Endpoints without a TTL are not cached unless a default
/// TTL is set, which suits reference data that changes rarely.
#[derive(Debug, Default)]
pub struct TtlCache {
    default_ttl: Option<Duration>,
    endpoint_ttls: HashMap<EndpointId, Duration>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl TtlCache {
    /// Caches every endpoint for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            default_ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Caches nothing until endpoints are opted in with
    /// [`with_endpoint_ttl`](Self::with_endpoint_ttl).
    pub fn per_endpoint() -> Self {
        Self::default()
    }

    pub fn with_endpoint_ttl(mut self, endpoint: EndpointId, ttl: Duration) -> Self {
        self.endpoint_ttls.insert(endpoint, ttl);
        self
    }

    pub fn ttl_for(&self, endpoint: &EndpointId) -> Option<Duration> {
        self.endpoint_ttls
            .get(endpoint)
            .copied()
            .or(self.default_ttl)
            .filter(|ttl| !ttl.is_zero())
    }

    fn key(endpoint: &EndpointId, request: &ApiRequest) -> String {
        format!("{endpoint}?{}", request.query_string())
    }

    /// Drops entries that have expired by `now`.
    pub fn clear_expired(&self, now: Instant) {
        self.entries.lock().retain(|_, entry| entry.expires_at > now);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache<ApiRequest, ApiResponse> for TtlCache {
    fn lookup(&self, endpoint: &EndpointId, request: &ApiRequest) -> Option<ApiResponse> {
        let entries = self.entries.lock();
        entries
            .get(&Self::key(endpoint, request))
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.response.clone())
    }

    fn store(&self, endpoint: &EndpointId, request: &ApiRequest, response: &ApiResponse) {
        let Some(ttl) = self.ttl_for(endpoint) else {
            return;
        };
        self.entries.lock().insert(
            Self::key(endpoint, request),
            CacheEntry {
                response: response.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> EndpointId {
        EndpointId::parse(name).expect("valid endpoint")
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let markets = endpoint("markets");
        let request = ApiRequest::new().with_param("marketId", 7);

        assert!(cache.lookup(&markets, &request).is_none());
        cache.store(&markets, &request, &ApiResponse::ok_json("[1]"));
        assert_eq!(
            cache.lookup(&markets, &request),
            Some(ApiResponse::ok_json("[1]"))
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.lookup(&markets, &request).is_none());
        cache.clear_expired(Instant::now());
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_include_the_query_string() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let markets = endpoint("markets");
        let seven = ApiRequest::new().with_param("marketId", 7);
        let eight = ApiRequest::new().with_param("marketId", 8);

        cache.store(&markets, &seven, &ApiResponse::ok_json("[7]"));

        assert!(cache.lookup(&markets, &eight).is_none());
        assert!(cache.lookup(&endpoint("instruments"), &seven).is_none());
    }

    #[test]
    fn per_endpoint_cache_only_stores_opted_in_endpoints() {
        let cache = TtlCache::per_endpoint()
            .with_endpoint_ttl(endpoint("markets"), Duration::from_secs(3600));
        let request = ApiRequest::new();

        cache.store(&endpoint("trades"), &request, &ApiResponse::ok_json("[]"));
        cache.store(&endpoint("markets"), &request, &ApiResponse::ok_json("[]"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ttl_for(&endpoint("trades")), None);
    }

    #[test]
    fn modes_decide_reads_and_writes() {
        assert!(CacheMode::Use.reads() && CacheMode::Use.writes());
        assert!(!CacheMode::Refresh.reads() && CacheMode::Refresh.writes());
        assert!(!CacheMode::Bypass.reads() && !CacheMode::Bypass.writes());
        assert_eq!(CacheMode::default(), CacheMode::Use);
    }
}
