use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::transport::{
    classify_transport_error, Classification, Failure, FailureClassifier, FailureKind, Transport,
    TransportError, TransportErrorKind,
};
use crate::EndpointId;

pub const DEFAULT_BASE_URL: &str = "https://api.tradingdata.example/v2";
pub const API_KEY_HEADER: &str = "x-api-key";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Authentication strategy applied to outgoing HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiAuth {
    None,
    ApiKey(String),
    Header { name: String, value: String },
}

impl ApiAuth {
    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            Self::None => {}
            Self::ApiKey(key) => {
                headers.insert(String::from(API_KEY_HEADER), key.clone());
            }
            Self::Header { name, value } => {
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
    }
}

/// Query-string request for one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl Default for ApiRequest {
    fn default() -> Self {
        Self {
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ApiRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// `a=1&b=2` with percent-encoded values, keys in sorted order.
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(name, value)| format!("{name}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// HTTP response envelope returned by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, seconds form only.
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl ApiResponse {
    pub fn ok_json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Default no-op transport for deterministic offline tests.
#[derive(Debug, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    type Request = ApiRequest;
    type Response = ApiResponse;

    fn send<'a>(
        &'a self,
        _endpoint: &'a EndpointId,
        _request: ApiRequest,
        _cancel: &'a tokio_util::sync::CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move { Ok(ApiResponse::ok_json("[]")) })
    }
}

/// Production transport using reqwest for real API calls.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Arc<reqwest::Client>,
    base_url: String,
    auth: ApiAuth,
}

impl ReqwestTransport {
    pub fn new(auth: ApiAuth) -> Self {
        Self::with_client(
            reqwest::Client::builder()
                .user_agent(concat!("ferrogate/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            auth,
        )
    }

    pub fn with_client(client: reqwest::Client, auth: ApiAuth) -> Self {
        Self {
            client: Arc::new(client),
            base_url: String::from(DEFAULT_BASE_URL),
            auth,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    pub fn url_for(&self, endpoint: &EndpointId, request: &ApiRequest) -> String {
        let query = request.query_string();
        if query.is_empty() {
            format!("{}/{endpoint}", self.base_url)
        } else {
            format!("{}/{endpoint}?{query}", self.base_url)
        }
    }
}

impl Transport for ReqwestTransport {
    type Request = ApiRequest;
    type Response = ApiResponse;

    fn send<'a>(
        &'a self,
        endpoint: &'a EndpointId,
        request: ApiRequest,
        cancel: &'a tokio_util::sync::CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let mut headers = request.headers.clone();
            headers.insert(String::from("accept"), String::from("application/json"));
            self.auth.apply(&mut headers);

            let mut builder = self
                .client
                .get(self.url_for(endpoint, &request))
                .timeout(request.timeout);
            for (name, value) in &headers {
                builder = builder.header(name, value);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TransportError::new(TransportErrorKind::Request, "cancelled"));
                }
                sent = builder.send() => sent.map_err(map_reqwest_error)?,
            };

            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.map_err(|error| {
                TransportError::new(
                    TransportErrorKind::Body,
                    format!("failed to read response body: {error}"),
                )
            })?;

            Ok(ApiResponse {
                status,
                retry_after,
                body,
            })
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout(format!("request timeout: {error}"))
    } else if error.is_connect() {
        TransportError::connect(format!("connection failed: {error}"))
    } else {
        TransportError::new(TransportErrorKind::Request, format!("request failed: {error}"))
    }
}

/// Seconds form of `Retry-After`; HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Status-code classifier for [`ApiResponse`] outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusClassifier;

impl FailureClassifier<ApiResponse> for StatusClassifier {
    fn classify(&self, outcome: Result<ApiResponse, TransportError>) -> Classification<ApiResponse> {
        let response = match outcome {
            Ok(response) => response,
            Err(error) => return classify_transport_error(error),
        };
        if response.is_success() {
            return Classification::Success(response);
        }

        let status = response.status;
        let failure = |kind: FailureKind| {
            Failure::new(kind, summarize_body(&response.body)).with_status(status)
        };
        match status {
            401 => Classification::Fatal(failure(FailureKind::Authentication)),
            403 => Classification::Fatal(failure(FailureKind::Authorization)),
            404 => Classification::Fatal(failure(FailureKind::NotFound)),
            400 | 422 => Classification::Fatal(failure(FailureKind::Validation)),
            408 => Classification::Retryable(failure(FailureKind::Timeout)),
            429 => {
                let limited = failure(FailureKind::RateLimited);
                Classification::Retryable(match response.retry_after {
                    Some(retry_after) => limited.with_retry_after(retry_after),
                    None => limited,
                })
            }
            500..=599 => Classification::Retryable(failure(FailureKind::Server)),
            _ => Classification::Fatal(failure(FailureKind::Client)),
        }
    }
}

fn summarize_body(body: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::from("empty response body");
    }
    match trimmed.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16) -> Classification<ApiResponse> {
        StatusClassifier.classify(Ok(ApiResponse::with_status(status, "{\"error\":\"x\"}")))
    }

    #[test]
    fn api_key_auth_populates_header() {
        let mut headers = BTreeMap::new();
        ApiAuth::ApiKey(String::from("demo")).apply(&mut headers);

        assert_eq!(headers.get("x-api-key").map(String::as_str), Some("demo"));
    }

    #[test]
    fn query_string_is_sorted_and_encoded() {
        let request = ApiRequest::new()
            .with_param("sequenceItemId", "1,2,3")
            .with_param("marketId", 10);

        assert_eq!(request.query_string(), "marketId=10&sequenceItemId=1%2C2%2C3");
    }

    #[test]
    fn url_joins_base_endpoint_and_query() {
        let transport = ReqwestTransport::new(ApiAuth::None).with_base_url("https://host.test/v2/");
        let endpoint = EndpointId::parse("trades/ohlcv").expect("valid endpoint");
        let request = ApiRequest::new().with_param("marketId", 1);

        assert_eq!(
            transport.url_for(&endpoint, &request),
            "https://host.test/v2/trades/ohlcv?marketId=1"
        );
    }

    #[test]
    fn auth_and_validation_statuses_are_fatal() {
        for (status, kind) in [
            (400, FailureKind::Validation),
            (401, FailureKind::Authentication),
            (403, FailureKind::Authorization),
            (404, FailureKind::NotFound),
            (409, FailureKind::Client),
            (422, FailureKind::Validation),
        ] {
            match classify(status) {
                Classification::Fatal(failure) => assert_eq!(failure.kind(), kind, "{status}"),
                other => panic!("{status} should be fatal, got {other:?}"),
            }
        }
    }

    #[test]
    fn server_and_throttle_statuses_are_retryable() {
        for status in [408, 429, 500, 502, 503, 504, 599] {
            assert!(
                matches!(classify(status), Classification::Retryable(_)),
                "{status} should be retryable"
            );
        }
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let response = ApiResponse {
            status: 429,
            retry_after: parse_retry_after(" 7 "),
            body: String::new(),
        };

        match StatusClassifier.classify(Ok(response)) {
            Classification::Retryable(failure) => {
                assert!(failure.is_rate_limited());
                assert_eq!(failure.retry_after(), Some(Duration::from_secs(7)));
            }
            other => panic!("expected retryable, got {other:?}"),
        }
    }

    #[test]
    fn http_date_retry_after_is_ignored() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn noop_transport_returns_empty_json_array() {
        let endpoint = EndpointId::parse("trades").expect("valid endpoint");
        let cancel = tokio_util::sync::CancellationToken::new();

        let response = NoopTransport
            .send(&endpoint, ApiRequest::new(), &cancel)
            .await
            .expect("noop succeeds");

        assert!(response.is_success());
        assert_eq!(response.json::<Vec<u32>>().expect("json"), Vec::<u32>::new());
    }
}
