use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::EndpointId;

/// Transport-level failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Body,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Request => "request",
            Self::Body => "body",
        }
    }
}

/// The request never produced a complete response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} error: {message}", kind.as_str())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }
}

/// Sends one request to one endpoint. Implementations perform the I/O; the
/// dispatch layer never does.
pub trait Transport: Send + Sync {
    /// Request payload; cloned for each attempt so retries reuse identical parameters.
    type Request: Clone + Send + Sync;
    type Response: Send;

    fn send<'a>(
        &'a self,
        endpoint: &'a EndpointId,
        request: Self::Request,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Response, TransportError>> + Send + 'a>>;
}

/// Failure taxonomy shared by classifiers and dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Timeout,
    Server,
    RateLimited,
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Client,
    Internal,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::RateLimited => "rate_limited",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Client => "client",
            Self::Internal => "internal",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure descriptor attached to a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    kind: FailureKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", with = "millis")]
    retry_after: Option<Duration>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self.kind, FailureKind::RateLimited)
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Failure {}

impl From<TransportError> for Failure {
    fn from(error: TransportError) -> Self {
        let kind = match error.kind {
            TransportErrorKind::Timeout => FailureKind::Timeout,
            TransportErrorKind::Connect | TransportErrorKind::Request | TransportErrorKind::Body => {
                FailureKind::Network
            }
        };
        Self::new(kind, error.to_string())
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }
}

/// Outcome of one transport attempt after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification<T> {
    Success(T),
    Retryable(Failure),
    Fatal(Failure),
}

impl<T> Classification<T> {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub const fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Success(_) => None,
            Self::Retryable(failure) | Self::Fatal(failure) => Some(failure),
        }
    }
}

/// Maps a raw transport outcome to success, retryable or fatal. Supplied per
/// endpoint by the API-specific layer.
pub trait FailureClassifier<R>: Send + Sync {
    fn classify(&self, outcome: Result<R, TransportError>) -> Classification<R>;
}

impl<R, F> FailureClassifier<R> for F
where
    F: Fn(Result<R, TransportError>) -> Classification<R> + Send + Sync,
{
    fn classify(&self, outcome: Result<R, TransportError>) -> Classification<R> {
        self(outcome)
    }
}

/// Transport errors are always worth another attempt.
pub fn classify_transport_error<R>(error: TransportError) -> Classification<R> {
    Classification::Retryable(Failure::from(error))
}
