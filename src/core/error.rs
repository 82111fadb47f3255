use bytes::Bytes;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable, wire-visible error tags. The string form of each code is part of
/// the crate contract and must not change between releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    CommandNotFound,
    FailedToBuildRequest,
    FailedToBuildResponseUsingResponseBuilder,
    ServerResponseWithError,
    RequestTimeoutOnClient,
    RequestFailedOnClient,
    CircuitOpen,
    BulkheadRejected,
    ResilienceTimeout,
    ResilienceUnknown,
    Unknown,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommandNotFound => "command_not_found",
            Self::FailedToBuildRequest => "failed_to_build_request",
            Self::FailedToBuildResponseUsingResponseBuilder => {
                "failed_to_build_response_using_response_builder"
            }
            Self::ServerResponseWithError => "server_response_with_error",
            Self::RequestTimeoutOnClient => "request_timeout_on_client",
            Self::RequestFailedOnClient => "request_failed_on_client",
            Self::CircuitOpen => "hystrix_circuit_open",
            Self::BulkheadRejected => "hystrix_rejected",
            Self::ResilienceTimeout => "hystrix_timeout",
            Self::ResilienceUnknown => "hystrix_unknown_error",
            Self::Unknown => "unknown_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Sentinel placed in the cause chain when a call names an API that was never
/// registered, so callers can match it without string comparison.
#[derive(Clone, Copy, Debug, Error)]
#[error("api not found")]
pub struct CommandNotRegistered;

/// The single failure value every call can surface. Carries the HTTP status
/// (real, or synthetic for client-side failures), a stable [`ErrorCode`], a
/// human message, the raw response body when one was received, and the cause.
#[derive(Debug, Error)]
#[error("status={status}, code={}, message={message}", .code.as_str())]
pub struct HttpError {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
    pub body: Option<Bytes>,
    #[source]
    pub source: Option<BoxError>,
}

impl HttpError {
    pub fn new(code: ErrorCode, status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            body: None,
            source: None,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub(crate) fn command_not_found(api: &str) -> Self {
        Self::new(
            ErrorCode::CommandNotFound,
            400,
            format!("command to execute not found: name={api}"),
        )
        .with_source(CommandNotRegistered)
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn is_2xx(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn is_3xx(&self) -> bool {
        (300..=399).contains(&self.status)
    }

    pub fn is_4xx(&self) -> bool {
        (400..=499).contains(&self.status)
    }

    pub fn is_5xx(&self) -> bool {
        (500..=599).contains(&self.status)
    }

    pub fn is_bad_request(&self) -> bool {
        self.status == 400
    }

    /// True for both 401 and 403, mirroring the common "caller is not allowed"
    /// check most call sites actually want.
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn is_method_not_allowed(&self) -> bool {
        self.status == 405
    }

    pub fn is_not_acceptable(&self) -> bool {
        self.status == 406
    }

    pub fn is_request_timeout(&self) -> bool {
        self.status == 408
    }

    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    pub fn is_internal_server_error(&self) -> bool {
        self.status == 500
    }

    pub fn is_bad_gateway(&self) -> bool {
        self.status == 502
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.status == 503
    }

    pub fn is_gateway_timeout(&self) -> bool {
        self.status == 504
    }

    /// Walks the cause chain looking for the unregistered-API sentinel.
    pub fn is_command_not_registered(&self) -> bool {
        find_in_chain::<CommandNotRegistered>(self).is_some()
    }
}

/// Walks an error's `source()` chain (starting at the error itself) and
/// returns the first cause of type `T`.
pub fn find_in_chain<'a, T>(error: &'a (dyn std::error::Error + 'static)) -> Option<&'a T>
where
    T: std::error::Error + 'static,
{
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(candidate) = current {
        if let Some(found) = candidate.downcast_ref::<T>() {
            return Some(found);
        }
        current = candidate.source();
    }
    None
}
