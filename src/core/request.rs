use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::error::{ErrorCode, HttpError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Call-scope key that overrides the signing timestamp, for deterministic
/// signature testing.
pub const TESTING_TIMESTAMP_KEY: &str = "__testing_ts__";

/// Header values equal to this sentinel are replaced with a fresh UUID v4 on
/// every request.
pub const UNIQUE_UUID_SENTINEL: &str = "__UNIQUE_UUID__";

pub type MultiValueMap = BTreeMap<String, Vec<String>>;

/// Per-call ambient state: MDC values propagated as headers when a server
/// lists them, request-scoped headers applied after all configured ones, and
/// test-only overrides such as [`TESTING_TIMESTAMP_KEY`].
#[derive(Clone, Debug, Default)]
pub struct CallScope {
    values: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
}

impl CallScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

/// Produces the raw bytes for a request body that is neither plain bytes nor
/// a JSON-serialisable value.
pub trait BodyProvider: Send + Sync {
    fn body(&self) -> Result<Bytes, BoxError>;
}

/// The request body in one of its accepted shapes.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    None,
    Bytes(Bytes),
    Json(serde_json::Value),
    Provider(Arc<dyn BodyProvider>),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => formatter.write_str("Body::None"),
            Self::Bytes(bytes) => write!(formatter, "Body::Bytes({} bytes)", bytes.len()),
            Self::Json(_) => formatter.write_str("Body::Json"),
            Self::Provider(_) => formatter.write_str("Body::Provider"),
        }
    }
}

/// Turns raw response bytes into a caller-defined value.
pub trait ResponseBuilder: Send + Sync {
    fn build(&self, data: &[u8]) -> Result<Box<dyn Any + Send + Sync>, BoxError>;
}

/// [`ResponseBuilder`] that deserialises the body as JSON into `T`.
pub struct JsonResponseBuilder<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> JsonResponseBuilder<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for JsonResponseBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseBuilder for JsonResponseBuilder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn build(&self, data: &[u8]) -> Result<Box<dyn Any + Send + Sync>, BoxError> {
        let parsed: T = serde_json::from_slice(data)?;
        Ok(Box::new(parsed))
    }
}

/// A call against one named API: the target name plus per-call headers, path
/// and query parameters, body, and an optional response builder.
pub struct ApiRequest {
    pub(crate) api: String,
    pub(crate) headers: MultiValueMap,
    pub(crate) path_params: BTreeMap<String, String>,
    pub(crate) query_params: MultiValueMap,
    pub(crate) body: Body,
    pub(crate) response_builder: Option<Arc<dyn ResponseBuilder>>,
}

impl std::fmt::Debug for ApiRequest {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiRequest")
            .field("api", &self.api)
            .field("headers", &self.headers)
            .field("path_params", &self.path_params)
            .field("query_params", &self.query_params)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl ApiRequest {
    pub fn builder(api: impl Into<String>) -> ApiRequestBuilder {
        ApiRequestBuilder {
            request: Self {
                api: api.into(),
                headers: MultiValueMap::new(),
                path_params: BTreeMap::new(),
                query_params: MultiValueMap::new(),
                body: Body::None,
                response_builder: None,
            },
        }
    }

    pub fn api(&self) -> &str {
        &self.api
    }
}

pub struct ApiRequestBuilder {
    request: ApiRequest,
}

impl ApiRequestBuilder {
    pub fn with_header(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.request
            .headers
            .entry(name.into())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_content_type_json(self) -> Self {
        self.with_header("content-type", "application/json")
    }

    pub fn with_path_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.request
            .path_params
            .insert(name.into(), value.to_string());
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.request
            .query_params
            .entry(name.into())
            .or_default()
            .push(value.to_string());
        self
    }

    /// Raw bytes, passed through to the wire unchanged.
    pub fn with_body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = Body::Bytes(body.into());
        self
    }

    /// A literal string body, sent as its UTF-8 bytes.
    pub fn with_body_string(mut self, body: impl Into<String>) -> Self {
        self.request.body = Body::Bytes(Bytes::from(body.into()));
        self
    }

    /// A typed body serialised to JSON at request-build time.
    pub fn with_json_body<T: Serialize>(mut self, body: &T) -> Result<Self, HttpError> {
        let value = serde_json::to_value(body).map_err(|serialize_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                "failed to serialize request body",
            )
            .with_source(serialize_error)
        })?;
        self.request.body = Body::Json(value);
        Ok(self)
    }

    pub fn with_body_provider(mut self, provider: Arc<dyn BodyProvider>) -> Self {
        self.request.body = Body::Provider(provider);
        self
    }

    pub fn with_response_builder(mut self, builder: Arc<dyn ResponseBuilder>) -> Self {
        self.request.response_builder = Some(builder);
        self
    }

    /// Parse the response body as JSON into `T` on acceptable responses.
    pub fn with_json_response<T>(self) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.with_response_builder(Arc::new(JsonResponseBuilder::<T>::new()))
    }

    pub fn build(self) -> ApiRequest {
        self.request
    }
}

/// The outcome of one call: raw body bytes, the optional builder-produced
/// value, and the HTTP status code.
pub struct ApiResponse {
    pub(crate) body: Bytes,
    pub(crate) parsed: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) status: u16,
}

impl std::fmt::Debug for ApiResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiResponse")
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .field("has_parsed", &self.parsed.is_some())
            .finish()
    }
}

impl ApiResponse {
    pub(crate) fn new(status: u16, body: Bytes) -> Self {
        Self {
            body,
            parsed: None,
            status,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The builder-produced value, if a response builder ran and produced `T`.
    pub fn parsed_as<T: 'static>(&self) -> Option<&T> {
        self.parsed.as_deref().and_then(|value| value.downcast_ref())
    }

    /// Decode the raw body as JSON, independent of any response builder.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|decode_error| {
            HttpError::new(
                ErrorCode::FailedToBuildResponseUsingResponseBuilder,
                self.status,
                "failed to decode response body as json",
            )
            .with_body(self.body.clone())
            .with_source(decode_error)
        })
    }

    /// The body as a JSON object map, or an empty map when the body is
    /// missing or not an object.
    pub fn json_map_or_empty(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::from_slice::<serde_json::Value>(&self.body) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde::Deserialize;

    use super::{ApiRequest, ApiResponse, Body, CallScope};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Status {
        status: String,
    }

    #[test]
    fn builder_collects_multi_valued_headers_and_params() {
        let request = ApiRequest::builder("getPosts")
            .with_header("X-Header-1", 101)
            .with_header("X-Header-1", 102)
            .with_path_param("id", 7)
            .with_query_param("page", 2)
            .build();

        assert_eq!(request.api(), "getPosts");
        assert_eq!(request.headers["X-Header-1"], vec!["101", "102"]);
        assert_eq!(request.path_params["id"], "7");
        assert_eq!(request.query_params["page"], vec!["2"]);
    }

    #[test]
    fn string_body_becomes_raw_bytes() {
        let request = ApiRequest::builder("x")
            .with_body_string(r#"{"status": "ok"}"#)
            .build();
        match &request.body {
            Body::Bytes(bytes) => assert_eq!(bytes.as_ref(), br#"{"status": "ok"}"#),
            other => panic!("unexpected body shape: {other:?}"),
        }
    }

    #[test]
    fn json_body_serialises_typed_values() {
        let request = ApiRequest::builder("x")
            .with_json_body(&serde_json::json!({"status": "ok"}))
            .expect("json body should serialise")
            .build();
        match &request.body {
            Body::Json(value) => assert_eq!(value["status"], "ok"),
            other => panic!("unexpected body shape: {other:?}"),
        }
    }

    #[test]
    fn response_json_accessor_preserves_status_on_error() {
        let response = ApiResponse::new(200, Bytes::from_static(b"not json"));
        let error = response.json::<Status>().expect_err("body is not json");
        assert_eq!(error.status, 200);
        assert_eq!(error.body_bytes().map(|bytes| bytes.as_ref()), Some(&b"not json"[..]));
    }

    #[test]
    fn json_map_or_empty_tolerates_garbage() {
        let response = ApiResponse::new(200, Bytes::from_static(b"[1,2,3]"));
        assert!(response.json_map_or_empty().is_empty());

        let response = ApiResponse::new(200, Bytes::from_static(br#"{"status":"ok"}"#));
        assert_eq!(response.json_map_or_empty()["status"], "ok");
    }

    #[test]
    fn call_scope_carries_values_and_headers() {
        let scope = CallScope::new()
            .with_value("trace-id", "abc-123")
            .with_header("x-extra", "1");
        assert_eq!(scope.value("trace-id"), Some("abc-123"));
        assert_eq!(scope.value("missing"), None);
        assert_eq!(scope.headers()["x-extra"], "1");
    }
}
