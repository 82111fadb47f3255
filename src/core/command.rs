use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Uri};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::core::config::{Api, Server};
use crate::core::error::{ErrorCode, HttpError};
use crate::core::interceptor::{RequestInterceptor, build_interceptor, select_config};
use crate::core::metrics::HTTP_CALL_COUNTER;
use crate::core::registry::Options;
use crate::core::request::{
    ApiRequest, ApiResponse, Body, CallScope, UNIQUE_UUID_SENTINEL,
};
use crate::core::tracking::CallTimeline;
use crate::core::util::{append_query_pairs, substitute_path_params};
use crate::transport::{HttpTransport, TransportFailure, WireResponse};

/// An executable bound to one configured API. Implementations are stateless
/// with respect to individual requests and safe to share across tasks.
#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
        deadline: Instant,
    ) -> Result<ApiResponse, HttpError>;
}

/// Builds one HTTP request per attempt, sends it through the shared
/// per-server transport, retries while the outcome is retryable, and
/// classifies the final outcome into a response or a typed error.
pub(crate) struct HttpCommand {
    server: Server,
    api: Api,
    transport: HttpTransport,
    interceptor: Option<Box<dyn RequestInterceptor>>,
    options: Arc<Options>,
}

impl HttpCommand {
    pub(crate) fn new(
        server: Server,
        api: Api,
        options: Arc<Options>,
    ) -> Result<Self, crate::core::config::ConfigError> {
        let transport = HttpTransport::for_server(&server)?;
        let interceptor = build_interceptor(select_config(
            server.interceptor_config.as_ref(),
            api.interceptor_config.as_ref(),
        ));
        Ok(Self {
            server,
            api,
            transport,
            interceptor,
            options,
        })
    }

    fn timeline(&self) -> CallTimeline {
        if self.api.enable_http_connection_tracing || self.server.enable_http_connection_tracing {
            CallTimeline::enabled()
        } else {
            CallTimeline::disabled()
        }
    }

    fn request_url(&self, request: &ApiRequest) -> Result<Uri, HttpError> {
        let path = substitute_path_params(&self.api.path, &request.path_params);
        let path = append_query_pairs(&path, &request.query_params);
        let full_url = format!("{}{path}", self.server.base_url());
        full_url.parse::<Uri>().map_err(|parse_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                format!("failed to build request url: {full_url}"),
            )
            .with_source(parse_error)
        })
    }

    fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), HttpError> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|name_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                format!("invalid header name: {name}"),
            )
            .with_source(name_error)
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|value_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                format!("invalid header value for {name}"),
            )
            .with_source(value_error)
        })?;
        headers.insert(header_name, header_value);
        Ok(())
    }

    fn append_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), HttpError> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|name_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                format!("invalid header name: {name}"),
            )
            .with_source(name_error)
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|value_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                format!("invalid header value for {name}"),
            )
            .with_source(value_error)
        })?;
        headers.append(header_name, header_value);
        Ok(())
    }

    fn configured_header_value(value: &str) -> String {
        if value == UNIQUE_UUID_SENTINEL {
            Uuid::new_v4().to_string()
        } else {
            value.to_owned()
        }
    }

    fn encode_body(&self, request: &ApiRequest) -> Result<Bytes, HttpError> {
        match &request.body {
            Body::None => Ok(Bytes::new()),
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::Provider(provider) => provider.body().map_err(|provider_error| {
                HttpError::new(
                    ErrorCode::FailedToBuildRequest,
                    500,
                    "failed to read body using body provider",
                )
                .with_source(provider_error)
            }),
            Body::Json(value) => serde_json::to_vec(value).map(Bytes::from).map_err(
                |serialize_error| {
                    HttpError::new(
                        ErrorCode::FailedToBuildRequest,
                        500,
                        "failed to serialize request body",
                    )
                    .with_source(serialize_error)
                },
            ),
        }
    }

    /// Assembles headers and body for one attempt. Later sources overwrite
    /// earlier ones: trace-context injection, MDC propagation, server
    /// headers, API headers, per-call headers, request-scoped headers, then
    /// the content-type default. The interceptor runs last, over the fully
    /// assembled request.
    fn build_attempt(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
    ) -> Result<(HeaderMap, Bytes), HttpError> {
        let mut headers = HeaderMap::new();

        if let Some(trace_injector) = &self.options.trace_injector {
            trace_injector.inject(scope, &mut headers);
        }

        for key in self.server.mdc_keys() {
            if let Some(value) = scope.value(&key) {
                Self::insert_header(&mut headers, &key, value)?;
            }
        }

        for (name, value) in &self.server.headers {
            Self::insert_header(&mut headers, name, &Self::configured_header_value(value))?;
        }

        for (name, value) in &self.api.headers {
            Self::insert_header(&mut headers, name, &Self::configured_header_value(value))?;
        }

        for (name, values) in &request.headers {
            let mut first = true;
            for value in values {
                if first {
                    Self::insert_header(&mut headers, name, value)?;
                    first = false;
                } else {
                    Self::append_header(&mut headers, name, value)?;
                }
            }
        }

        for (name, value) in scope.headers() {
            Self::insert_header(&mut headers, name, value)?;
        }

        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let body = self.encode_body(request)?;

        if let Some(interceptor) = &self.interceptor {
            interceptor.intercept(scope, &mut headers, &body)?;
        }

        Ok((headers, body))
    }

    fn classify_wire_outcome(
        &self,
        request: &ApiRequest,
        wire: WireResponse,
    ) -> Result<ApiResponse, HttpError> {
        let status = wire.status;
        if !self.api.is_code_acceptable(status) {
            return Err(HttpError::new(
                ErrorCode::ServerResponseWithError,
                status,
                "got response from server with error",
            )
            .with_body(wire.body));
        }

        let mut response = ApiResponse::new(status, wire.body);
        let body_is_content = status != 204 && !response.body.is_empty();
        if body_is_content {
            if let Some(builder) = &request.response_builder {
                match builder.build(&response.body) {
                    Ok(parsed) => response.parsed = Some(parsed),
                    Err(builder_error) => {
                        return Err(HttpError::new(
                            ErrorCode::FailedToBuildResponseUsingResponseBuilder,
                            status,
                            "failed to create response using response builder",
                        )
                        .with_body(response.body)
                        .with_source(builder_error));
                    }
                }
            }
        }
        Ok(response)
    }

    fn classify_transport_failure(&self, failure: TransportFailure) -> HttpError {
        match failure {
            TransportFailure::Timeout { .. } => HttpError::new(
                ErrorCode::RequestTimeoutOnClient,
                408,
                "request timeout on client",
            )
            .with_source(failure),
            TransportFailure::Wire { .. } => HttpError::new(
                ErrorCode::RequestFailedOnClient,
                400,
                "request failed on client",
            )
            .with_source(failure),
        }
    }

    fn log_request_response(&self, url: &Uri, request: &ApiRequest, outcome: &Result<ApiResponse, HttpError>) {
        if !self.api.enable_request_response_logging && !self.options.log_request_response_bodies {
            return;
        }
        // A panicking log formatter must never change the call outcome.
        let _ = catch_unwind(AssertUnwindSafe(|| match outcome {
            Ok(response) => debug!(
                url = %url,
                request = ?request,
                status = response.status_code(),
                response = %response.text_lossy(),
                "request/response of http call"
            ),
            Err(error) => debug!(
                url = %url,
                request = ?request,
                error = %error,
                "request/response of http call"
            ),
        }));
    }

    fn publish_timeline(&self, request: &ApiRequest, url: &Uri, timeline: &CallTimeline) {
        if !timeline.is_enabled() {
            return;
        }
        let Some(sink) = &self.options.timeline_sink else {
            return;
        };
        let final_url = url.to_string();
        if catch_unwind(AssertUnwindSafe(|| {
            sink.publish(request, &final_url, timeline);
        }))
        .is_err()
        {
            warn!(api = %self.api.name, "timeline sink panicked while publishing");
        }
    }

    fn emit_call_metric(&self, outcome: &Result<ApiResponse, HttpError>) {
        let Some(metrics) = &self.options.metrics_sink else {
            return;
        };
        match outcome {
            Ok(response) => {
                let status = response.status_code().to_string();
                metrics.increment(
                    HTTP_CALL_COUNTER,
                    &[
                        ("server", self.server.name.as_str()),
                        ("api", self.api.name.as_str()),
                        ("status", status.as_str()),
                    ],
                );
            }
            Err(error) => {
                let status = error.status.to_string();
                metrics.increment(
                    HTTP_CALL_COUNTER,
                    &[
                        ("server", self.server.name.as_str()),
                        ("api", self.api.name.as_str()),
                        ("status", status.as_str()),
                        ("error", error.code.as_str()),
                    ],
                );
            }
        }
    }

    async fn run_attempts(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
        deadline: Instant,
        timeline: &CallTimeline,
        url: &Uri,
    ) -> Result<ApiResponse, HttpError> {
        let total_attempts = u64::from(self.api.retry_count) + 1;
        let retry_wait = self.api.initial_retry_wait();

        let mut attempt = 0_u64;
        loop {
            attempt += 1;

            // The interceptor reruns here so each attempt carries a fresh
            // timestamp and signature.
            let (headers, body) = self.build_attempt(scope, request)?;
            let wire_result = self
                .transport
                .send(
                    self.api.method.clone(),
                    url.clone(),
                    headers,
                    body,
                    deadline,
                    timeline,
                )
                .await;

            let retryable = match &wire_result {
                Ok(wire) => !self.api.is_code_acceptable(wire.status),
                Err(_) => true,
            };

            if retryable && attempt < total_attempts {
                let now = Instant::now();
                if now >= deadline || now + retry_wait >= deadline {
                    // Deadline expiry is terminal; never retry past it.
                    return match wire_result {
                        Ok(wire) => self.classify_wire_outcome(request, wire),
                        Err(failure) => Err(self.classify_transport_failure(failure)),
                    };
                }
                match &wire_result {
                    Ok(wire) => info!(
                        api = %self.api.name,
                        status = wire.status,
                        attempt,
                        "retrying api after error"
                    ),
                    Err(failure) => info!(
                        api = %self.api.name,
                        error = %failure,
                        attempt,
                        "retrying api after error"
                    ),
                }
                tokio::time::sleep(retry_wait).await;
                continue;
            }

            return match wire_result {
                Ok(wire) => self.classify_wire_outcome(request, wire),
                Err(failure) => Err(self.classify_transport_failure(failure)),
            };
        }
    }
}

#[async_trait]
impl Command for HttpCommand {
    async fn execute(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
        deadline: Instant,
    ) -> Result<ApiResponse, HttpError> {
        if let Some(outcome) = self.options.run_pre_request_interceptors(scope, request) {
            return outcome;
        }

        let url = self.request_url(request)?;
        let timeline = self.timeline();

        let span = info_span!("http_call", api = %self.api.name, server = %self.server.name);
        let outcome = self
            .run_attempts(scope, request, deadline, &timeline, &url)
            .instrument(span)
            .await;

        self.log_request_response(&url, request, &outcome);
        self.publish_timeline(request, &url, &timeline);
        self.emit_call_metric(&outcome);

        outcome
    }
}
