//! `apidex` turns a declarative map of servers and named APIs into callable
//! commands with a uniform request/response/error contract.
//!
//! Describe servers and endpoints once, build an [`HttpContext`], then invoke
//! endpoints by name with per-call path parameters, query parameters, headers
//! and bodies. Each call transparently gets the endpoint's timeout, retry
//! policy, acceptable-status-code rules, circuit-breaker/bulkhead protection,
//! request signing, and optional connection tracing.
//!
//! # Quick Start
//!
//! ```no_run
//! use apidex::{ApiRequest, Config, HttpContext, Options};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config: Config = serde_yaml::from_str(
//!     r#"
//! servers:
//!   jsonplaceholder:
//!     host: jsonplaceholder.typicode.com
//!     port: 443
//!     https: true
//! apis:
//!   getPosts:
//!     path: /posts/{id}
//!     server: jsonplaceholder
//!     timeout: 1000
//!     retry_count: 2
//! "#,
//! )?;
//!
//! let context = HttpContext::from_config(&config, Options::default())?;
//! let request = ApiRequest::builder("getPosts").with_path_param("id", 1).build();
//! let response = context.execute(&request).await?;
//! println!("status={} body={}", response.status_code(), response.text_lossy());
//! # Ok(())
//! # }
//! ```
//!
//! # Recommended Defaults
//!
//! - Give every API an explicit `timeout`; the 100 ms default suits only
//!   fast internal calls.
//! - Leave resilience on (`disable_hystrix: false`) for anything called on a
//!   request path.
//! - List non-2xx statuses you handle yourself in `acceptable_codes` so the
//!   retry loop does not fight you.

mod core;
mod transport;
mod typed;

pub use crate::core::command::Command;
pub use crate::core::config::{
    Api, ApiConfig, Config, ConfigError, HmacConfig, InterceptorConfig, Param, ResolvedConfig,
    Scalar, Server, ServerConfig,
};
pub use crate::core::error::{CommandNotRegistered, ErrorCode, HttpError, find_in_chain};
pub use crate::core::interceptor::{HmacSha256Interceptor, RequestInterceptor};
pub use crate::core::metrics::{HTTP_CALL_COUNTER, InMemoryMetrics, MetricsSink};
pub use crate::core::registry::{HttpContext, Options, PreRequestInterceptor};
pub use crate::core::request::{
    ApiRequest, ApiRequestBuilder, ApiResponse, Body, BodyProvider, CallScope,
    JsonResponseBuilder, MultiValueMap, ResponseBuilder, TESTING_TIMESTAMP_KEY,
    UNIQUE_UUID_SENTINEL,
};
pub use crate::core::resilience::ResiliencePolicy;
pub use crate::core::tracking;
pub use crate::core::tracking::{CallTimeline, TimelineEvent, TimelineSink, TraceContextInjector};
pub use crate::typed::{
    TypedError, TypedResponse, execute_typed, execute_typed_list, extract_error,
};

pub type Result<T> = std::result::Result<T, HttpError>;

pub mod prelude {
    pub use crate::{
        ApiRequest, ApiResponse, CallScope, Config, ErrorCode, HttpContext, HttpError, Options,
        Result,
    };
}
