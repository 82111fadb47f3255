use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Setup-time failures: a scalar that does not coerce to the declared type,
/// an API pointing at an unknown server, or a malformed retarget URL. Every
/// variant names the entity and field so a large document stays debuggable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error parsing {field} property for server={server}: {message}")]
    Server {
        server: String,
        field: &'static str,
        message: String,
    },
    #[error("error parsing {field} property for api={api}: {message}")]
    Api {
        api: String,
        field: &'static str,
        message: String,
    },
    #[error("failed to create http command (server not found): api={api}, server={server}")]
    ServerNotFound { api: String, server: String },
    #[error("api not found in configuration: {api}")]
    UnknownApi { api: String },
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// A single configuration scalar as it appears in the document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    pub fn as_string(&self) -> String {
        match self {
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::String(value) => value.clone(),
        }
    }

    pub fn as_i64(&self) -> Result<i64, String> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::String(value) => value
                .trim()
                .parse::<i64>()
                .map_err(|parse_error| format!("{value:?} is not an integer: {parse_error}")),
            Self::Float(value) if value.fract() == 0.0 => Ok(*value as i64),
            other => Err(format!("{} is not an integer", other.as_string())),
        }
    }

    pub fn as_bool(&self) -> Result<bool, String> {
        match self {
            Self::Bool(value) => Ok(*value),
            Self::String(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(format!("{other:?} is not a bool - it should be true/false")),
            },
            other => Err(format!("{} is not a bool", other.as_string())),
        }
    }
}

/// A parameterised value: either a literal scalar, or a table keyed by
/// environment name with a `default` fallback.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Param {
    Literal(Scalar),
    PerEnv(BTreeMap<String, Scalar>),
}

impl Param {
    fn pick(&self, env: &str) -> Option<&Scalar> {
        match self {
            Self::Literal(scalar) => Some(scalar),
            Self::PerEnv(table) => table.get(env).or_else(|| table.get("default")),
        }
    }

    pub fn get_string(&self, env: &str, fallback: &str) -> Result<String, String> {
        Ok(self
            .pick(env)
            .map(Scalar::as_string)
            .unwrap_or_else(|| fallback.to_owned()))
    }

    pub fn get_i64(&self, env: &str, fallback: i64) -> Result<i64, String> {
        self.pick(env).map_or(Ok(fallback), Scalar::as_i64)
    }

    pub fn get_bool(&self, env: &str, fallback: bool) -> Result<bool, String> {
        self.pick(env).map_or(Ok(fallback), Scalar::as_bool)
    }
}

/// Request-signing configuration attached to a server or an API.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InterceptorConfig {
    pub disabled: bool,
    pub hmac_config: Option<HmacConfig>,
}

impl InterceptorConfig {
    pub fn is_active(&self) -> bool {
        !self.disabled
            && self
                .hmac_config
                .as_ref()
                .is_some_and(|hmac| !hmac.disabled)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HmacConfig {
    pub disabled: bool,
    pub key: String,
    pub hash_header_key: String,
    pub timestamp_header_key: String,
    pub headers_to_include_in_signature: Vec<String>,
    pub convert_header_keys_to_lower_case: bool,
    pub dump_debug: bool,
}

fn default_env() -> String {
    "prod".to_owned()
}

/// The raw two-level document: a map of server definitions, a map of API
/// definitions, and the active environment tag. Parse it from any serde
/// format, then [`Config::resolve`] it into the frozen model.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub apis: BTreeMap<String, ApiConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Option<Param>,
    pub port: Option<Param>,
    pub https: Option<Param>,
    pub connect_timeout: Option<Param>,
    pub connection_request_timeout: Option<Param>,
    pub skip_cert_verify: Option<Param>,
    pub proxy_url: Option<Param>,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub headers: BTreeMap<String, serde_json::Value>,
    pub interceptor_config: Option<InterceptorConfig>,
    pub enable_http_connection_tracing: Option<Param>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub method: Option<Param>,
    pub path: Option<Param>,
    pub server: Option<Param>,
    pub timeout: Option<Param>,
    pub concurrency: Option<Param>,
    pub queue_size: Option<Param>,
    pub r#async: Option<Param>,
    pub acceptable_codes: Option<Param>,
    pub retry_count: Option<Param>,
    pub retry_initial_wait_time_ms: Option<Param>,
    pub headers: BTreeMap<String, serde_json::Value>,
    pub interceptor_config: Option<InterceptorConfig>,
    pub enable_request_response_logging: Option<Param>,
    pub enable_http_connection_tracing: Option<Param>,
    pub disable_hystrix: Option<Param>,
}

/// A resolved, addressable target.
#[derive(Clone, Debug, PartialEq)]
pub struct Server {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub connect_timeout_ms: u64,
    pub connection_request_timeout_ms: u64,
    pub skip_cert_verify: bool,
    pub proxy_url: Option<String>,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub headers: BTreeMap<String, String>,
    pub interceptor_config: Option<InterceptorConfig>,
    pub enable_http_connection_tracing: bool,
}

impl Server {
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Comma-separated context keys listed under `properties.mdc`, each of
    /// which is propagated from the call scope as an outbound header.
    pub fn mdc_keys(&self) -> Vec<String> {
        let Some(serde_json::Value::String(keys)) = self.properties.get("mdc") else {
            return Vec::new();
        };
        keys.split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Retargets this server at a full URL, rewriting host, port and the TLS
    /// flag from the scheme. Mostly useful for pointing a configured server
    /// at an ephemeral test listener.
    pub fn update_url(&mut self, full_url: &str) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(full_url).map_err(|parse_error| ConfigError::InvalidUrl {
            url: full_url.to_owned(),
            message: parse_error.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl {
                url: full_url.to_owned(),
                message: "url has no host".to_owned(),
            })?
            .to_owned();
        let https = parsed.scheme() == "https";
        let port = parsed
            .port()
            .unwrap_or(if https { 443 } else { 80 });

        self.host = host;
        self.port = port;
        self.https = https;
        Ok(())
    }
}

/// A resolved named endpoint bound to one server.
#[derive(Clone, Debug, PartialEq)]
pub struct Api {
    pub name: String,
    pub method: Method,
    pub path: String,
    pub server: String,
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub queue_size: usize,
    pub async_enabled: bool,
    pub acceptable_codes: BTreeSet<u16>,
    pub retry_count: u32,
    pub initial_retry_wait_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub interceptor_config: Option<InterceptorConfig>,
    pub enable_request_response_logging: bool,
    pub enable_http_connection_tracing: bool,
    pub disable_hystrix: bool,
}

impl Api {
    /// Whether a status code counts as success for this API. An empty
    /// configured set falls back to the 2xx range.
    pub fn is_code_acceptable(&self, status: u16) -> bool {
        if self.acceptable_codes.is_empty() {
            (200..=299).contains(&status)
        } else {
            self.acceptable_codes.contains(&status)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_retry_wait(&self) -> Duration {
        Duration::from_millis(self.initial_retry_wait_ms)
    }

    /// The internal resilience deadline: room for every retry attempt plus
    /// the initial wait, padded with 10% headroom (minimum 2ms).
    pub fn resilience_timeout(&self) -> Duration {
        let mut budget_ms = self.timeout_ms
            + self.timeout_ms * u64::from(self.retry_count)
            + self.initial_retry_wait_ms;
        budget_ms += (budget_ms / 10).max(2);
        Duration::from_millis(budget_ms)
    }
}

/// The frozen model: every parameterised value resolved against the active
/// environment. Built once at setup and never mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfig {
    pub env: String,
    pub servers: BTreeMap<String, Server>,
    pub apis: BTreeMap<String, Api>,
}

impl ResolvedConfig {
    pub fn find_server(&self, name: &str) -> Option<&Server> {
        self.servers.get(name)
    }
}

fn server_field<T>(
    server: &str,
    field: &'static str,
    value: Result<T, String>,
) -> Result<T, ConfigError> {
    value.map_err(|message| ConfigError::Server {
        server: server.to_owned(),
        field,
        message,
    })
}

fn api_field<T>(api: &str, field: &'static str, value: Result<T, String>) -> Result<T, ConfigError> {
    value.map_err(|message| ConfigError::Api {
        api: api.to_owned(),
        field,
        message,
    })
}

fn stringify_header_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn parse_acceptable_codes(raw: &str) -> Result<BTreeSet<u16>, String> {
    let mut codes = BTreeSet::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let code = trimmed
            .parse::<u16>()
            .map_err(|parse_error| format!("{trimmed:?} is not a status code: {parse_error}"))?;
        codes.insert(code);
    }
    Ok(codes)
}

fn parse_method(raw: &str) -> Result<Method, String> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        other => Err(format!("unsupported http method {other:?}")),
    }
}

fn positive_ms(value: i64) -> Result<u64, String> {
    if value <= 0 {
        return Err(format!("{value} must be strictly positive"));
    }
    Ok(value as u64)
}

fn non_negative(value: i64) -> Result<u64, String> {
    if value < 0 {
        return Err(format!("{value} must not be negative"));
    }
    Ok(value as u64)
}

impl Config {
    /// Resolves the raw document into the frozen model using the document's
    /// environment tag. Fails with an error naming the server/API and field
    /// on any type mismatch.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let env = if self.env.trim().is_empty() {
            default_env()
        } else {
            self.env.clone()
        };

        let mut servers = BTreeMap::new();
        for (name, raw) in &self.servers {
            servers.insert(name.clone(), resolve_server(name, raw, &env)?);
        }

        let mut apis = BTreeMap::new();
        for (name, raw) in &self.apis {
            apis.insert(name.clone(), resolve_api(name, raw, &env)?);
        }

        Ok(ResolvedConfig { env, servers, apis })
    }
}

fn resolve_server(name: &str, raw: &ServerConfig, env: &str) -> Result<Server, ConfigError> {
    let host = match raw.host.as_ref() {
        Some(param) => server_field(name, "host", param.get_string(env, "localhost"))?,
        None => "localhost".to_owned(),
    };
    let port = {
        let value = match raw.port.as_ref() {
            Some(param) => server_field(name, "port", param.get_i64(env, 80))?,
            None => 80,
        };
        server_field(
            name,
            "port",
            u16::try_from(value).map_err(|_| format!("{value} is not a valid port")),
        )?
    };
    let https = match raw.https.as_ref() {
        Some(param) => server_field(name, "https", param.get_bool(env, false))?,
        None => false,
    };
    let connect_timeout_ms = match raw.connect_timeout.as_ref() {
        Some(param) => {
            server_field(name, "connect_timeout", param.get_i64(env, 50).and_then(positive_ms))?
        }
        None => 50,
    };
    let connection_request_timeout_ms = match raw.connection_request_timeout.as_ref() {
        Some(param) => server_field(
            name,
            "connection_request_timeout",
            param.get_i64(env, 50).and_then(positive_ms),
        )?,
        None => 50,
    };
    let skip_cert_verify = match raw.skip_cert_verify.as_ref() {
        Some(param) => server_field(name, "skip_cert_verify", param.get_bool(env, false))?,
        None => false,
    };
    let proxy_url = match raw.proxy_url.as_ref() {
        Some(param) => {
            let value = server_field(name, "proxy_url", param.get_string(env, ""))?;
            if value.is_empty() { None } else { Some(value) }
        }
        None => None,
    };
    let enable_http_connection_tracing = match raw.enable_http_connection_tracing.as_ref() {
        Some(param) => server_field(
            name,
            "enable_http_connection_tracing",
            param.get_bool(env, false),
        )?,
        None => false,
    };

    let headers = raw
        .headers
        .iter()
        .map(|(header, value)| (header.clone(), stringify_header_value(value)))
        .collect();

    Ok(Server {
        name: name.to_owned(),
        host,
        port,
        https,
        connect_timeout_ms,
        connection_request_timeout_ms,
        skip_cert_verify,
        proxy_url,
        properties: raw.properties.clone(),
        headers,
        interceptor_config: raw.interceptor_config.clone(),
        enable_http_connection_tracing,
    })
}

fn resolve_api(name: &str, raw: &ApiConfig, env: &str) -> Result<Api, ConfigError> {
    let method = {
        let value = match raw.method.as_ref() {
            Some(param) => api_field(name, "method", param.get_string(env, "GET"))?,
            None => "GET".to_owned(),
        };
        api_field(name, "method", parse_method(&value))?
    };
    let path = match raw.path.as_ref() {
        Some(param) => api_field(name, "path", param.get_string(env, "/"))?,
        None => "/".to_owned(),
    };
    let server = match raw.server.as_ref() {
        Some(param) => api_field(name, "server", param.get_string(env, ""))?,
        None => String::new(),
    };
    let timeout_ms = match raw.timeout.as_ref() {
        Some(param) => api_field(name, "timeout", param.get_i64(env, 100).and_then(positive_ms))?,
        None => 100,
    };
    let concurrency = {
        let value = match raw.concurrency.as_ref() {
            Some(param) => api_field(name, "concurrency", param.get_i64(env, 1))?,
            None => 1,
        };
        if value < 1 {
            return Err(ConfigError::Api {
                api: name.to_owned(),
                field: "concurrency",
                message: format!("{value} must be at least 1"),
            });
        }
        value as usize
    };
    let queue_size = {
        let value = match raw.queue_size.as_ref() {
            Some(param) => api_field(name, "queue_size", param.get_i64(env, 10))?,
            None => 10,
        };
        api_field(name, "queue_size", non_negative(value))? as usize
    };
    let async_enabled = match raw.r#async.as_ref() {
        Some(param) => api_field(name, "async", param.get_bool(env, false))?,
        None => false,
    };
    let acceptable_codes = {
        let value = match raw.acceptable_codes.as_ref() {
            Some(param) => api_field(name, "acceptable_codes", param.get_string(env, "200,201"))?,
            None => "200,201".to_owned(),
        };
        api_field(name, "acceptable_codes", parse_acceptable_codes(&value))?
    };
    let retry_count = {
        let value = match raw.retry_count.as_ref() {
            Some(param) => api_field(name, "retry_count", param.get_i64(env, 0))?,
            None => 0,
        };
        api_field(name, "retry_count", non_negative(value))? as u32
    };
    let initial_retry_wait_ms = match raw.retry_initial_wait_time_ms.as_ref() {
        Some(param) => api_field(
            name,
            "retry_initial_wait_time_ms",
            param.get_i64(env, 1).and_then(positive_ms),
        )?,
        None => 1,
    };
    let enable_request_response_logging = match raw.enable_request_response_logging.as_ref()
    {
        Some(param) => api_field(
            name,
            "enable_request_response_logging",
            param.get_bool(env, false),
        )?,
        None => false,
    };
    let enable_http_connection_tracing = match raw.enable_http_connection_tracing.as_ref() {
        Some(param) => api_field(
            name,
            "enable_http_connection_tracing",
            param.get_bool(env, false),
        )?,
        None => false,
    };
    let disable_hystrix = match raw.disable_hystrix.as_ref() {
        Some(param) => api_field(name, "disable_hystrix", param.get_bool(env, false))?,
        None => false,
    };

    let headers = raw
        .headers
        .iter()
        .map(|(header, value)| (header.clone(), stringify_header_value(value)))
        .collect();

    Ok(Api {
        name: name.to_owned(),
        method,
        path,
        server,
        timeout_ms,
        concurrency,
        queue_size,
        async_enabled,
        acceptable_codes,
        retry_count,
        initial_retry_wait_ms,
        headers,
        interceptor_config: raw.interceptor_config.clone(),
        enable_request_response_logging,
        enable_http_connection_tracing,
        disable_hystrix,
    })
}
