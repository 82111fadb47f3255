use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use sha2::Sha256;
use tracing::debug;

use crate::core::config::{HmacConfig, InterceptorConfig};
use crate::core::error::{ErrorCode, HttpError};
use crate::core::request::{CallScope, TESTING_TIMESTAMP_KEY};

type HmacSha256 = Hmac<Sha256>;

/// Mutates an outbound request after headers, parameters and body are fixed,
/// but before transport. Runs once per attempt, so retried requests carry
/// fresh signatures.
pub trait RequestInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept(
        &self,
        scope: &CallScope,
        headers: &mut HeaderMap,
        body: &[u8],
    ) -> Result<(), HttpError>;
}

/// Picks the effective interceptor configuration for a call: server-level
/// wins when present and enabled, otherwise API-level.
pub fn select_config<'a>(
    server_config: Option<&'a InterceptorConfig>,
    api_config: Option<&'a InterceptorConfig>,
) -> Option<&'a InterceptorConfig> {
    match server_config {
        Some(config) if !config.disabled => Some(config),
        _ => match api_config {
            Some(config) if !config.disabled => Some(config),
            _ => None,
        },
    }
}

/// Instantiates the interceptor for a resolved configuration, or `None` when
/// nothing is configured or everything is disabled.
pub fn build_interceptor(
    config: Option<&InterceptorConfig>,
) -> Option<Box<dyn RequestInterceptor>> {
    let config = config?;
    if config.disabled {
        return None;
    }
    let hmac = config.hmac_config.as_ref()?;
    if hmac.disabled {
        return None;
    }
    Some(Box::new(HmacSha256Interceptor::new(hmac.clone())))
}

/// Signs the canonical request payload with HMAC-SHA256 and stamps the hash
/// (and optionally the timestamp) headers.
///
/// The canonical payload is: the raw body bytes; then, when a timestamp
/// header is configured, the decimal Unix-millisecond timestamp (prefixed
/// with `#` when a body is present); then the lexicographically sorted
/// `name=value` pairs of the configured headers, `#`-prefixed and `#`-joined.
pub struct HmacSha256Interceptor {
    config: HmacConfig,
}

impl HmacSha256Interceptor {
    pub fn new(config: HmacConfig) -> Self {
        Self { config }
    }

    fn signing_timestamp(scope: &CallScope) -> String {
        if let Some(testing_timestamp) = scope.value(TESTING_TIMESTAMP_KEY) {
            if !testing_timestamp.is_empty() {
                return testing_timestamp.to_owned();
            }
        }
        let unix_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        unix_millis.to_string()
    }

    fn set_header(
        headers: &mut HeaderMap,
        name: &str,
        value: &str,
    ) -> Result<(), HttpError> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|name_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                format!("invalid signing header name: {name}"),
            )
            .with_source(name_error)
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|value_error| {
            HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                format!("invalid signing header value for {name}"),
            )
            .with_source(value_error)
        })?;
        headers.insert(header_name, header_value);
        Ok(())
    }
}

impl RequestInterceptor for HmacSha256Interceptor {
    fn name(&self) -> &'static str {
        "hmac-sha256"
    }

    fn intercept(
        &self,
        scope: &CallScope,
        headers: &mut HeaderMap,
        body: &[u8],
    ) -> Result<(), HttpError> {
        if self.config.key.is_empty() {
            return Err(HttpError::new(
                ErrorCode::FailedToBuildRequest,
                500,
                "key is missing in hmac config - a secret key is required for hash generation",
            ));
        }

        let mut payload: Vec<u8> = Vec::with_capacity(body.len() + 64);
        payload.extend_from_slice(body);

        let timestamp = Self::signing_timestamp(scope);
        if !self.config.timestamp_header_key.is_empty() {
            Self::set_header(headers, &self.config.timestamp_header_key, &timestamp)?;
            if payload.is_empty() {
                payload.extend_from_slice(timestamp.as_bytes());
            } else {
                payload.push(b'#');
                payload.extend_from_slice(timestamp.as_bytes());
            }
        }

        let mut signed_headers = Vec::new();
        for configured_name in &self.config.headers_to_include_in_signature {
            let name = if self.config.convert_header_keys_to_lower_case {
                configured_name.to_ascii_lowercase()
            } else {
                configured_name.clone()
            };
            let value = headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if !value.is_empty() {
                signed_headers.push(format!("{name}={value}"));
            }
        }
        if !signed_headers.is_empty() {
            signed_headers.sort();
            payload.push(b'#');
            payload.extend_from_slice(signed_headers.join("#").as_bytes());
        }

        let mut mac =
            HmacSha256::new_from_slice(self.config.key.as_bytes()).map_err(|key_error| {
                HttpError::new(
                    ErrorCode::FailedToBuildRequest,
                    500,
                    "failed to initialize hmac with configured key",
                )
                .with_source(key_error)
            })?;
        mac.update(&payload);
        let digest = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Self::set_header(headers, &self.config.hash_header_key, &digest)?;

        if self.config.dump_debug {
            debug!(
                hash = %digest,
                timestamp = %timestamp,
                payload = %String::from_utf8_lossy(&payload),
                "updated request with hmac-sha256 hash and timestamp"
            );
        }

        Ok(())
    }
}
