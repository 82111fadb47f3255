use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::core::error::{ErrorCode, HttpError, find_in_chain};
use crate::core::registry::HttpContext;
use crate::core::request::{ApiRequest, CallScope};

/// Typed success envelope: the raw body plus the value it decoded into.
/// `response` is `None` for 204 and empty-body responses.
#[derive(Debug)]
pub struct TypedResponse<S> {
    pub body: Bytes,
    pub response: Option<S>,
    pub status: u16,
}

/// Typed failure envelope: the failing call's [`HttpError`] plus the error
/// payload decoded into `E` when response bytes were present and parseable.
#[derive(Debug)]
pub struct TypedError<E> {
    pub body: Option<Bytes>,
    pub response: Option<E>,
    pub status: u16,
    pub source: HttpError,
}

impl<E> std::fmt::Display for TypedError<E> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "http error response: {}", self.source)
    }
}

impl<E: std::fmt::Debug> std::error::Error for TypedError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Given an opaque error, returns the typed error found in its chain along
/// with a flag telling whether a decoded error payload is present.
pub fn extract_error<'a, E>(
    error: &'a (dyn std::error::Error + 'static),
) -> Option<(&'a TypedError<E>, bool)>
where
    E: std::fmt::Debug + 'static,
{
    let typed = find_in_chain::<TypedError<E>>(error)?;
    Some((typed, typed.response.is_some()))
}

async fn typed_outcome<S, E>(
    context: &HttpContext,
    scope: &CallScope,
    request: &ApiRequest,
    decode: fn(&[u8]) -> Result<S, serde_json::Error>,
) -> Result<TypedResponse<S>, TypedError<E>>
where
    E: DeserializeOwned,
{
    match context.execute_with_scope(scope, request).await {
        Ok(response) => {
            let status = response.status_code();
            if status == 204 || response.body().is_empty() {
                return Ok(TypedResponse {
                    body: Bytes::new(),
                    response: None,
                    status,
                });
            }
            match decode(response.body()) {
                Ok(parsed) => Ok(TypedResponse {
                    body: response.body().clone(),
                    response: Some(parsed),
                    status,
                }),
                Err(decode_error) => Err(TypedError {
                    body: Some(response.body().clone()),
                    response: None,
                    status,
                    source: HttpError::new(
                        ErrorCode::FailedToBuildResponseUsingResponseBuilder,
                        status,
                        "http request passed but response did not decode into the success type",
                    )
                    .with_body(response.body().clone())
                    .with_source(decode_error),
                }),
            }
        }
        Err(call_error) => {
            let body = call_error.body.clone();
            let response = body
                .as_ref()
                .and_then(|bytes| serde_json::from_slice::<E>(bytes).ok());
            Err(TypedError {
                status: call_error.status,
                body,
                response,
                source: call_error,
            })
        }
    }
}

/// Executes a call and decodes the body into `S` on success, or into `E`
/// (when a payload was received) on failure.
pub async fn execute_typed<S, E>(
    context: &HttpContext,
    scope: &CallScope,
    request: &ApiRequest,
) -> Result<TypedResponse<S>, TypedError<E>>
where
    S: DeserializeOwned,
    E: DeserializeOwned,
{
    typed_outcome(context, scope, request, |bytes| {
        serde_json::from_slice::<S>(bytes)
    })
    .await
}

/// Like [`execute_typed`], for endpoints whose success payload is a JSON
/// array of `S`.
pub async fn execute_typed_list<S, E>(
    context: &HttpContext,
    scope: &CallScope,
    request: &ApiRequest,
) -> Result<TypedResponse<Vec<S>>, TypedError<E>>
where
    S: DeserializeOwned,
    E: DeserializeOwned,
{
    typed_outcome(context, scope, request, |bytes| {
        serde_json::from_slice::<Vec<S>>(bytes)
    })
    .await
}
