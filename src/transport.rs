use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::time::timeout_at;
use tower_service::Service;

use crate::core::config::{ConfigError, Server};
use crate::core::tracking::{CallTimeline, GET_CONN, GOT_FIRST_RESPONSE_BYTE, PUT_IDLE_CONN};

type BoxConnectError = Box<dyn StdError + Send + Sync>;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// What came back over the wire for one attempt, untouched by any
/// classification policy.
pub(crate) struct WireResponse {
    pub(crate) status: u16,
    pub(crate) body: Bytes,
}

/// Wire-level failure of a single attempt. `Timeout` covers both the call
/// deadline firing and socket-level timeouts surfaced by the connector.
#[derive(Debug, Error)]
pub(crate) enum TransportFailure {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
    #[error("transport error: {source}")]
    Wire {
        #[source]
        source: BoxConnectError,
    },
}

/// Connector that dials directly, or through a CONNECT tunnel when the
/// server declares a proxy URL.
#[derive(Clone)]
struct ServerConnector {
    direct: HttpConnector,
    tunnel: Option<Tunnel<HttpConnector>>,
}

impl ServerConnector {
    fn new(proxy_uri: Option<Uri>, connect_timeout: Duration) -> Self {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        direct.set_connect_timeout(Some(connect_timeout));
        let tunnel = proxy_uri.map(|uri| Tunnel::new(uri, direct.clone()));
        Self { direct, tunnel }
    }
}

impl Service<Uri> for ServerConnector {
    type Response = <HttpConnector as Service<Uri>>::Response;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, context: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if let Some(tunnel) = &mut self.tunnel {
            return match tunnel.poll_ready(context) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
                Poll::Pending => Poll::Pending,
            };
        }
        match self.direct.poll_ready(context) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, destination: Uri) -> Self::Future {
        if let Some(tunnel) = &mut self.tunnel {
            let target = normalize_tunnel_target_uri(destination);
            let connecting = tunnel.call(target);
            return Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) });
        }
        let connecting = self.direct.call(destination);
        Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) })
    }
}

/// CONNECT targets need an explicit port.
fn normalize_tunnel_target_uri(destination: Uri) -> Uri {
    if destination.port().is_some() {
        return destination;
    }
    let default_port = match destination.scheme_str() {
        Some("https") => 443,
        Some("http") => 80,
        _ => return destination,
    };
    let Some(host) = destination.host() else {
        return destination;
    };
    let authority_text = format!("{host}:{default_port}");
    let Ok(authority) = authority_text.parse() else {
        return destination;
    };
    let original = destination.clone();
    let mut parts = destination.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}

/// Accepts any server certificate. Only installed when a server opts in with
/// `skip_cert_verify`.
#[derive(Debug)]
struct SkipServerCertVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn build_tls_config(skip_cert_verify: bool) -> Result<rustls::ClientConfig, String> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    if skip_cert_verify {
        let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|tls_error| tls_error.to_string())?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerCertVerification(provider)))
            .with_no_client_auth();
        return Ok(config);
    }

    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|tls_error| tls_error.to_string())?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// One hyper client per configured server, carrying that server's connect
/// timeout, TLS posture, and proxy route. Built once at setup and shared by
/// every attempt against that server.
#[derive(Clone)]
pub(crate) struct HttpTransport {
    client: HyperClient<HttpsConnector<ServerConnector>, Full<Bytes>>,
}

impl HttpTransport {
    pub(crate) fn for_server(server: &Server) -> Result<Self, ConfigError> {
        let proxy_uri = match &server.proxy_url {
            Some(raw) => Some(raw.parse::<Uri>().map_err(|parse_error| {
                ConfigError::Server {
                    server: server.name.clone(),
                    field: "proxy_url",
                    message: format!("{raw:?} is not a valid url: {parse_error}"),
                }
            })?),
            None => None,
        };

        let connector = ServerConnector::new(
            proxy_uri,
            Duration::from_millis(server.connect_timeout_ms),
        );
        let tls_config =
            build_tls_config(server.skip_cert_verify).map_err(|message| ConfigError::Server {
                server: server.name.clone(),
                field: "skip_cert_verify",
                message,
            })?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(https);

        Ok(Self { client })
    }

    /// Sends one fully assembled request, bounded by the call deadline, and
    /// buffers the response body. The status and body are returned verbatim
    /// for the caller to classify.
    pub(crate) async fn send(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        deadline: Instant,
        timeline: &CallTimeline,
    ) -> Result<WireResponse, TransportFailure> {
        let timeout_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis();

        let mut request_builder = Request::builder().method(method).uri(uri);
        if let Some(request_headers) = request_builder.headers_mut() {
            *request_headers = headers;
        }
        let request = request_builder
            .body(Full::new(body))
            .map_err(|build_error| TransportFailure::Wire {
                source: Box::new(build_error),
            })?;

        timeline.record(GET_CONN);
        let tokio_deadline = tokio::time::Instant::from_std(deadline);

        let response = match timeout_at(tokio_deadline, self.client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(request_error)) => return Err(classify_wire_error(request_error, timeout_ms)),
            Err(_elapsed) => return Err(TransportFailure::Timeout { timeout_ms }),
        };
        timeline.record(GOT_FIRST_RESPONSE_BYTE);

        let (parts, incoming) = response.into_parts();
        let collected = match timeout_at(tokio_deadline, incoming.collect()).await {
            Ok(Ok(collected)) => collected,
            Ok(Err(read_error)) => {
                return Err(TransportFailure::Wire {
                    source: Box::new(read_error),
                });
            }
            Err(_elapsed) => return Err(TransportFailure::Timeout { timeout_ms }),
        };
        timeline.record(PUT_IDLE_CONN);

        Ok(WireResponse {
            status: parts.status.as_u16(),
            body: collected.to_bytes(),
        })
    }
}

/// Socket-level timeouts (connect timeout firing inside the connector) are
/// surfaced the same way as the deadline elapsing.
fn classify_wire_error(
    error: hyper_util::client::legacy::Error,
    timeout_ms: u128,
) -> TransportFailure {
    let mut current: Option<&(dyn StdError + 'static)> = Some(&error);
    while let Some(candidate) = current {
        if let Some(io_error) = candidate.downcast_ref::<std::io::Error>() {
            if io_error.kind() == std::io::ErrorKind::TimedOut {
                return TransportFailure::Timeout { timeout_ms };
            }
        }
        current = candidate.source();
    }
    TransportFailure::Wire {
        source: Box::new(error),
    }
}
