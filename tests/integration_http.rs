use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use apidex::{
    ApiRequest, CallScope, CommandNotRegistered, Config, ErrorCode, HttpContext, InMemoryMetrics,
    MetricsSink, Options, TESTING_TIMESTAMP_KEY, execute_typed, find_in_chain,
};
use serde::Deserialize;

#[derive(Clone)]
struct ResponseSpec {
    status: u16,
    body: Vec<u8>,
}

impl ResponseSpec {
    fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(raw_headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(raw_headers);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Ok(parsed) = value.trim().parse::<usize>() {
                    return parsed;
                }
            }
        }
    }
    0
}

fn read_http_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_header_end(&raw) {
            let content_length = parse_content_length(&raw[..header_end]);
            if raw.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    let header_end = find_header_end(&raw).unwrap_or(raw.len());
    let header_text = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let headers = header_text
        .split("\r\n")
        .skip(1)
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect();
    let body = raw.get(header_end + 4..).unwrap_or_default().to_vec();

    Ok(CapturedRequest { headers, body })
}

fn write_http_response(stream: &mut TcpStream, response: &ResponseSpec) -> std::io::Result<()> {
    let raw = format!(
        "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.body.len()
    );
    stream.write_all(raw.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

/// Serves the scripted responses in order (repeating the last one) and keeps
/// every received request for later assertions.
struct ScriptedServer {
    authority: String,
    served: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl ScriptedServer {
    fn start(expected_requests: usize, responses: Vec<ResponseSpec>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scripted server");
        let authority = listener
            .local_addr()
            .expect("read local address")
            .to_string();
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let requests_clone = Arc::clone(&requests);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if served_clone.load(Ordering::SeqCst) >= expected_requests {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let index = served_clone.load(Ordering::SeqCst);
                        let response = responses
                            .get(index)
                            .or_else(|| responses.last())
                            .cloned()
                            .unwrap_or(ResponseSpec::new(200, Vec::<u8>::new()));

                        if let Ok(request) = read_http_request(&mut stream) {
                            lock_unpoisoned(&requests_clone).push(request);
                        }
                        let _ = write_http_response(&mut stream, &response);
                        served_clone.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            authority,
            served,
            requests,
            join: Some(join),
        }
    }

    fn authority(&self) -> &str {
        &self.authority
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        lock_unpoisoned(&self.requests).clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

const HMAC_CONFIG: &str = r#"
servers:
  testServer:
    host: 127.0.0.1
    port: 80
    interceptor_config:
      hmac_config:
        key: secret_123
        hash_header_key: X-Hash-Code
        timestamp_header_key: X-Timestamp
        headers_to_include_in_signature:
          - X-Header-1
          - X-Header-2
        convert_header_keys_to_lower_case: true
apis:
  delay_timeout_10:
    method: GET
    path: /delay/{id}
    server: testServer
    timeout: 2000
    disable_hystrix: true
"#;

fn context_for(config_text: &str, authority: &str, api: &str, method: &str) -> HttpContext {
    let config: Config = serde_yaml::from_str(config_text).expect("config should parse");
    let mut resolved = config.resolve().expect("config should resolve");
    let server_name = resolved.apis[api].server.clone();
    resolved
        .servers
        .get_mut(&server_name)
        .expect("server should exist")
        .update_url(&format!("http://{authority}"))
        .expect("authority should parse");
    if let Some(api_config) = resolved.apis.get_mut(api) {
        api_config.method = method.parse().expect("method should parse");
    }
    HttpContext::new(resolved, Options::default()).expect("context should build")
}

fn testing_scope() -> CallScope {
    CallScope::new().with_value(TESTING_TIMESTAMP_KEY, "1704067200000")
}

fn signed_request() -> ApiRequest {
    ApiRequest::builder("delay_timeout_10")
        .with_content_type_json()
        .with_header("X-Header-1", 101)
        .with_header("X-Header-2", "header2")
        .with_path_param("id", 1)
        .with_json_response::<serde_json::Value>()
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hmac_get_without_body_stamps_expected_headers() {
    let server = ScriptedServer::start(1, vec![ResponseSpec::new(200, br#"{"status":"ok"}"#.to_vec())]);
    let context = context_for(HMAC_CONFIG, server.authority(), "delay_timeout_10", "GET");

    let response = context
        .execute_with_scope(&testing_scope(), &signed_request())
        .await
        .expect("signed get should succeed");
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response
            .parsed_as::<serde_json::Value>()
            .and_then(|value| value["status"].as_str()),
        Some("ok")
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].header("X-Hash-Code"),
        Some("YyfbKp/6v0IrWPtdLYDMY6WYv+kKg5wv4bE89EOK/jw=")
    );
    assert_eq!(requests[0].header("X-Timestamp"), Some("1704067200000"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hmac_post_with_raw_string_body_stamps_expected_headers() {
    let server = ScriptedServer::start(1, vec![ResponseSpec::new(200, br#"{"status":"ok"}"#.to_vec())]);
    let context = context_for(HMAC_CONFIG, server.authority(), "delay_timeout_10", "POST");

    let request = ApiRequest::builder("delay_timeout_10")
        .with_content_type_json()
        .with_header("X-Header-1", 101)
        .with_header("X-Header-2", "header2")
        .with_path_param("id", 1)
        .with_body_string(r#"{"status": "ok"}"#)
        .with_json_response::<serde_json::Value>()
        .build();

    let response = context
        .execute_with_scope(&testing_scope(), &request)
        .await
        .expect("signed post should succeed");
    assert_eq!(response.status_code(), 200);

    let requests = server.requests();
    assert_eq!(
        requests[0].header("X-Hash-Code"),
        Some("RWTd7uSqc1JrQEwJcFsyxA85qybw0MsVZCwKnT9Sgos=")
    );
    assert_eq!(requests[0].header("X-Timestamp"), Some("1704067200000"));
    assert_eq!(requests[0].body, br#"{"status": "ok"}"#.to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hmac_post_with_typed_body_stamps_expected_headers() {
    #[derive(serde::Serialize)]
    struct Payload {
        status: &'static str,
    }

    let server = ScriptedServer::start(1, vec![ResponseSpec::new(200, br#"{"status":"ok"}"#.to_vec())]);
    let context = context_for(HMAC_CONFIG, server.authority(), "delay_timeout_10", "POST");

    let request = ApiRequest::builder("delay_timeout_10")
        .with_content_type_json()
        .with_header("X-Header-1", 101)
        .with_header("X-Header-2", "header2")
        .with_path_param("id", 1)
        .with_json_body(&Payload { status: "ok" })
        .expect("body should serialise")
        .with_json_response::<serde_json::Value>()
        .build();

    let response = context
        .execute_with_scope(&testing_scope(), &request)
        .await
        .expect("signed post should succeed");
    assert_eq!(response.status_code(), 200);

    let requests = server.requests();
    assert_eq!(
        requests[0].header("X-Hash-Code"),
        Some("bux/MHZnySHNHySSzvaRcE4fKzXSwmvPcTAO31rs61I=")
    );
    assert_eq!(requests[0].body, br#"{"status":"ok"}"#.to_vec());
}

const RETRY_CONFIG: &str = r#"
servers:
  testServer:
    host: 127.0.0.1
    port: 80
apis:
  find_post:
    method: GET
    path: /posts/{id}
    server: testServer
    timeout: 2000
    retry_count: 3
    retry_initial_wait_time_ms: 5
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_exhaustion_sends_exactly_retry_count_plus_one_requests() {
    let server = ScriptedServer::start(
        4,
        vec![ResponseSpec::new(401, br#"{"error":"denied"}"#.to_vec())],
    );
    let context = context_for(RETRY_CONFIG, server.authority(), "find_post", "GET");

    let request = ApiRequest::builder("find_post").with_path_param("id", 1).build();
    let error = context
        .execute(&request)
        .await
        .expect_err("server always denies");
    assert_eq!(error.status, 401);
    assert_eq!(error.code, ErrorCode::ServerResponseWithError);
    assert_eq!(
        error.body_bytes().map(|bytes| bytes.as_ref()),
        Some(&br#"{"error":"denied"}"#[..])
    );
    assert_eq!(server.served_count(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_stops_at_first_acceptable_response() {
    let server = ScriptedServer::start(
        3,
        vec![
            ResponseSpec::new(401, Vec::<u8>::new()),
            ResponseSpec::new(401, Vec::<u8>::new()),
            ResponseSpec::new(200, br#"{"status":"ok"}"#.to_vec()),
        ],
    );
    let context = context_for(RETRY_CONFIG, server.authority(), "find_post", "GET");

    let request = ApiRequest::builder("find_post")
        .with_path_param("id", 1)
        .with_json_response::<serde_json::Value>()
        .build();
    let response = context
        .execute(&request)
        .await
        .expect("third attempt should succeed");
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response
            .parsed_as::<serde_json::Value>()
            .and_then(|value| value["status"].as_str()),
        Some("ok")
    );
    assert_eq!(server.served_count(), 3);
}

const ACCEPTABLE_401_CONFIG: &str = r#"
servers:
  testServer:
    host: 127.0.0.1
    port: 80
apis:
  find_post:
    method: GET
    path: /posts/{id}
    server: testServer
    timeout: 2000
    acceptable_codes: "200, 401"
    retry_count: 3
    retry_initial_wait_time_ms: 5
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acceptable_non_2xx_is_success_and_never_retried() {
    let server = ScriptedServer::start(
        1,
        vec![ResponseSpec::new(401, br#"{"status":"unauthorized"}"#.to_vec())],
    );
    let context = context_for(ACCEPTABLE_401_CONFIG, server.authority(), "find_post", "GET");

    let request = ApiRequest::builder("find_post")
        .with_path_param("id", 1)
        .with_json_response::<serde_json::Value>()
        .build();
    let response = context
        .execute(&request)
        .await
        .expect("401 is acceptable for this api");
    assert_eq!(response.status_code(), 401);
    assert_eq!(
        response
            .parsed_as::<serde_json::Value>()
            .and_then(|value| value["status"].as_str()),
        Some("unauthorized")
    );

    // Give any stray retry a chance to land before asserting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_204_with_body_is_success_without_content() {
    let server = ScriptedServer::start(
        2,
        vec![
            ResponseSpec::new(204, b"ignored".to_vec()),
            ResponseSpec::new(200, Vec::<u8>::new()),
        ],
    );
    let config_text = r#"
servers:
  testServer:
    host: 127.0.0.1
    port: 80
apis:
  find_post:
    method: GET
    path: /posts/{id}
    server: testServer
    timeout: 2000
    acceptable_codes: "200, 204"
"#;
    let context = context_for(config_text, server.authority(), "find_post", "GET");

    let request = ApiRequest::builder("find_post")
        .with_path_param("id", 1)
        .with_json_response::<serde_json::Value>()
        .build();

    let response = context
        .execute(&request)
        .await
        .expect("204 should be success");
    assert_eq!(response.status_code(), 204);
    assert!(response.parsed_as::<serde_json::Value>().is_none());

    let response = context
        .execute(&request)
        .await
        .expect("empty 200 should be success");
    assert_eq!(response.status_code(), 200);
    assert!(response.parsed_as::<serde_json::Value>().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_api_carries_not_registered_sentinel() {
    let config: Config = serde_yaml::from_str(RETRY_CONFIG).expect("config should parse");
    let context = HttpContext::from_config(&config, Options::default()).expect("context builds");

    let request = ApiRequest::builder("unconfigured").build();
    let error = context
        .execute(&request)
        .await
        .expect_err("unconfigured api must fail");
    assert_eq!(error.code, ErrorCode::CommandNotFound);
    assert!(find_in_chain::<CommandNotRegistered>(&error).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_outcomes_are_counted_with_status_tags() {
    let server = ScriptedServer::start(1, vec![ResponseSpec::new(200, br#"{"status":"ok"}"#.to_vec())]);
    let metrics = Arc::new(InMemoryMetrics::new());

    let config: Config = serde_yaml::from_str(RETRY_CONFIG).expect("config should parse");
    let mut resolved = config.resolve().expect("config should resolve");
    resolved
        .servers
        .get_mut("testServer")
        .expect("server exists")
        .update_url(&format!("http://{}", server.authority()))
        .expect("authority should parse");
    let options = Options::default().with_metrics_sink(Arc::clone(&metrics) as Arc<dyn MetricsSink>);
    let context = HttpContext::new(resolved, options).expect("context builds");

    let request = ApiRequest::builder("find_post").with_path_param("id", 1).build();
    context.execute(&request).await.expect("call should succeed");

    assert_eq!(
        metrics.count(
            apidex::HTTP_CALL_COUNTER,
            &[("server", "testServer"), ("api", "find_post"), ("status", "200")],
        ),
        1
    );
}

#[derive(Debug, Deserialize)]
struct PostPayload {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn typed_execution_decodes_success_and_error_payloads() {
    let server = ScriptedServer::start(
        2,
        vec![
            ResponseSpec::new(200, br#"{"status":"ok"}"#.to_vec()),
            ResponseSpec::new(404, br#"{"error":"missing"}"#.to_vec()),
        ],
    );
    let config_text = r#"
servers:
  testServer:
    host: 127.0.0.1
    port: 80
apis:
  find_post:
    method: GET
    path: /posts/{id}
    server: testServer
    timeout: 2000
"#;
    let context = context_for(config_text, server.authority(), "find_post", "GET");
    let request = ApiRequest::builder("find_post").with_path_param("id", 1).build();

    let success = execute_typed::<PostPayload, ErrorPayload>(&context, &CallScope::new(), &request)
        .await
        .expect("first response decodes into the success type");
    assert_eq!(success.status, 200);
    assert_eq!(
        success.response.as_ref().map(|payload| payload.status.as_str()),
        Some("ok")
    );

    let failure = execute_typed::<PostPayload, ErrorPayload>(&context, &CallScope::new(), &request)
        .await
        .expect_err("second response is a 404");
    assert_eq!(failure.status, 404);
    assert_eq!(
        failure.response.as_ref().map(|payload| payload.error.as_str()),
        Some("missing")
    );
    assert_eq!(failure.source.code, ErrorCode::ServerResponseWithError);
}
