use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use http::HeaderMap;

use crate::core::request::{ApiRequest, CallScope};
use crate::core::util::lock_unpoisoned;

/// Carrier hook for distributed tracing: stamps the active span context onto
/// the outgoing headers as the first step of request construction, before any
/// configured or per-call headers. The span provider itself lives with the
/// host application; the default context has no injector and emits nothing.
pub trait TraceContextInjector: Send + Sync {
    fn inject(&self, scope: &CallScope, headers: &mut HeaderMap);
}

// Connection-event vocabulary. The timeline accepts all of these names; the
// bundled transport can only observe pool checkout, first response byte and
// connection return (`GetConn`, `GotFirstResponseByte`, `PutIdleConn`).
// Custom transports and sinks use the rest.
pub const DNS_START: &str = "DnsStart";
pub const DNS_DONE: &str = "DnsDone";
pub const CONNECT_START: &str = "ConnectStart";
pub const CONNECT_DONE: &str = "ConnectDone";
pub const GET_CONN: &str = "GetConn";
pub const GOT_CONN: &str = "GotConn";
pub const TLS_HANDSHAKE_START: &str = "TLSHandshakeStart";
pub const TLS_HANDSHAKE_DONE: &str = "TLSHandshakeDone";
pub const WROTE_HEADERS: &str = "WroteHeaders";
pub const WROTE_REQUEST: &str = "WroteRequest";
pub const GOT_FIRST_RESPONSE_BYTE: &str = "GotFirstResponseByte";
pub const PUT_IDLE_CONN: &str = "PutIdleConn";

/// One timestamped connection-level event observed during a call.
#[derive(Clone, Debug)]
pub struct TimelineEvent {
    pub name: &'static str,
    pub at: SystemTime,
    pub since_call_start: Duration,
}

/// Collects the connection-event timeline of a single call when tracing is
/// enabled at the server or API level. Disabled timelines ignore every
/// record, so the command can thread one through unconditionally.
#[derive(Debug)]
pub struct CallTimeline {
    enabled: bool,
    started_wall: SystemTime,
    started: Instant,
    events: Mutex<Vec<TimelineEvent>>,
}

impl CallTimeline {
    pub fn enabled() -> Self {
        Self::with_enabled(true)
    }

    pub fn disabled() -> Self {
        Self::with_enabled(false)
    }

    fn with_enabled(enabled: bool) -> Self {
        Self {
            enabled,
            started_wall: SystemTime::now(),
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, name: &'static str) {
        if !self.enabled {
            return;
        }
        let since_call_start = self.started.elapsed();
        lock_unpoisoned(&self.events).push(TimelineEvent {
            name,
            at: self.started_wall + since_call_start,
            since_call_start,
        });
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        lock_unpoisoned(&self.events).clone()
    }

    /// Deterministic text form: events sorted by timestamp, each rendered as
    /// `name: duration-since-call-start (at HH:MM:SS.mmm)`, joined by ` => `.
    pub fn render(&self) -> String {
        let mut events = self.events();
        events.sort_by_key(|event| event.at);

        let parts: Vec<String> = events
            .iter()
            .map(|event| {
                let local_time = chrono::DateTime::<chrono::Local>::from(event.at);
                format!(
                    "{}: {:?} (at {})",
                    event.name,
                    event.since_call_start,
                    local_time.format("%H:%M:%S%.3f")
                )
            })
            .collect();
        parts.join(" => ")
    }
}

impl std::fmt::Display for CallTimeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.render())
    }
}

/// Process-wide consumer of completed call timelines. Invoked after each
/// traced call with the request, the final URL, and the collected events; a
/// panicking sink never affects the call result.
pub trait TimelineSink: Send + Sync {
    fn publish(&self, request: &ApiRequest, final_url: &str, timeline: &CallTimeline);
}
