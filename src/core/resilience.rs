use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::core::command::Command;
use crate::core::config::Api;
use crate::core::error::{ErrorCode, HttpError};
use crate::core::request::{ApiRequest, ApiResponse, CallScope};
use crate::core::util::lock_unpoisoned;

/// Per-API resilience parameters, derived from the API configuration. The
/// window and cool-down values follow the conventional circuit defaults the
/// upstream services in this family of systems are tuned against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResiliencePolicy {
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub error_percent_threshold: u32,
    pub request_volume_threshold: u32,
    pub rolling_window: Duration,
    pub sleep_window: Duration,
}

impl ResiliencePolicy {
    pub fn for_api(api: &Api) -> Self {
        Self {
            timeout: api.resilience_timeout(),
            max_concurrency: api.concurrency,
            error_percent_threshold: 25,
            request_volume_threshold: 20,
            rolling_window: Duration::from_secs(10),
            sleep_window: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitAttemptKind {
    Closed,
    HalfOpen,
}

#[derive(Debug)]
enum CircuitState {
    Closed {
        window_started_at: Instant,
        successes: u32,
        failures: u32,
    },
    Open {
        opened_at: Instant,
    },
    HalfOpen,
}

impl CircuitState {
    fn closed_now() -> Self {
        Self::Closed {
            window_started_at: Instant::now(),
            successes: 0,
            failures: 0,
        }
    }
}

/// Three-state failure-rate trip switch. Closed counts outcomes over a
/// rolling window and opens once the failure rate reaches the threshold over
/// a sufficient sample; Open rejects immediately until the sleep window
/// passes; Half-Open admits one probe whose outcome decides the next state.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    policy: ResiliencePolicy,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub(crate) fn new(policy: ResiliencePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(CircuitState::closed_now()),
        }
    }

    pub(crate) fn begin(self: &Arc<Self>) -> Option<CircuitAttempt> {
        let mut state = lock_unpoisoned(&self.state);
        match &mut *state {
            CircuitState::Closed { .. } => Some(CircuitAttempt {
                breaker: Arc::clone(self),
                kind: CircuitAttemptKind::Closed,
                completed: false,
            }),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() < self.policy.sleep_window {
                    return None;
                }
                *state = CircuitState::HalfOpen;
                Some(CircuitAttempt {
                    breaker: Arc::clone(self),
                    kind: CircuitAttemptKind::HalfOpen,
                    completed: false,
                })
            }
            // A probe is already in flight; keep rejecting until it settles.
            CircuitState::HalfOpen => None,
        }
    }

    fn record_success(&self, kind: CircuitAttemptKind) {
        let mut state = lock_unpoisoned(&self.state);
        match (&mut *state, kind) {
            (
                CircuitState::Closed {
                    window_started_at,
                    successes,
                    failures,
                },
                CircuitAttemptKind::Closed,
            ) => {
                refresh_window(self.policy.rolling_window, window_started_at, successes, failures);
                *successes = successes.saturating_add(1);
            }
            (CircuitState::HalfOpen, CircuitAttemptKind::HalfOpen) => {
                *state = CircuitState::closed_now();
            }
            _ => {}
        }
    }

    fn record_failure(&self, kind: CircuitAttemptKind) {
        let mut state = lock_unpoisoned(&self.state);
        match (&mut *state, kind) {
            (
                CircuitState::Closed {
                    window_started_at,
                    successes,
                    failures,
                },
                CircuitAttemptKind::Closed,
            ) => {
                refresh_window(self.policy.rolling_window, window_started_at, successes, failures);
                *failures = failures.saturating_add(1);
                let total = successes.saturating_add(*failures);
                if total >= self.policy.request_volume_threshold
                    && *failures * 100 >= self.policy.error_percent_threshold * total
                {
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            (CircuitState::HalfOpen, CircuitAttemptKind::HalfOpen) => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
            _ => {}
        }
    }
}

fn refresh_window(
    rolling_window: Duration,
    window_started_at: &mut Instant,
    successes: &mut u32,
    failures: &mut u32,
) {
    if window_started_at.elapsed() >= rolling_window {
        *window_started_at = Instant::now();
        *successes = 0;
        *failures = 0;
    }
}

/// RAII handle for one admitted call. Dropping it without `mark_success`
/// records a failure, so every early-return path counts.
pub(crate) struct CircuitAttempt {
    breaker: Arc<CircuitBreaker>,
    kind: CircuitAttemptKind,
    completed: bool,
}

impl CircuitAttempt {
    pub(crate) fn mark_success(mut self) {
        self.breaker.record_success(self.kind);
        self.completed = true;
    }
}

impl Drop for CircuitAttempt {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.record_failure(self.kind);
            self.completed = true;
        }
    }
}

/// Wraps the transport command for APIs with resilience enabled: a
/// non-queuing bulkhead capped at the API's concurrency, the circuit
/// breaker, and an internal timeout sized for the full retry budget.
pub(crate) struct ResilientCommand {
    inner: Box<dyn Command>,
    api_name: String,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Arc<Semaphore>,
    timeout: Duration,
}

impl ResilientCommand {
    pub(crate) fn new(inner: Box<dyn Command>, api: &Api) -> Self {
        let policy = ResiliencePolicy::for_api(api);
        Self {
            inner,
            api_name: api.name.clone(),
            breaker: Arc::new(CircuitBreaker::new(policy)),
            bulkhead: Arc::new(Semaphore::new(policy.max_concurrency)),
            timeout: policy.timeout,
        }
    }
}

#[async_trait]
impl Command for ResilientCommand {
    async fn execute(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
        deadline: Instant,
    ) -> Result<ApiResponse, HttpError> {
        let Some(attempt) = self.breaker.begin() else {
            debug!(api = %self.api_name, "circuit open, rejecting call");
            return Err(HttpError::new(
                ErrorCode::CircuitOpen,
                400,
                "hystrix circuit open",
            ));
        };

        let _permit = match Arc::clone(&self.bulkhead).try_acquire_owned() {
            Ok(permit) => permit,
            // Admission is rejected, never queued, when the cap is saturated.
            Err(TryAcquireError::NoPermits) => {
                drop(attempt);
                return Err(HttpError::new(
                    ErrorCode::BulkheadRejected,
                    400,
                    "hystrix rejected",
                ));
            }
            Err(TryAcquireError::Closed) => {
                drop(attempt);
                return Err(HttpError::new(
                    ErrorCode::ResilienceUnknown,
                    400,
                    "hystrix unknown error",
                ));
            }
        };

        // A panicking command still releases its permit and counts as a
        // breaker failure instead of unwinding through the caller.
        let guarded_call =
            AssertUnwindSafe(self.inner.execute(scope, request, deadline)).catch_unwind();
        match tokio::time::timeout(self.timeout, guarded_call).await {
            Ok(Ok(Ok(response))) => {
                attempt.mark_success();
                Ok(response)
            }
            Ok(Ok(Err(inner_error))) => {
                drop(attempt);
                Err(inner_error)
            }
            Ok(Err(panic_payload)) => {
                drop(attempt);
                warn!(
                    api = %self.api_name,
                    panic = panic_text(panic_payload.as_ref()),
                    "command panicked during execution"
                );
                Err(HttpError::new(
                    ErrorCode::ResilienceUnknown,
                    400,
                    "hystrix unknown error",
                ))
            }
            Err(_elapsed) => {
                drop(attempt);
                Err(HttpError::new(
                    ErrorCode::ResilienceTimeout,
                    400,
                    "hystrix timeout",
                ))
            }
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "unknown panic payload"
    }
}
