use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::core::command::{Command, HttpCommand};
use crate::core::config::{Api, Config, ConfigError, ResolvedConfig, Server};
use crate::core::error::HttpError;
use crate::core::metrics::MetricsSink;
use crate::core::request::{ApiRequest, ApiResponse, CallScope};
use crate::core::resilience::ResilientCommand;
use crate::core::tracking::{TimelineSink, TraceContextInjector};

/// Short-circuits a call before any request construction. Returning
/// `Some(outcome)` stops the call and surfaces that outcome verbatim.
pub trait PreRequestInterceptor: Send + Sync {
    fn intercept(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
    ) -> Option<Result<ApiResponse, HttpError>>;
}

/// Context-wide collaborators and toggles, fixed at setup. The pre-request
/// interceptor table is the one mutable piece; it supports concurrent
/// register/unregister from any thread.
#[derive(Default)]
pub struct Options {
    pub metrics_sink: Option<Arc<dyn MetricsSink>>,
    pub timeline_sink: Option<Arc<dyn TimelineSink>>,
    pub trace_injector: Option<Arc<dyn TraceContextInjector>>,
    pub log_request_response_bodies: bool,
    pub enable_pre_request_interceptors: bool,
    pre_request_interceptors: RwLock<HashMap<String, Arc<dyn PreRequestInterceptor>>>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn with_timeline_sink(mut self, sink: Arc<dyn TimelineSink>) -> Self {
        self.timeline_sink = Some(sink);
        self
    }

    pub fn with_trace_injector(mut self, injector: Arc<dyn TraceContextInjector>) -> Self {
        self.trace_injector = Some(injector);
        self
    }

    pub fn with_request_response_body_logging(mut self, enabled: bool) -> Self {
        self.log_request_response_bodies = enabled;
        self
    }

    pub fn with_pre_request_interceptors(mut self, enabled: bool) -> Self {
        self.enable_pre_request_interceptors = enabled;
        self
    }

    pub fn register_pre_request_interceptor(
        &self,
        id: impl Into<String>,
        interceptor: Arc<dyn PreRequestInterceptor>,
    ) {
        let mut table = self
            .pre_request_interceptors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        table.insert(id.into(), interceptor);
    }

    pub fn unregister_pre_request_interceptor(&self, id: &str) {
        let mut table = self
            .pre_request_interceptors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        table.remove(id);
    }

    pub(crate) fn run_pre_request_interceptors(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
    ) -> Option<Result<ApiResponse, HttpError>> {
        if !self.enable_pre_request_interceptors {
            return None;
        }
        let table = self
            .pre_request_interceptors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for interceptor in table.values() {
            if let Some(outcome) = interceptor.intercept(scope, request) {
                return Some(outcome);
            }
        }
        None
    }
}

/// The opaque execution context: one command per configured API, built at
/// setup, dispatched by the API name carried inside each request. Safe to
/// share across tasks; the command table only changes through
/// [`HttpContext::reload_api`], which swaps atomically.
pub struct HttpContext {
    config: ResolvedConfig,
    options: Arc<Options>,
    commands: RwLock<HashMap<String, Arc<dyn Command>>>,
    timeouts: HashMap<String, Duration>,
}

impl std::fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpContext {
    /// Builds a context from an already-resolved configuration.
    pub fn new(config: ResolvedConfig, options: Options) -> Result<Self, ConfigError> {
        let options = Arc::new(options);
        let mut commands: HashMap<String, Arc<dyn Command>> = HashMap::new();
        let mut timeouts = HashMap::new();

        for (api_name, api) in &config.apis {
            let server = config
                .find_server(&api.server)
                .ok_or_else(|| ConfigError::ServerNotFound {
                    api: api_name.clone(),
                    server: api.server.clone(),
                })?;
            let command = build_command(server, api, &options)?;
            commands.insert(api_name.clone(), command);
            timeouts.insert(api_name.clone(), api.timeout());
            debug!(api = %api_name, server = %api.server, "registered http command");
        }

        Ok(Self {
            config,
            options,
            commands: RwLock::new(commands),
            timeouts,
        })
    }

    /// Resolves a raw configuration document and builds a context from it.
    pub fn from_config(config: &Config, options: Options) -> Result<Self, ConfigError> {
        Self::new(config.resolve()?, options)
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Executes the named API with an empty call scope.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, HttpError> {
        self.execute_with_scope(&CallScope::new(), request).await
    }

    /// Executes the named API under a fresh deadline of the API's configured
    /// timeout. Every call yields either a response or an [`HttpError`],
    /// never neither.
    pub async fn execute_with_scope(
        &self,
        scope: &CallScope,
        request: &ApiRequest,
    ) -> Result<ApiResponse, HttpError> {
        let api_name = request.api();
        let command = {
            let commands = self
                .commands
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            commands.get(api_name).cloned()
        };
        let Some(command) = command else {
            return Err(HttpError::command_not_found(api_name));
        };

        let timeout = self
            .timeouts
            .get(api_name)
            .copied()
            .unwrap_or(Duration::from_millis(100));
        let deadline = Instant::now() + timeout;

        command.execute(scope, request, deadline).await
    }

    /// Runs the call on a background task and hands back the eventual
    /// outcome. Must be called from within a tokio runtime.
    pub fn execute_async(
        self: &Arc<Self>,
        scope: CallScope,
        request: ApiRequest,
    ) -> oneshot::Receiver<Result<ApiResponse, HttpError>> {
        let (sender, receiver) = oneshot::channel();
        let context = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = context.execute_with_scope(&scope, &request).await;
            let _ = sender.send(outcome);
        });
        receiver
    }

    /// Rebuilds one API's command (fresh breaker, bulkhead and transport)
    /// and swaps it in atomically with respect to concurrent `execute`
    /// calls. In-flight calls keep the command they already dispatched on.
    pub fn reload_api(&self, api_name: &str) -> Result<(), ConfigError> {
        let api = self
            .config
            .apis
            .get(api_name)
            .ok_or_else(|| ConfigError::UnknownApi {
                api: api_name.to_owned(),
            })?;
        let server = self
            .config
            .find_server(&api.server)
            .ok_or_else(|| ConfigError::ServerNotFound {
                api: api_name.to_owned(),
                server: api.server.clone(),
            })?;
        let command = build_command(server, api, &self.options)?;

        let mut commands = self
            .commands
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        commands.insert(api_name.to_owned(), command);
        Ok(())
    }
}

fn build_command(
    server: &Server,
    api: &Api,
    options: &Arc<Options>,
) -> Result<Arc<dyn Command>, ConfigError> {
    let http_command = HttpCommand::new(server.clone(), api.clone(), Arc::clone(options))?;
    if api.disable_hystrix {
        Ok(Arc::new(http_command))
    } else {
        Ok(Arc::new(ResilientCommand::new(Box::new(http_command), api)))
    }
}
