//! Capability bridge.
//!
//! The only way code inside a sandbox affects the world outside it.  Every
//! instance gets its own [`CapabilityBridge`], bound to the instance's
//! descriptor.  Logging and metrics go to the descriptor's handlers, foreign
//! functions and upstreams are resolved through the descriptor's registry,
//! and outbound HTTP calls are queued on the request's [`Exchange`] and run
//! by the dispatcher once the current callback has returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use url::Url;

use crate::descriptor::PluginDescriptor;
use crate::error::Result;
use crate::logging::LogLevel;
use crate::machine::{Exchange, LocalResponse};
use crate::metrics::MetricKind;
use crate::transport::{CallOutcome, HttpCallRequest, HttpTransport};

/// An outbound call issued by a plugin and not yet performed.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Token handed back to the plugin; the response is delivered under it.
    pub token: u32,
    /// Upstream name as the plugin spelled it.
    pub upstream: String,
    /// Resolved upstream base URL.
    pub target: Url,
    pub request: HttpCallRequest,
}

/// Per-instance gateway to host capabilities.
///
/// Cheaply cloneable; clones share the token counter.
#[derive(Clone)]
pub struct CapabilityBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    descriptor: Arc<PluginDescriptor>,
    transport: Arc<dyn HttpTransport>,
    default_call_timeout: Duration,
    next_token: AtomicU32,
}

impl CapabilityBridge {
    pub fn new(
        descriptor: Arc<PluginDescriptor>,
        transport: Arc<dyn HttpTransport>,
        default_call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                descriptor,
                transport,
                default_call_timeout,
                next_token: AtomicU32::new(1),
            }),
        }
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.inner.descriptor
    }

    pub fn plugin_name(&self) -> &str {
        self.inner.descriptor.name()
    }

    /// Configuration payload the plugin was registered with.
    pub fn configuration(&self) -> &[u8] {
        self.inner.descriptor.configuration()
    }

    // -----------------------------------------------------------------------
    // Logging and metrics
    // -----------------------------------------------------------------------

    pub fn log(&self, level: LogLevel, message: &str) {
        if let Some(logger) = self.inner.descriptor.logger() {
            logger.log(level, message);
        }
    }

    /// Threshold of the configured logger.  Without a logger nothing is
    /// emitted, so the threshold is the highest level.
    pub fn log_level(&self) -> LogLevel {
        self.inner
            .descriptor
            .logger()
            .map_or(LogLevel::Critical, |logger| logger.level())
    }

    pub fn record_metric(&self, name: &str, kind: MetricKind, value: i64) {
        if let Some(metrics) = self.inner.descriptor.metrics() {
            metrics.record(name, kind, value);
        }
    }

    // -----------------------------------------------------------------------
    // Foreign functions
    // -----------------------------------------------------------------------

    /// Invoke a host function by name.
    pub fn call_foreign_function(&self, name: &str, input: &[u8]) -> Result<Vec<u8>> {
        let function = self.inner.descriptor.resolve_function(name)?;
        let output = function(input);
        tracing::trace!(
            plugin = self.plugin_name(),
            function = name,
            input_bytes = input.len(),
            output_bytes = output.len(),
            "foreign function called"
        );
        Ok(output)
    }

    // -----------------------------------------------------------------------
    // Outbound HTTP
    // -----------------------------------------------------------------------

    /// Queue an outbound call to a named upstream and return its token.
    ///
    /// Nothing is sent yet; the dispatcher performs the call with
    /// [`perform_call`](Self::perform_call) after the current callback
    /// returns.  A request without a timeout gets the host default.
    pub fn issue_http_call(
        &self,
        exchange: &mut Exchange,
        upstream: &str,
        mut request: HttpCallRequest,
    ) -> Result<u32> {
        let target = match self.inner.descriptor.resolve_upstream(upstream) {
            Ok(url) => url.clone(),
            Err(e) => {
                tracing::debug!(
                    plugin = self.plugin_name(),
                    upstream,
                    "http call to unregistered upstream"
                );
                return Err(e);
            }
        };

        if request.timeout.is_none_or(|t| t.is_zero()) {
            request.timeout = Some(self.inner.default_call_timeout);
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            plugin = self.plugin_name(),
            upstream,
            token,
            method = %request.method,
            path = %request.path,
            "http call issued"
        );

        exchange.push_pending(PendingCall {
            token,
            upstream: upstream.to_owned(),
            target,
            request,
        });
        Ok(token)
    }

    /// Run a queued call on the transport.  The returned future owns
    /// everything it needs, so dropping it cancels the call.
    pub fn perform_call(&self, call: PendingCall) -> BoxFuture<'static, (u32, CallOutcome)> {
        let transport = Arc::clone(&self.inner.transport);
        let plugin = self.plugin_name().to_owned();
        async move {
            let PendingCall {
                token,
                upstream,
                target,
                request,
            } = call;
            let outcome = transport.send(&target, request).await;
            if let Err(failure) = &outcome {
                tracing::warn!(
                    plugin = %plugin,
                    upstream = %upstream,
                    token,
                    error = %failure,
                    "http call failed"
                );
            }
            (token, outcome)
        }
        .boxed()
    }

    // -----------------------------------------------------------------------
    // Stream control
    // -----------------------------------------------------------------------

    /// Answer the request from the plugin.  The last response sent wins.
    pub fn send_local_response(&self, exchange: &mut Exchange, response: LocalResponse) {
        tracing::debug!(
            plugin = self.plugin_name(),
            context = exchange.context_id,
            status = response.status,
            "local response sent"
        );
        exchange.local_response = Some(response);
    }

    /// Continue a paused request.
    pub fn resume(&self, exchange: &mut Exchange) {
        exchange.resumed = true;
    }
}

impl std::fmt::Debug for CapabilityBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityBridge")
            .field("plugin", &self.plugin_name())
            .field("default_call_timeout", &self.inner.default_call_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{CapabilityKind, HostError};
    use crate::logging::LogHandler;
    use crate::machine::RequestHead;
    use crate::metrics::{MetricValue, SimpleMetricsHandler};
    use crate::module::{ModuleSource, ModuleStore};
    use crate::transport::{CallFailure, CallFailureKind, HttpCallResponse};

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl LogHandler for RecordingLogger {
        fn level(&self) -> LogLevel {
            LogLevel::Info
        }

        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_owned()));
        }
    }

    /// Echoes the request path back as the body.
    struct EchoTransport;

    #[async_trait]
    impl HttpTransport for EchoTransport {
        async fn send(&self, upstream: &Url, request: HttpCallRequest) -> CallOutcome {
            if upstream.port() == Some(1) {
                return Err(CallFailure::new(CallFailureKind::Connect, "refused"));
            }
            Ok(HttpCallResponse::new(200).with_body(request.url_for(upstream).path().to_owned()))
        }
    }

    fn bridge_with(
        configure: impl FnOnce(
            crate::descriptor::PluginDescriptorBuilder,
        ) -> crate::descriptor::PluginDescriptorBuilder,
    ) -> CapabilityBridge {
        let store = ModuleStore::with_defaults().unwrap();
        let module = store
            .load(ModuleSource::bytes(
                "empty",
                vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00],
            ))
            .unwrap();
        let descriptor = configure(
            PluginDescriptor::builder()
                .with_name("bridgeTests")
                .with_module(module),
        )
        .build()
        .unwrap();
        CapabilityBridge::new(
            Arc::new(descriptor),
            Arc::new(EchoTransport),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn log_without_logger_is_a_no_op() {
        let bridge = bridge_with(|b| b);
        bridge.log(LogLevel::Error, "nobody listens");
        assert_eq!(bridge.log_level(), LogLevel::Critical);
    }

    #[test]
    fn log_forwards_to_logger() {
        let logger = Arc::new(RecordingLogger::default());
        let bridge = bridge_with(|b| b.with_logger(logger.clone()));
        bridge.log(LogLevel::Warn, "hello");
        assert_eq!(bridge.log_level(), LogLevel::Info);
        assert_eq!(
            *logger.lines.lock().unwrap(),
            vec![(LogLevel::Warn, "hello".to_string())]
        );
    }

    #[test]
    fn metrics_forward_to_sink() {
        let sink = SimpleMetricsHandler::new();
        let bridge = bridge_with(|b| b.with_metrics_handler(Arc::new(sink.clone())));
        bridge.record_metric("hits", MetricKind::Counter, 2);
        bridge.record_metric("hits", MetricKind::Counter, 3);
        assert_eq!(sink.get("hits"), Some(MetricValue::Counter(5)));
    }

    #[test]
    fn foreign_function_round_trip() {
        let bridge = bridge_with(|b| {
            b.with_foreign_function("reverse", |data: &[u8]| data.iter().rev().copied().collect())
        });
        assert_eq!(
            bridge.call_foreign_function("reverse", &[1, 2, 3]).unwrap(),
            vec![3, 2, 1]
        );
        assert!(matches!(
            bridge.call_foreign_function("missing", &[]),
            Err(HostError::NotFound {
                kind: CapabilityKind::ForeignFunction,
                ..
            })
        ));
    }

    #[test]
    fn issue_http_call_queues_with_unique_tokens() {
        let bridge = bridge_with(|b| b.with_upstream("web_service", "http://localhost:8081"));
        let mut exchange = Exchange::new(RequestHead::new("GET", "/"), Vec::new());

        let t1 = bridge
            .issue_http_call(&mut exchange, "web_service", HttpCallRequest::get("/ok"))
            .unwrap();
        let t2 = bridge
            .issue_http_call(
                &mut exchange,
                "web_service",
                HttpCallRequest::get("/other").with_timeout(Duration::from_millis(50)),
            )
            .unwrap();
        assert_ne!(t1, t2);

        let pending = exchange.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].token, t1);
        assert_eq!(pending[0].request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(pending[1].request.timeout, Some(Duration::from_millis(50)));
        assert_eq!(exchange.pending_len(), 0);
    }

    #[test]
    fn unregistered_upstream_is_not_found_and_queues_nothing() {
        let bridge = bridge_with(|b| b);
        let mut exchange = Exchange::default();
        let result = bridge.issue_http_call(&mut exchange, "limitador", HttpCallRequest::get("/"));
        assert!(matches!(
            result,
            Err(HostError::NotFound {
                kind: CapabilityKind::Upstream,
                ..
            })
        ));
        assert_eq!(exchange.pending_len(), 0);
    }

    #[tokio::test]
    async fn perform_call_returns_outcome_under_its_token() {
        let bridge = bridge_with(|b| {
            b.with_upstream("web_service", "http://localhost:8081/api")
                .with_upstream("down", "http://localhost:1")
        });
        let mut exchange = Exchange::default();
        let ok = bridge
            .issue_http_call(&mut exchange, "web_service", HttpCallRequest::get("/ok"))
            .unwrap();
        let failed = bridge
            .issue_http_call(&mut exchange, "down", HttpCallRequest::get("/"))
            .unwrap();

        let mut pending = exchange.take_pending().into_iter();
        let (token, outcome) = bridge.perform_call(pending.next().unwrap()).await;
        assert_eq!(token, ok);
        assert_eq!(outcome.unwrap().body, b"/api/ok");

        let (token, outcome) = bridge.perform_call(pending.next().unwrap()).await;
        assert_eq!(token, failed);
        assert_eq!(outcome.unwrap_err().kind, CallFailureKind::Connect);
    }

    #[test]
    fn local_response_and_resume_update_exchange() {
        let bridge = bridge_with(|b| b);
        let mut exchange = Exchange::default();
        bridge.send_local_response(&mut exchange, LocalResponse::new(403));
        bridge.send_local_response(&mut exchange, LocalResponse::new(429));
        bridge.resume(&mut exchange);
        assert_eq!(exchange.local_response.map(|r| r.status), Some(429));
        assert!(exchange.resumed);
    }
}
