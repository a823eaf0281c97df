//! Request dispatcher - the orchestrator of the dispatch layer
//!
//! `dispatch()` resolves the route for a request, gates it on the route's
//! circuit breaker, serves cacheable hits, runs the handler through the
//! retry executor, and keeps every registry's statistics current. One
//! dispatcher instance is constructed at process start and passed by
//! handle to all consumers; there is no hidden global.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreakerRegistry;
use crate::cache::{Cache, CacheLevel, CacheStore, SharedCache};
use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::events::{DispatchEventKind, EventBus};
use crate::metrics::{MetricsSink, SharedMetrics, TracingMetrics};
use crate::registry::{HandlerRegistry, RequestHandler, RouteConfig, RouteSample};
use crate::request::DispatchRequest;
use crate::retry::RetryPolicy;

/// Successful dispatch result
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub request_id: Uuid,
    pub route_key: String,
    pub handler_name: String,
    pub value: Value,
    /// Whether the value came from the cache without a handler call
    pub from_cache: bool,
    pub duration_ms: u64,
}

/// Aggregate routing statistics snapshot.
///
/// Terminal failures of every kind (route not found, circuit open, retries
/// exhausted) count toward `total_processed` and `error_rate`; cache hits
/// count as successful traffic.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RoutingStats {
    pub total_processed: u64,
    pub total_errors: u64,
    pub by_type: HashMap<String, u64>,
    pub by_modality: HashMap<String, u64>,
    pub by_priority: HashMap<String, u64>,
    pub average_processing_time_ms: f64,
    pub error_rate: f64,
    /// Relative share of completed calls per handler
    pub handler_load: HashMap<String, f64>,
    /// Open/closed state per tracked route
    pub circuit_open: HashMap<String, bool>,
}

#[derive(Default)]
struct StatsInner {
    total_processed: u64,
    total_errors: u64,
    total_duration_ms: u64,
    by_type: HashMap<String, u64>,
    by_modality: HashMap<String, u64>,
    by_priority: HashMap<String, u64>,
}

impl StatsInner {
    fn record(&mut self, request: &DispatchRequest, duration_ms: u64, success: bool) {
        self.total_processed += 1;
        if !success {
            self.total_errors += 1;
        }
        self.total_duration_ms += duration_ms;
        *self.by_type.entry(request.request_type.clone()).or_default() += 1;
        *self
            .by_modality
            .entry(request.modality.as_str().to_string())
            .or_default() += 1;
        *self
            .by_priority
            .entry(request.priority.as_str().to_string())
            .or_default() += 1;
    }
}

/// The multimodal request dispatcher
pub struct RequestDispatcher {
    config: DispatchConfig,
    registry: Arc<HandlerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: SharedCache,
    retry: RetryPolicy,
    stats: Mutex<StatsInner>,
    events: EventBus,
    metrics: SharedMetrics,
    shutting_down: AtomicBool,
}

impl RequestDispatcher {
    /// Create a dispatcher with the given configuration and default wiring
    pub fn new(config: DispatchConfig) -> Self {
        RequestDispatcherBuilder::new().config(config).build()
    }

    /// Register a route and its handler; idempotent per route key
    pub fn register_route(&self, config: RouteConfig, handler: Arc<dyn RequestHandler>) {
        self.registry.register(config, handler);
    }

    /// Dispatch a request to its registered handler.
    ///
    /// See the module docs for the full pipeline. The final error of an
    /// exhausted retry loop is propagated verbatim; cache failures are
    /// logged and never surfaced.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let started = Instant::now();
        let route_key = request.route_key();
        let labels = [
            ("type", request.request_type.as_str()),
            ("modality", request.modality.as_str()),
        ];
        self.metrics.incr_counter("request_received", &labels);

        let Some((config, handler)) = self.registry.resolve(&route_key) else {
            self.metrics.incr_counter("error", &labels);
            self.record_routing(&request, started, false);
            return Err(Error::RouteNotFound(route_key));
        };
        // Once the route is resolved every emission carries the handler label
        let route_labels = [
            ("type", request.request_type.as_str()),
            ("modality", request.modality.as_str()),
            ("handler", config.handler_name.as_str()),
        ];

        // Fail fast while the circuit is open and cooling down; the
        // half-open trial slot is only consumed after a cache miss.
        if let Err(err) = self.breakers.reject_if_open(&route_key) {
            self.metrics.incr_counter("circuit_breaker_open", &route_labels);
            self.record_routing(&request, started, false);
            return Err(err);
        }

        if config.cacheable {
            let cache_key = request.cache_key();
            if let Some(value) = self.cache.get(&cache_key) {
                debug!(route = %route_key, "Cache hit, skipping handler");
                self.metrics.incr_counter("request_success", &route_labels);
                self.record_routing(&request, started, true);
                return Ok(DispatchOutcome {
                    request_id: request.id,
                    route_key,
                    handler_name: config.handler_name.clone(),
                    value,
                    from_cache: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        // Consume the half-open trial slot if the cooldown has elapsed
        if let Err(err) = self.breakers.check(&route_key) {
            self.metrics.incr_counter("circuit_breaker_open", &route_labels);
            self.record_routing(&request, started, false);
            return Err(err);
        }

        let (handler_name, handler) = self.select_handler(&request, &config, handler);
        let was_open = self.breakers.is_open(&route_key);

        self.registry.record_start(&handler_name);

        let timeout = Duration::from_millis(config.timeout_ms);
        let request_ref = &request;
        let handler_for_retry = handler.clone();
        let name_for_retry = handler_name.clone();
        let result = self
            .retry
            .execute(
                move |_attempt| {
                    let handler = handler_for_retry.clone();
                    let name = name_for_retry.clone();
                    async move {
                        handler.handle(request_ref).await.map_err(|err| match err {
                            err @ (Error::Timeout(_) | Error::Handler { .. }) => err,
                            other => Error::Handler {
                                handler: name,
                                message: other.to_string(),
                            },
                        })
                    }
                },
                timeout,
                config.max_retries,
            )
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let success = result.is_ok();
        // The selected handler may differ from the route's when an
        // enrichment override applied
        let handler_labels = [
            ("type", request.request_type.as_str()),
            ("modality", request.modality.as_str()),
            ("handler", handler_name.as_str()),
        ];

        self.registry
            .record_completion(&handler_name, duration_ms, success);
        self.registry.record_sample(
            &route_key,
            RouteSample {
                timestamp: Utc::now(),
                request_type: request.request_type.clone(),
                duration_ms,
                success,
            },
        );
        self.record_routing(&request, started, success);

        match result {
            Ok(value) => {
                self.breakers.record_success(&route_key);
                if was_open {
                    self.events.publish(DispatchEventKind::CircuitClosed {
                        route_key: route_key.clone(),
                    });
                }
                self.metrics.incr_counter("request_success", &handler_labels);
                self.metrics
                    .observe_ms("processing_time", &handler_labels, duration_ms);

                if config.cacheable {
                    self.store_in_cache(&request, &config, &value);
                }

                Ok(DispatchOutcome {
                    request_id: request.id,
                    route_key,
                    handler_name,
                    value,
                    from_cache: false,
                    duration_ms,
                })
            }
            Err(err) => {
                self.breakers.record_failure(
                    &route_key,
                    config.circuit_failure_threshold,
                    config.circuit_reset_ms.map(Duration::from_millis),
                );
                if !was_open && self.breakers.is_open(&route_key) {
                    self.events.publish(DispatchEventKind::CircuitOpened {
                        route_key: route_key.clone(),
                    });
                }
                self.metrics.incr_counter("error", &handler_labels);
                Err(err)
            }
        }
    }

    /// Point-in-time statistics snapshot; always returns an owned copy
    pub fn stats(&self) -> RoutingStats {
        let inner = match self.stats.lock() {
            Ok(inner) => inner,
            Err(_) => return RoutingStats::default(),
        };
        let average = if inner.total_processed == 0 {
            0.0
        } else {
            inner.total_duration_ms as f64 / inner.total_processed as f64
        };
        let error_rate = if inner.total_processed == 0 {
            0.0
        } else {
            inner.total_errors as f64 / inner.total_processed as f64
        };
        RoutingStats {
            total_processed: inner.total_processed,
            total_errors: inner.total_errors,
            by_type: inner.by_type.clone(),
            by_modality: inner.by_modality.clone(),
            by_priority: inner.by_priority.clone(),
            average_processing_time_ms: average,
            error_rate,
            handler_load: self.registry.load_share(),
            circuit_open: self.breakers.open_map(),
        }
    }

    /// Stop accepting new dispatches; in-flight calls complete
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            self.events.publish(DispatchEventKind::ShutdownStarted);
        }
    }

    /// Whether `shutdown` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Apply the enrichment step's handler override when one is registered
    /// under that name; otherwise keep the route's own handler.
    fn select_handler(
        &self,
        request: &DispatchRequest,
        config: &RouteConfig,
        route_handler: Arc<dyn RequestHandler>,
    ) -> (String, Arc<dyn RequestHandler>) {
        if let Some(name) = &request.handler_override {
            if let Some(handler) = self.registry.resolve_by_handler_name(name) {
                debug!(handler = %name, "Using enrichment handler override");
                return (name.clone(), handler);
            }
            warn!(
                handler = %name,
                "Handler override not registered, using route handler"
            );
        }
        (config.handler_name.clone(), route_handler)
    }

    fn store_in_cache(&self, request: &DispatchRequest, config: &RouteConfig, value: &Value) {
        let ttl = config
            .cache_ttl_ms
            .or(self.config.cache.default_ttl_ms)
            .map(Duration::from_millis);
        if let Err(err) =
            self.cache
                .set(request.cache_key(), value.clone(), ttl, CacheLevel::Memory)
        {
            // Cache is best-effort: log and move on
            warn!(error = %err, "Failed to cache dispatch result");
        }
    }

    fn record_routing(&self, request: &DispatchRequest, started: Instant, success: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(request, started.elapsed().as_millis() as u64, success);
        }
    }
}

/// Builder wiring a dispatcher's collaborators
pub struct RequestDispatcherBuilder {
    config: DispatchConfig,
    cache: Option<SharedCache>,
    metrics: Option<SharedMetrics>,
    event_capacity: usize,
}

impl Default for RequestDispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
            cache: None,
            metrics: None,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an externally owned cache (any [`Cache`] implementation)
    pub fn cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> RequestDispatcher {
        let init_started = Instant::now();
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(CacheStore::from_config(&self.config.cache)));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(TracingMetrics));
        let dispatcher = RequestDispatcher {
            retry: RetryPolicy::from_config(&self.config.retry),
            breakers: Arc::new(CircuitBreakerRegistry::new(Duration::from_millis(
                self.config.breaker.reset_ms,
            ))),
            registry: Arc::new(HandlerRegistry::new()),
            cache,
            stats: Mutex::new(StatsInner::default()),
            events: EventBus::new(self.event_capacity),
            metrics,
            shutting_down: AtomicBool::new(false),
            config: self.config,
        };
        dispatcher.metrics.observe_ms(
            "init_time",
            &[],
            init_started.elapsed().as_millis() as u64,
        );
        dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetrics;
    use crate::registry::FnHandler;
    use crate::request::{Modality, Priority};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Sink that keeps every emission with its labels for assertions
    #[derive(Default)]
    struct RecordingSink {
        emissions: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl MetricsSink for RecordingSink {
        fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
            if let Ok(mut emissions) = self.emissions.lock() {
                emissions.push((
                    name.to_string(),
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ));
            }
        }

        fn observe_ms(&self, name: &str, labels: &[(&str, &str)], _value_ms: u64) {
            self.incr_counter(name, labels);
        }
    }

    /// Config with fast backoff so retry tests stay quick
    fn test_config() -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.retry.base_backoff_ms = 1;
        config.retry.max_jitter_ms = 1;
        config
    }

    fn echo_route(cacheable: bool) -> RouteConfig {
        let config = RouteConfig::new("translate", Modality::Text, "translator")
            .with_timeout_ms(200)
            .with_max_retries(0);
        if cacheable {
            config.with_cacheable(None)
        } else {
            config
        }
    }

    fn echo_handler() -> Arc<dyn RequestHandler> {
        Arc::new(FnHandler::new(|req: DispatchRequest| async move {
            Ok(json!({ "echo": req.payload }))
        }))
    }

    #[tokio::test]
    async fn test_route_not_found() {
        let dispatcher = RequestDispatcher::new(test_config());
        let result = dispatcher
            .dispatch(DispatchRequest::new("translate", Modality::Text))
            .await;
        assert!(matches!(result, Err(Error::RouteNotFound(key)) if key == "translate:text"));

        let stats = dispatcher.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_errors, 1);
    }

    #[tokio::test]
    async fn test_successful_dispatch_updates_stats() {
        let dispatcher = RequestDispatcher::new(test_config());
        dispatcher.register_route(echo_route(false), echo_handler());

        let request = DispatchRequest::new("translate", Modality::Text)
            .with_payload(json!({"gloss": "HELLO"}))
            .with_priority(Priority::High);
        let outcome = dispatcher.dispatch(request).await.unwrap();

        assert!(!outcome.from_cache);
        assert_eq!(outcome.handler_name, "translator");
        assert_eq!(outcome.value, json!({"echo": {"gloss": "HELLO"}}));

        let stats = dispatcher.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.by_type["translate"], 1);
        assert_eq!(stats.by_modality["text"], 1);
        assert_eq!(stats.by_priority["high"], 1);
        assert!((stats.error_rate - 0.0).abs() < f64::EPSILON);

        let handler_stats = dispatcher.registry().handler_stats();
        assert_eq!(handler_stats["translator"].calls, 1);
        assert_eq!(handler_stats["translator"].active_requests, 0);
    }

    #[tokio::test]
    async fn test_cacheable_route_serves_second_call_from_cache() {
        let dispatcher = RequestDispatcher::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();
        dispatcher.register_route(
            echo_route(true),
            Arc::new(FnHandler::new(move |_req| {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("translated"))
                }
            })),
        );

        let request = DispatchRequest::new("translate", Modality::Text)
            .with_payload(json!({"gloss": "HELLO"}));

        let first = dispatcher.dispatch(request.clone()).await.unwrap();
        assert!(!first.from_cache);

        let second = dispatcher.dispatch(request).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.value, json!("translated"));

        // Handler ran once; the cache served the second call
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let handler_stats = dispatcher.registry().handler_stats();
        assert_eq!(handler_stats["translator"].calls, 1);
        assert_eq!(dispatcher.cache().stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_then_surfaces_timeout() {
        let dispatcher = RequestDispatcher::new(test_config());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_ref = attempts.clone();
        dispatcher.register_route(
            RouteConfig::new("translate", Modality::Text, "translator")
                .with_timeout_ms(30)
                .with_max_retries(2),
            Arc::new(FnHandler::new(move |_req| {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(json!(null))
                }
            })),
        );

        let result = dispatcher
            .dispatch(DispatchRequest::new("translate", Modality::Text))
            .await;

        // 1 initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(Error::Timeout(30))));

        // One logical call, one error
        let handler_stats = dispatcher.registry().handler_stats();
        assert_eq!(handler_stats["translator"].calls, 1);
        assert_eq!(handler_stats["translator"].errors, 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_rejects_without_handler_call() {
        let dispatcher = RequestDispatcher::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();
        dispatcher.register_route(
            RouteConfig::new("translate", Modality::Text, "translator")
                .with_timeout_ms(100)
                .with_max_retries(0)
                .with_circuit_breaker(2, Some(60_000)),
            Arc::new(FnHandler::new(move |_req| {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Value, _>(Error::Handler {
                        handler: "translator".into(),
                        message: "model unavailable".into(),
                    })
                }
            })),
        );

        let request = DispatchRequest::new("translate", Modality::Text);
        assert!(dispatcher.dispatch(request.clone()).await.is_err());
        assert!(dispatcher.dispatch(request.clone()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Third dispatch is shed by the breaker: no handler invocation,
        // handler counters unchanged
        let result = dispatcher.dispatch(request).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let handler_stats = dispatcher.registry().handler_stats();
        assert_eq!(handler_stats["translator"].calls, 2);
        assert_eq!(handler_stats["translator"].active_requests, 0);
        assert!(dispatcher.stats().circuit_open["translate:text"]);
    }

    #[tokio::test]
    async fn test_half_open_trial_recovers_route() {
        let dispatcher = RequestDispatcher::new(test_config());
        let healthy = Arc::new(AtomicBool::new(false));
        let healthy_ref = healthy.clone();
        dispatcher.register_route(
            RouteConfig::new("translate", Modality::Text, "translator")
                .with_timeout_ms(100)
                .with_max_retries(0)
                .with_circuit_breaker(1, Some(50)),
            Arc::new(FnHandler::new(move |_req| {
                let healthy = healthy_ref.clone();
                async move {
                    if healthy.load(Ordering::SeqCst) {
                        Ok(json!("ok"))
                    } else {
                        Err(Error::Handler {
                            handler: "translator".into(),
                            message: "down".into(),
                        })
                    }
                }
            })),
        );
        let mut events = dispatcher.events().subscribe();

        let request = DispatchRequest::new("translate", Modality::Text);
        assert!(dispatcher.dispatch(request.clone()).await.is_err());
        assert!(matches!(
            dispatcher.dispatch(request.clone()).await,
            Err(Error::CircuitOpen { .. })
        ));

        // Let the cooldown elapse, then recover
        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(70)).await;
        let outcome = dispatcher.dispatch(request.clone()).await.unwrap();
        assert_eq!(outcome.value, json!("ok"));

        let snapshot = dispatcher.breakers().snapshot("translate:text").unwrap();
        assert!(!snapshot.is_open);
        assert_eq!(snapshot.failure_count, 0);

        // CircuitOpened then CircuitClosed were published
        let first = events.recv().await.unwrap();
        assert!(matches!(first.kind, DispatchEventKind::CircuitOpened { .. }));
        let second = events.recv().await.unwrap();
        assert!(matches!(second.kind, DispatchEventKind::CircuitClosed { .. }));
    }

    #[tokio::test]
    async fn test_metric_emissions_carry_handler_label() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = RequestDispatcherBuilder::new()
            .config(test_config())
            .metrics(sink.clone())
            .build();
        dispatcher.register_route(echo_route(false), echo_handler());
        dispatcher
            .dispatch(DispatchRequest::new("translate", Modality::Text))
            .await
            .unwrap();

        let emissions = sink.emissions.lock().unwrap();
        let labels_of = |name: &str| {
            emissions
                .iter()
                .find(|(emitted, _)| emitted == name)
                .map(|(_, labels)| labels.clone())
                .unwrap_or_else(|| panic!("no {name} emission"))
        };

        // Received fires before route resolution, so no handler is known yet
        let received = labels_of("request_received");
        assert!(received.iter().any(|(key, _)| key == "type"));
        assert!(received.iter().all(|(key, _)| key != "handler"));

        for name in ["request_success", "processing_time"] {
            let labels = labels_of(name);
            assert!(labels.contains(&("type".to_string(), "translate".to_string())));
            assert!(labels.contains(&("modality".to_string(), "text".to_string())));
            assert!(labels.contains(&("handler".to_string(), "translator".to_string())));
        }
    }

    #[tokio::test]
    async fn test_error_metric_carries_handler_label() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = RequestDispatcherBuilder::new()
            .config(test_config())
            .metrics(sink.clone())
            .build();
        dispatcher.register_route(
            RouteConfig::new("translate", Modality::Text, "translator")
                .with_timeout_ms(100)
                .with_max_retries(0),
            Arc::new(FnHandler::new(|_req| async {
                Err::<Value, _>(Error::Handler {
                    handler: "translator".into(),
                    message: "model unavailable".into(),
                })
            })),
        );

        let result = dispatcher
            .dispatch(DispatchRequest::new("translate", Modality::Text))
            .await;
        assert!(result.is_err());

        let emissions = sink.emissions.lock().unwrap();
        let (_, labels) = emissions
            .iter()
            .find(|(name, _)| name == "error")
            .expect("no error emission");
        assert!(labels.contains(&("handler".to_string(), "translator".to_string())));
    }

    #[tokio::test]
    async fn test_stats_snapshot_is_idempotent() {
        let dispatcher = RequestDispatcher::new(test_config());
        dispatcher.register_route(echo_route(false), echo_handler());
        dispatcher
            .dispatch(DispatchRequest::new("translate", Modality::Text))
            .await
            .unwrap();

        let first = dispatcher.stats();
        let second = dispatcher.stats();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_handler_override_selects_registered_handler() {
        let dispatcher = RequestDispatcher::new(test_config());
        dispatcher.register_route(echo_route(false), echo_handler());
        dispatcher.register_route(
            RouteConfig::new("translate", Modality::Video, "sign-avatar")
                .with_timeout_ms(200),
            Arc::new(FnHandler::new(|_req| async { Ok(json!("avatar")) })),
        );

        let request = DispatchRequest::new("translate", Modality::Text)
            .with_handler_override("sign-avatar");
        let outcome = dispatcher.dispatch(request).await.unwrap();
        assert_eq!(outcome.handler_name, "sign-avatar");
        assert_eq!(outcome.value, json!("avatar"));

        // Unknown override falls back to the route handler
        let request = DispatchRequest::new("translate", Modality::Text)
            .with_handler_override("nonexistent");
        let outcome = dispatcher.dispatch(request).await.unwrap();
        assert_eq!(outcome.handler_name, "translator");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_dispatches() {
        let dispatcher = RequestDispatcher::new(test_config());
        dispatcher.register_route(echo_route(false), echo_handler());
        let mut events = dispatcher.events().subscribe();

        dispatcher.shutdown();
        assert!(dispatcher.is_shutting_down());

        let result = dispatcher
            .dispatch(DispatchRequest::new("translate", Modality::Text))
            .await;
        assert!(matches!(result, Err(Error::ShuttingDown)));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, DispatchEventKind::ShutdownStarted);
    }

    #[tokio::test]
    async fn test_concurrent_dispatches() {
        // A silent sink keeps the 32-task output free of metric logs
        let dispatcher = Arc::new(
            RequestDispatcherBuilder::new()
                .config(test_config())
                .metrics(Arc::new(NullMetrics))
                .build(),
        );
        dispatcher.register_route(echo_route(false), echo_handler());

        let mut tasks = Vec::new();
        for i in 0..32 {
            let dispatcher = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .dispatch(
                        DispatchRequest::new("translate", Modality::Text)
                            .with_payload(json!({ "n": i })),
                    )
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.total_processed, 32);
        assert_eq!(stats.total_errors, 0);
        let handler_stats = dispatcher.registry().handler_stats();
        assert_eq!(handler_stats["translator"].calls, 32);
        assert_eq!(handler_stats["translator"].active_requests, 0);
    }
}
