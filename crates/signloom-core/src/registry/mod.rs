//! Route and handler registry with per-handler statistics
//!
//! Maps (request type, modality) route keys to a [`RouteConfig`] and a
//! registered [`RequestHandler`]. Also tracks:
//! - Per-handler call/error/latency/in-flight counters
//! - Per-route rolling sample windows for short-window trend analysis
//! - Processing-pipeline registrations per request type

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::request::{DispatchRequest, Modality, Priority, route_key};

/// Most recent samples kept per route window
pub const WINDOW_CAPACITY: usize = 1_000;
/// Samples considered for the short-window error-rate alert
const TREND_SAMPLE_SPAN: usize = 50;
/// Overall error rate that triggers a trend alert
const TREND_ERROR_THRESHOLD: f64 = 0.20;
/// Per-request-type error rate that triggers a trend alert
const TYPE_ERROR_THRESHOLD: f64 = 0.30;
/// Minimum samples before either alert can fire
const MIN_TREND_SAMPLES: usize = 5;

/// A registered route handler.
///
/// Feature modules (translation, expression generation, tutoring) implement
/// this seam; the dispatcher treats the output as opaque JSON.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &DispatchRequest) -> Result<Value>;
}

/// Adapter so plain async closures can be registered as handlers
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(DispatchRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, request: &DispatchRequest) -> Result<Value> {
        (self.0)(request.clone()).await
    }
}

/// Configuration for a single route; read-only after registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub request_type: String,
    pub modality: Modality,
    pub priority: Priority,
    pub handler_name: String,
    /// Budget for a single handler attempt, in milliseconds
    pub timeout_ms: u64,
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Consecutive failures before the circuit opens; `None` never opens
    pub circuit_failure_threshold: Option<u32>,
    /// Cooldown before a half-open trial; `None` uses the registry default
    pub circuit_reset_ms: Option<u64>,
    /// Whether results for this route may be cached
    pub cacheable: bool,
    /// TTL for cached results; `None` uses the cache default
    pub cache_ttl_ms: Option<u64>,
}

impl RouteConfig {
    /// Create a route config with conservative defaults
    pub fn new(
        request_type: impl Into<String>,
        modality: Modality,
        handler_name: impl Into<String>,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            modality,
            priority: Priority::default(),
            handler_name: handler_name.into(),
            timeout_ms: 10_000,
            max_retries: 2,
            circuit_failure_threshold: None,
            circuit_reset_ms: None,
            cacheable: false,
            cache_ttl_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, reset_ms: Option<u64>) -> Self {
        self.circuit_failure_threshold = Some(failure_threshold);
        self.circuit_reset_ms = reset_ms;
        self
    }

    pub fn with_cacheable(mut self, ttl_ms: Option<u64>) -> Self {
        self.cacheable = true;
        self.cache_ttl_ms = ttl_ms;
        self
    }

    /// Route key identifying this config's (type, modality) pair
    pub fn route_key(&self) -> String {
        route_key(&self.request_type, self.modality)
    }
}

/// Per-handler call statistics, updated once per logical dispatch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerStats {
    pub calls: u64,
    pub errors: u64,
    pub total_latency_ms: u64,
    pub last_call_time: Option<DateTime<Utc>>,
    pub active_requests: u64,
}

impl HandlerStats {
    /// Running average latency per completed call
    pub fn average_latency_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.calls as f64
        }
    }

    /// Fraction of completed calls that failed
    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }
}

/// One completed dispatch in a route's rolling window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSample {
    pub timestamp: DateTime<Utc>,
    pub request_type: String,
    pub duration_ms: u64,
    pub success: bool,
}

/// Degradation detected by short-window trend analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAlert {
    pub route_key: String,
    /// `None` for a route-wide alert, otherwise the offending request type
    pub request_type: Option<String>,
    pub error_rate: f64,
    pub sample_count: usize,
}

struct RegisteredRoute {
    config: RouteConfig,
    handler: Arc<dyn RequestHandler>,
}

/// Registry of routes, handlers, statistics, and pipelines
pub struct HandlerRegistry {
    routes: RwLock<HashMap<String, RegisteredRoute>>,
    stats: Mutex<HashMap<String, HandlerStats>>,
    windows: Mutex<HashMap<String, VecDeque<RouteSample>>>,
    /// Pipelines per request type, in registration order
    pipelines: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Register a route and its handler.
    ///
    /// Idempotent per route key: re-registration replaces the prior config
    /// and handler.
    pub fn register(&self, config: RouteConfig, handler: Arc<dyn RequestHandler>) {
        let key = config.route_key();
        let replaced = self
            .routes
            .write()
            .map(|mut routes| {
                routes
                    .insert(key.clone(), RegisteredRoute { config, handler })
                    .is_some()
            })
            .unwrap_or(false);
        info!(route = %key, replaced, "Registered route");
    }

    /// Resolve a route key to its config and handler
    pub fn resolve(&self, route_key: &str) -> Option<(RouteConfig, Arc<dyn RequestHandler>)> {
        let routes = self.routes.read().ok()?;
        routes
            .get(route_key)
            .map(|r| (r.config.clone(), r.handler.clone()))
    }

    /// Look up a handler by its registered name, across all routes.
    ///
    /// Used for enrichment handler overrides; when several routes share a
    /// handler name, any of them resolves to the same handler instance.
    pub fn resolve_by_handler_name(&self, handler_name: &str) -> Option<Arc<dyn RequestHandler>> {
        let routes = self.routes.read().ok()?;
        routes
            .values()
            .find(|r| r.config.handler_name == handler_name)
            .map(|r| r.handler.clone())
    }

    /// Whether a route is registered
    pub fn contains(&self, route_key: &str) -> bool {
        self.routes
            .read()
            .map(|routes| routes.contains_key(route_key))
            .unwrap_or(false)
    }

    /// All registered route configs
    pub fn route_configs(&self) -> Vec<RouteConfig> {
        self.routes
            .read()
            .map(|routes| routes.values().map(|r| r.config.clone()).collect())
            .unwrap_or_default()
    }

    /// Mark a handler call as in flight
    pub fn record_start(&self, handler_name: &str) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.entry(handler_name.to_string()).or_default().active_requests += 1;
        }
    }

    /// Record the completion of one logical dispatch.
    ///
    /// Retries inside the retry executor are invisible here: `calls`
    /// counts dispatches, not attempts.
    pub fn record_completion(&self, handler_name: &str, duration_ms: u64, success: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            let entry = stats.entry(handler_name.to_string()).or_default();
            entry.active_requests = entry.active_requests.saturating_sub(1);
            entry.calls += 1;
            if !success {
                entry.errors += 1;
            }
            entry.total_latency_ms += duration_ms;
            entry.last_call_time = Some(Utc::now());
        }
    }

    /// Snapshot of all handler statistics
    pub fn handler_stats(&self) -> HashMap<String, HandlerStats> {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Relative share of completed calls per handler, in `[0, 1]`
    pub fn load_share(&self) -> HashMap<String, f64> {
        let Ok(stats) = self.stats.lock() else {
            return HashMap::new();
        };
        let total: u64 = stats.values().map(|s| s.calls).sum();
        if total == 0 {
            return stats.keys().map(|k| (k.clone(), 0.0)).collect();
        }
        stats
            .iter()
            .map(|(k, s)| (k.clone(), s.calls as f64 / total as f64))
            .collect()
    }

    /// Append a sample to a route's rolling window (bounded)
    pub fn record_sample(&self, route_key: &str, sample: RouteSample) {
        if let Ok(mut windows) = self.windows.lock() {
            let window = windows.entry(route_key.to_string()).or_default();
            if window.len() >= WINDOW_CAPACITY {
                window.pop_front();
            }
            window.push_back(sample);
        }
    }

    /// Drop window samples older than `max_age_secs`; returns removed count
    pub fn prune_windows(&self, max_age_secs: i64) -> usize {
        let Ok(mut windows) = self.windows.lock() else {
            return 0;
        };
        let cutoff = Utc::now() - ChronoDuration::seconds(max_age_secs);
        let mut removed = 0;
        for window in windows.values_mut() {
            while window.front().is_some_and(|s| s.timestamp < cutoff) {
                window.pop_front();
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned stale route window samples");
        }
        removed
    }

    /// Analyze recent windows and return any degradation alerts.
    ///
    /// A route-wide alert fires when the error rate over the most recent 50
    /// samples exceeds 20%; a per-type alert fires when one request type's
    /// local error rate exceeds 30% over at least 5 samples in that span.
    pub fn analyze_trends(&self) -> Vec<TrendAlert> {
        let Ok(windows) = self.windows.lock() else {
            return Vec::new();
        };
        let mut alerts = Vec::new();

        for (route_key, window) in windows.iter() {
            let span: Vec<&RouteSample> = window
                .iter()
                .rev()
                .take(TREND_SAMPLE_SPAN)
                .collect();
            if span.len() < MIN_TREND_SAMPLES {
                continue;
            }

            let errors = span.iter().filter(|s| !s.success).count();
            let error_rate = errors as f64 / span.len() as f64;
            if error_rate > TREND_ERROR_THRESHOLD {
                alerts.push(TrendAlert {
                    route_key: route_key.clone(),
                    request_type: None,
                    error_rate,
                    sample_count: span.len(),
                });
            }

            let mut by_type: HashMap<&str, (usize, usize)> = HashMap::new();
            for sample in &span {
                let entry = by_type.entry(sample.request_type.as_str()).or_default();
                entry.0 += 1;
                if !sample.success {
                    entry.1 += 1;
                }
            }
            for (request_type, (count, errors)) in by_type {
                if count < MIN_TREND_SAMPLES {
                    continue;
                }
                let local_rate = errors as f64 / count as f64;
                if local_rate > TYPE_ERROR_THRESHOLD {
                    alerts.push(TrendAlert {
                        route_key: route_key.clone(),
                        request_type: Some(request_type.to_string()),
                        error_rate: local_rate,
                        sample_count: count,
                    });
                }
            }
        }

        alerts
    }

    /// Register a processing pipeline for a request type
    pub fn register_pipeline(&self, request_type: impl Into<String>, pipeline: impl Into<String>) {
        if let Ok(mut pipelines) = self.pipelines.lock() {
            pipelines
                .entry(request_type.into())
                .or_default()
                .push(pipeline.into());
        }
    }

    /// Suggest a pipeline for a request type.
    ///
    /// Always the first pipeline registered for the type; this is the
    /// documented default, not a scoring decision.
    // TODO: rank by recent per-pipeline success rate instead of registration order
    pub fn suggested_pipeline(&self, request_type: &str) -> Option<String> {
        self.pipelines
            .lock()
            .ok()
            .and_then(|p| p.get(request_type).and_then(|v| v.first().cloned()))
    }
}
