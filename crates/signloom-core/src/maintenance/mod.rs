//! Background maintenance for the dispatch layer
//!
//! One spawned task drives two cadences:
//! - Trend tick (default 30s): analyze route windows, publish alerts,
//!   prune samples older than the rolling-window horizon, and reset
//!   circuit breakers that stayed open well past their cooldown.
//! - Sweep tick (default 60s): remove expired cache entries.
//!
//! Each tick takes its locks once, does its pass, and releases; a slow
//! tick delays the next one rather than overlapping it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::cache::{Cache, SharedCache};
use crate::config::MaintenanceConfig;
use crate::dispatch::RequestDispatcher;
use crate::events::{DispatchEvent, DispatchEventKind, EventBus};
use crate::registry::HandlerRegistry;

/// Window samples older than this are pruned, in seconds
pub const WINDOW_MAX_AGE_SECS: i64 = 3_600;

/// Handle to a running maintenance task
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the task to stop and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "Maintenance task did not shut down cleanly");
        }
    }
}

/// Periodic upkeep over a dispatcher's registries and cache
pub struct MaintenanceLoop {
    config: MaintenanceConfig,
    registry: Arc<HandlerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: SharedCache,
    events: EventBus,
    /// Extra grace beyond `next_attempt` before a stuck-open breaker is reset
    breaker_reset_window: Duration,
}

impl MaintenanceLoop {
    pub fn new(
        config: MaintenanceConfig,
        registry: Arc<HandlerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        cache: SharedCache,
        events: EventBus,
        breaker_reset_window: Duration,
    ) -> Self {
        Self {
            config,
            registry,
            breakers,
            cache,
            events,
            breaker_reset_window,
        }
    }

    /// Wire a maintenance loop to an existing dispatcher's collaborators
    pub fn for_dispatcher(dispatcher: &RequestDispatcher) -> Self {
        Self::new(
            dispatcher.config().maintenance.clone(),
            dispatcher.registry().clone(),
            dispatcher.breakers().clone(),
            dispatcher.cache().clone(),
            dispatcher.events().clone(),
            Duration::from_millis(dispatcher.config().breaker.reset_ms),
        )
    }

    /// Spawn the loop onto the current runtime.
    ///
    /// The loop stops when the returned handle is shut down or when a
    /// `ShutdownStarted` event appears on the dispatcher's event bus.
    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown, mut stop) = watch::channel(false);
        // Subscribe before spawning so a shutdown published right after
        // `spawn` returns is never missed
        let mut events = self.events.subscribe();
        let task = tokio::spawn(async move {
            let mut trend_tick =
                tokio::time::interval(Duration::from_secs(self.config.trend_interval_secs));
            let mut sweep_tick =
                tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
            // The first interval tick fires immediately; skip it so startup
            // does not run both passes at once.
            trend_tick.tick().await;
            sweep_tick.tick().await;

            info!(
                trend_interval_secs = self.config.trend_interval_secs,
                sweep_interval_secs = self.config.sweep_interval_secs,
                "Maintenance loop started"
            );

            loop {
                tokio::select! {
                    _ = trend_tick.tick() => self.run_trend_tick(),
                    _ = sweep_tick.tick() => self.run_sweep_tick(),
                    event = events.recv() => {
                        if matches!(event, Ok(e) if e.kind == DispatchEventKind::ShutdownStarted) {
                            info!("Maintenance loop stopping on dispatcher shutdown");
                            break;
                        }
                    }
                    changed = stop.changed() => {
                        // A dropped handle counts as a stop signal
                        if changed.is_err() || *stop.borrow() {
                            info!("Maintenance loop stopping");
                            break;
                        }
                    }
                }
            }
        });
        MaintenanceHandle { shutdown, task }
    }

    /// One trend pass: alerts, window pruning, stale breaker reset
    pub fn run_trend_tick(&self) {
        for alert in self.registry.analyze_trends() {
            warn!(
                route = %alert.route_key,
                request_type = alert.request_type.as_deref().unwrap_or("*"),
                error_rate = alert.error_rate,
                sample_count = alert.sample_count,
                "Elevated error rate detected"
            );
            self.events.publish_event(DispatchEvent::trend_alert(&alert));
        }

        let pruned = self.registry.prune_windows(WINDOW_MAX_AGE_SECS);
        if pruned > 0 {
            debug!(pruned, "Pruned aged route samples");
        }

        let reset = self.breakers.reset_stale(self.breaker_reset_window);
        for route_key in reset {
            info!(route = %route_key, "Reset circuit breaker stuck open");
            self.events
                .publish(DispatchEventKind::CircuitClosed { route_key });
        }
    }

    /// One sweep pass: drop expired cache entries
    pub fn run_sweep_tick(&self) {
        let removed = self.cache.sweep();
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
            self.events.publish(DispatchEventKind::CacheSwept { removed });
        }
    }
}
