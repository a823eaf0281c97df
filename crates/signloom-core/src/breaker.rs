//! Per-route circuit breakers
//!
//! # States
//! - Closed: normal operation, dispatches pass through
//! - Open: route assumed down, dispatches fail fast
//! - Half-Open: exactly one trial dispatch probes for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold after a failure
//! Open → Half-Open: lazily, at check time, once next_attempt has passed
//! Half-Open → Closed: the trial dispatch succeeds
//! Half-Open → Open: the trial dispatch fails (fresh cooldown)
//! ```
//!
//! Routes without a configured failure threshold still count failures for
//! statistics but never open.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Snapshot of a single route's breaker, for monitoring
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub failure_count: u32,
    pub is_open: bool,
    pub half_open: bool,
    pub retry_after_ms: Option<u64>,
    pub ms_since_last_failure: Option<u64>,
}

#[derive(Debug)]
struct CircuitState {
    failure_count: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    /// Set while a half-open trial is in flight
    trial_in_flight: bool,
    next_attempt: Option<Instant>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            is_open: false,
            trial_in_flight: false,
            next_attempt: None,
        }
    }
}

/// Registry of circuit breakers, one per route key.
///
/// `record_success` and `record_failure` are the only mutations besides the
/// lazy half-open transition inside [`CircuitBreakerRegistry::check`]; a
/// dispatch call site records at most one outcome per logical call.
pub struct CircuitBreakerRegistry {
    states: Mutex<HashMap<String, CircuitState>>,
    default_reset: Duration,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given default cooldown
    pub fn new(default_reset: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            default_reset,
        }
    }

    /// Gate a dispatch on the route's breaker.
    ///
    /// Fails with [`Error::CircuitOpen`] while the breaker is open. Once the
    /// cooldown has passed, the first caller through here consumes the single
    /// half-open trial slot; concurrent callers keep failing until the trial
    /// resolves via `record_success` or `record_failure`.
    pub fn check(&self, route_key: &str) -> Result<()> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| Error::CircuitOpen {
                route: route_key.to_string(),
                retry_after_ms: self.default_reset.as_millis() as u64,
            })?;
        let state = states
            .entry(route_key.to_string())
            .or_insert_with(CircuitState::new);

        if !state.is_open {
            return Ok(());
        }

        let now = Instant::now();
        match state.next_attempt {
            Some(at) if now > at && !state.trial_in_flight => {
                // Half-open: this caller wins the single trial slot
                state.trial_in_flight = true;
                info!(route = route_key, "Circuit half-open, permitting trial call");
                Ok(())
            }
            Some(at) => Err(Error::CircuitOpen {
                route: route_key.to_string(),
                retry_after_ms: at.saturating_duration_since(now).as_millis() as u64,
            }),
            // Open without a deadline should not happen; fail safe
            None => Err(Error::CircuitOpen {
                route: route_key.to_string(),
                retry_after_ms: self.default_reset.as_millis() as u64,
            }),
        }
    }

    /// Fail fast while the breaker is open and still cooling down.
    ///
    /// Unlike [`CircuitBreakerRegistry::check`] this never consumes the
    /// half-open trial slot, so it is safe to call before a cache probe
    /// that may satisfy the request without invoking the handler.
    pub fn reject_if_open(&self, route_key: &str) -> Result<()> {
        let Ok(states) = self.states.lock() else {
            return Ok(());
        };
        let Some(state) = states.get(route_key) else {
            return Ok(());
        };
        if !state.is_open {
            return Ok(());
        }
        let now = Instant::now();
        match state.next_attempt {
            Some(at) if now > at => Ok(()),
            Some(at) => Err(Error::CircuitOpen {
                route: route_key.to_string(),
                retry_after_ms: at.saturating_duration_since(now).as_millis() as u64,
            }),
            None => Err(Error::CircuitOpen {
                route: route_key.to_string(),
                retry_after_ms: self.default_reset.as_millis() as u64,
            }),
        }
    }

    /// Record a successful call, closing the breaker and zeroing failures
    pub fn record_success(&self, route_key: &str) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        if let Some(state) = states.get_mut(route_key) {
            if state.is_open {
                info!(route = route_key, "Circuit closed after successful trial");
            }
            state.failure_count = 0;
            state.is_open = false;
            state.trial_in_flight = false;
            state.next_attempt = None;
        }
    }

    /// Record a terminal failure; opens the breaker when a threshold is
    /// configured and reached, or re-opens it after a failed trial.
    pub fn record_failure(
        &self,
        route_key: &str,
        failure_threshold: Option<u32>,
        reset: Option<Duration>,
    ) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states
            .entry(route_key.to_string())
            .or_insert_with(CircuitState::new);
        let now = Instant::now();
        let reset = reset.unwrap_or(self.default_reset);

        state.failure_count += 1;
        state.last_failure = Some(now);

        if state.is_open && state.trial_in_flight {
            // Half-open trial failed: back to open with a fresh cooldown
            state.trial_in_flight = false;
            state.next_attempt = Some(now + reset);
            warn!(route = route_key, "Circuit re-opened after failed trial");
            return;
        }

        if let Some(threshold) = failure_threshold {
            if !state.is_open && state.failure_count >= threshold {
                state.is_open = true;
                state.trial_in_flight = false;
                state.next_attempt = Some(now + reset);
                warn!(
                    route = route_key,
                    failures = state.failure_count,
                    cooldown_ms = reset.as_millis() as u64,
                    "Circuit opened"
                );
            }
        }
    }

    /// Whether the route's breaker is currently open
    pub fn is_open(&self, route_key: &str) -> bool {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(route_key).map(|s| s.is_open))
            .unwrap_or(false)
    }

    /// Snapshot of a single route's breaker
    pub fn snapshot(&self, route_key: &str) -> Option<BreakerSnapshot> {
        let states = self.states.lock().ok()?;
        let state = states.get(route_key)?;
        let now = Instant::now();
        Some(BreakerSnapshot {
            failure_count: state.failure_count,
            is_open: state.is_open,
            half_open: state.trial_in_flight,
            retry_after_ms: state
                .next_attempt
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            ms_since_last_failure: state
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        })
    }

    /// Open/closed view across all routes
    pub fn open_map(&self) -> HashMap<String, bool> {
        self.states
            .lock()
            .map(|states| {
                states
                    .iter()
                    .map(|(k, s)| (k.clone(), s.is_open))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Close breakers that have sat open for a full extra cooldown past
    /// their `next_attempt` with no traffic. Returns the reset route keys.
    ///
    /// The extra window keeps this from stealing a live half-open trial.
    pub fn reset_stale(&self, reset_window: Duration) -> Vec<String> {
        let Ok(mut states) = self.states.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut reset = Vec::new();
        for (route, state) in states.iter_mut() {
            if !state.is_open || state.trial_in_flight {
                continue;
            }
            let stale = state
                .next_attempt
                .is_some_and(|at| now > at + reset_window);
            if stale {
                state.is_open = false;
                state.failure_count = 0;
                state.next_attempt = None;
                info!(route = %route, "Stale circuit reset by maintenance");
                reset.push(route.clone());
            }
        }
        reset
    }

    /// Route keys currently tracked by the registry
    pub fn tracked_routes(&self) -> Vec<String> {
        self.states
            .lock()
            .map(|states| states.keys().cloned().collect())
            .unwrap_or_default()
    }
}
