//! Adaptive concurrency limiter for outbound LLM calls.
//!
//! Two nested pools guard every call: one process-wide and one per
//! `provider/model` key. Each pool has a static maximum and a soft limit that
//! shrinks on rate-limit or transient errors and slowly grows back on success.
//! Acquisition waits on the soft limit, not the maximum.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::Level;

use autorun_observability::{emit_event, ObservabilityEvent, ProcessKind};

use crate::ErrorClass;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub global_max: usize,
    pub per_model_max: usize,
    /// Per `provider/model` overrides of `per_model_max`.
    pub per_model: HashMap<String, usize>,
    pub increase_interval_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub transient_cooldown_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            global_max: 8,
            per_model_max: 4,
            per_model: HashMap::new(),
            increase_interval_ms: 5_000,
            rate_limit_cooldown_ms: 2_000,
            transient_cooldown_ms: 1_000,
        }
    }
}

impl LimiterConfig {
    fn model_max(&self, key: &str) -> usize {
        self.per_model
            .get(key)
            .copied()
            .unwrap_or(self.per_model_max)
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    RateLimited,
    Transient,
    Other,
}

impl From<ErrorClass> for CallOutcome {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::RateLimited => CallOutcome::RateLimited,
            ErrorClass::Transient => CallOutcome::Transient,
            ErrorClass::Other => CallOutcome::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub max: usize,
    pub current: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub global: PoolSnapshot,
    pub model: Option<PoolSnapshot>,
}

#[derive(Debug)]
struct Pool {
    max: usize,
    current: usize,
    in_flight: usize,
    last_adjusted: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl Pool {
    fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            current: max,
            in_flight: 0,
            last_adjusted: None,
            cooldown_until: None,
        }
    }

    fn has_slot(&self) -> bool {
        self.in_flight < self.current
    }

    fn set_current(&mut self, next: usize, now: Instant) -> Option<(usize, usize)> {
        let prev = self.current;
        self.last_adjusted = Some(now);
        if next == prev {
            return None;
        }
        self.current = next;
        Some((prev, next))
    }

    fn apply(
        &mut self,
        outcome: CallOutcome,
        now: Instant,
        config: &LimiterConfig,
    ) -> Option<(usize, usize)> {
        match outcome {
            CallOutcome::RateLimited => {
                let next = (self.current.saturating_sub(1))
                    .min(self.current / 2)
                    .max(1);
                self.cooldown_until =
                    Some(now + Duration::from_millis(config.rate_limit_cooldown_ms));
                self.set_current(next, now)
            }
            CallOutcome::Transient => {
                let next = self.current.saturating_sub(1).max(1);
                self.cooldown_until =
                    Some(now + Duration::from_millis(config.transient_cooldown_ms));
                self.set_current(next, now)
            }
            CallOutcome::Success => {
                if self.current >= self.max {
                    return None;
                }
                if self.cooldown_until.is_some_and(|until| now < until) {
                    return None;
                }
                let interval = Duration::from_millis(config.increase_interval_ms);
                if self
                    .last_adjusted
                    .is_some_and(|at| now.duration_since(at) < interval)
                {
                    return None;
                }
                self.set_current(self.current + 1, now)
            }
            CallOutcome::Other => None,
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            max: self.max,
            current: self.current,
            in_flight: self.in_flight,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    global: Pool,
    models: HashMap<String, Pool>,
}

impl LimiterState {
    fn model_pool(&mut self, key: &str, config: &LimiterConfig) -> &mut Pool {
        self.models
            .entry(key.to_string())
            .or_insert_with(|| Pool::new(config.model_max(key)))
    }

    fn try_take(&mut self, key: &str, config: &LimiterConfig) -> bool {
        let global_free = self.global.has_slot();
        let model = self.model_pool(key, config);
        if !(global_free && model.has_slot()) {
            return false;
        }
        model.in_flight += 1;
        self.global.in_flight += 1;
        true
    }

    fn release(&mut self, key: &str) {
        self.global.in_flight = self.global.in_flight.saturating_sub(1);
        if let Some(pool) = self.models.get_mut(key) {
            pool.in_flight = pool.in_flight.saturating_sub(1);
        }
    }
}

struct Inner {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
    released: Notify,
}

/// Shared limiter handle. Clones share the same pools.
#[derive(Clone)]
pub struct AdaptiveLimiter {
    inner: Arc<Inner>,
}

impl AdaptiveLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let global = Pool::new(config.global_max);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(LimiterState {
                    global,
                    models: HashMap::new(),
                }),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // Pool counters stay consistent even if a holder panicked.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until both the global pool and the pool for `key` have a slot
    /// under their current soft limit.
    pub async fn acquire(&self, key: &str) -> LimiterPermit {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().try_take(key, &self.inner.config) {
                return LimiterPermit {
                    limiter: self.clone(),
                    key: key.to_string(),
                };
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self, key: &str) -> Option<LimiterPermit> {
        if self.lock().try_take(key, &self.inner.config) {
            Some(LimiterPermit {
                limiter: self.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// Feeds a call outcome back into both pools.
    pub fn report(&self, key: &str, outcome: CallOutcome) {
        let now = Instant::now();
        let config = &self.inner.config;
        let (global_change, model_change) = {
            let mut state = self.lock();
            let global_change = state.global.apply(outcome, now, config);
            let model_change = state.model_pool(key, config).apply(outcome, now, config);
            (global_change, model_change)
        };

        for (scope, change) in [("global", global_change), ("model", model_change)] {
            let Some((from, to)) = change else { continue };
            let detail = format!("{} {} -> {} ({:?})", scope, from, to, outcome);
            emit_event(
                if to < from { Level::WARN } else { Level::INFO },
                ProcessKind::Engine,
                ObservabilityEvent {
                    status: Some(scope),
                    detail: Some(&detail),
                    model_id: Some(key),
                    ..ObservabilityEvent::new("limiter.adjust", "limiter")
                },
            );
        }
        // A raised limit may free a waiter.
        if matches!(global_change, Some((from, to)) if to > from)
            || matches!(model_change, Some((from, to)) if to > from)
        {
            self.inner.released.notify_waiters();
        }
    }

    pub fn snapshot(&self, key: &str) -> LimiterSnapshot {
        let state = self.lock();
        LimiterSnapshot {
            global: state.global.snapshot(),
            model: state.models.get(key).map(Pool::snapshot),
        }
    }

    fn release(&self, key: &str) {
        self.lock().release(key);
        self.inner.released.notify_waiters();
    }
}

impl Default for AdaptiveLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

/// Held for the duration of one call; releases its slots on drop.
pub struct LimiterPermit {
    limiter: AdaptiveLimiter,
    key: String,
}

impl LimiterPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release(&self.key);
    }
}
