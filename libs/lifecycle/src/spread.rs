//! Spread scheduling of background reconciles.
//!
//! Up-to-date objects are parked until a jittered `nextReconcileTime` so a
//! fleet of objects does not refresh in lockstep. An object needs work when
//! its generation moved, its next reconcile time passed, or it carries the
//! refresh label.
//!
//! All state lives on the object's status; the scheduler itself is stateless
//! apart from the injected random source.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ConfigError;
use crate::object::{ObjectMeta, SpreadStatusHolder};
use crate::REFRESH_LABEL;

/// Default spread budget.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(24 * 60 * 60);

const MINUTE: u64 = 60;

/// Random source for spread draws.
pub trait JitterSource: Send + Sync {
    /// Draw a whole number of minutes in `[low, high)`.
    fn draw_minutes(&self, low: u64, high: u64) -> u64;
}

/// Draws from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn draw_minutes(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        rand::rng().random_range(low..high)
    }
}

/// Deterministic source for reproducible schedules.
#[derive(Debug)]
pub struct SeededJitter(Mutex<StdRng>);

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl JitterSource for SeededJitter {
    fn draw_minutes(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        let mut rng = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.random_range(low..high)
    }
}

/// Spread settings.
#[derive(Debug, Clone)]
pub struct SpreadConfig {
    /// Budget `B`; draws land in `[B/2, B)`.
    pub default_budget: Duration,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            default_budget: DEFAULT_BUDGET,
        }
    }
}

impl SpreadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_budget < Duration::from_secs(2 * MINUTE) {
            return Err(ConfigError::Spread(format!(
                "default budget must be at least 2m, got {:?}",
                self.default_budget
            )));
        }
        Ok(())
    }
}

/// Computes park times and next reconcile times.
#[derive(Clone)]
pub struct SpreadScheduler {
    config: SpreadConfig,
    jitter: Arc<dyn JitterSource>,
}

impl std::fmt::Debug for SpreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpreadScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for SpreadScheduler {
    fn default() -> Self {
        Self::new(SpreadConfig::default(), Arc::new(ThreadRngJitter))
    }
}

impl SpreadScheduler {
    pub fn new(config: SpreadConfig, jitter: Arc<dyn JitterSource>) -> Self {
        Self { config, jitter }
    }

    /// Returns true if the object must go through the chain now.
    pub fn reconcile_required(
        &self,
        meta: &ObjectMeta,
        status: &dyn SpreadStatusHolder,
        now: DateTime<Utc>,
    ) -> bool {
        meta.generation != status.observed_generation()
            || status.next_reconcile_time().is_none_or(|at| now > at)
            || meta.labels.contains_key(REFRESH_LABEL)
    }

    /// Requeue delay that parks an up-to-date object until its next slot.
    pub fn on_next_reconcile(&self, status: &dyn SpreadStatusHolder, now: DateTime<Utc>) -> Duration {
        status
            .next_reconcile_time()
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or_default()
    }

    /// Draw the spread delay for `status`.
    pub fn draw(&self, status: &dyn SpreadStatusHolder) -> Duration {
        let budget = status
            .reconcile_budget()
            .unwrap_or(self.config.default_budget);
        let high = budget.as_secs() / MINUTE;
        let low = high / 2;
        Duration::from_secs(self.jitter.draw_minutes(low, high) * MINUTE)
    }

    /// Store `now + draw` as the next reconcile time.
    pub fn set_next_reconcile_time(&self, status: &mut dyn SpreadStatusHolder, now: DateTime<Utc>) {
        let delay = self.draw(status);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        status.set_next_reconcile_time(now + delay);
    }

    /// Copy the current generation into the observed generation.
    pub fn update_observed_generation(&self, meta: &ObjectMeta, status: &mut dyn SpreadStatusHolder) {
        status.set_observed_generation(meta.generation);
    }

    /// Drop the refresh label. Returns true if it was present.
    pub fn remove_refresh_label_if_exists(&self, meta: &mut ObjectMeta) -> bool {
        meta.labels.remove(REFRESH_LABEL).is_some()
    }
}
