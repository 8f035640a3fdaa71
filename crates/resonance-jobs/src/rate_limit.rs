//! Process-wide limiter on handler invocations.
//!
//! One permit is released every `window / max` (rounded up to the next
//! nanosecond), with no burst capacity, so any half-open interval of length
//! `window` admits at most `max` calls no matter how many workers share the
//! limiter.
//!
//! The limiter lives as long as the pipeline service. A new budget set with
//! [`HandlerRateLimiter::reconfigure`] takes effect on the next permit, and
//! that permit still waits out the spacing owed to the last one granted.

use std::num::NonZeroU32;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use resonance_core::{Error, PipelineSettings, Result};

/// Direct (unkeyed) governor limiter.
type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A validated `max` calls per `window` budget.
#[derive(Debug, Clone, Copy)]
struct Budget {
    max: u32,
    window: Duration,
    period: Duration,
    quota: Quota,
}

impl Budget {
    fn new(max: u32, window: Duration) -> Result<Self> {
        if max == 0 {
            return Err(Error::Config("rate limit max must be non-zero".to_string()));
        }
        let nanos = window.as_nanos().div_ceil(u128::from(max));
        let period = u64::try_from(nanos)
            .map(Duration::from_nanos)
            .map_err(|_| Error::Config(format!("rate limit window {:?} too large", window)))?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                Error::Config(format!(
                    "rate limit window {:?} too small for {} calls",
                    window, max
                ))
            })?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            max,
            window,
            period,
            quota,
        })
    }

    fn same_as(&self, other: &Budget) -> bool {
        self.max == other.max && self.window == other.window
    }
}

/// Limiter state; the async lock is held for the whole wait so permits are
/// handed out one at a time in arrival order.
struct Slot {
    limiter: DirectRateLimiter,
    budget: Budget,
    last_grant: Option<Instant>,
    not_before: Option<Instant>,
}

/// Shared by every worker and the immediate path.
pub struct HandlerRateLimiter {
    slot: Mutex<Slot>,
    target: StdMutex<Budget>,
}

impl HandlerRateLimiter {
    /// Allow at most `max` invocations per `window`.
    pub fn new(max: u32, window: Duration) -> Result<Self> {
        let budget = Budget::new(max, window)?;

        debug!(
            subsystem = "jobs",
            component = "rate_limit",
            max,
            window_ms = window.as_millis() as u64,
            period_ms = budget.period.as_millis() as u64,
            "Handler rate limiter configured"
        );

        Ok(Self {
            slot: Mutex::new(Slot {
                limiter: RateLimiter::direct(budget.quota),
                budget,
                last_grant: None,
                not_before: None,
            }),
            target: StdMutex::new(budget),
        })
    }

    pub fn from_settings(settings: &PipelineSettings) -> Result<Self> {
        Self::new(settings.rate_limit_max, settings.rate_limit_window)
    }

    /// Switch to a new budget. Returns `false` when it is already in force.
    pub fn reconfigure(&self, max: u32, window: Duration) -> Result<bool> {
        let budget = Budget::new(max, window)?;
        let mut target = self.lock_target();
        if target.same_as(&budget) {
            return Ok(false);
        }
        info!(
            subsystem = "jobs",
            component = "rate_limit",
            op = "reconfigure",
            from_max = target.max,
            from_window_ms = target.window.as_millis() as u64,
            max,
            window_ms = window.as_millis() as u64,
            "Handler rate limit changed"
        );
        *target = budget;
        Ok(true)
    }

    /// Wait until a permit is available and consume it.
    pub async fn acquire(&self) {
        let mut slot = self.slot.lock().await;
        self.apply_target(&mut slot);
        if let Some(at) = slot.not_before {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
            slot.not_before = None;
        }
        slot.limiter.until_ready().await;
        slot.last_grant = Some(Instant::now());
    }

    /// Consume a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut slot) = self.slot.try_lock() else {
            return false;
        };
        self.apply_target(&mut slot);
        if slot.not_before.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        slot.not_before = None;
        if slot.limiter.check().is_err() {
            return false;
        }
        slot.last_grant = Some(Instant::now());
        true
    }

    pub fn max(&self) -> u32 {
        self.lock_target().max
    }

    pub fn window(&self) -> Duration {
        self.lock_target().window
    }

    /// Minimum spacing between two permits.
    pub fn period(&self) -> Duration {
        self.lock_target().period
    }

    fn lock_target(&self) -> MutexGuard<'_, Budget> {
        match self.target.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Swap in the target budget if it changed since the last permit.
    fn apply_target(&self, slot: &mut Slot) {
        let target = *self.lock_target();
        if slot.budget.same_as(&target) {
            return;
        }
        // A fresh governor limiter starts with a permit ready; hold it back
        // until the previous grant's spacing has passed under both budgets.
        if let Some(last) = slot.last_grant {
            let at = last + slot.budget.period.max(target.period);
            slot.not_before = Some(slot.not_before.map_or(at, |prev| prev.max(at)));
        }
        slot.limiter = RateLimiter::direct(target.quota);
        slot.budget = target;
    }
}

impl std::fmt::Debug for HandlerRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = *self.lock_target();
        f.debug_struct("HandlerRateLimiter")
            .field("max", &target.max)
            .field("window", &target.window)
            .finish()
    }
}
