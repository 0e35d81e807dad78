use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{BridgeError, Result};

/// Fixed-rate tick clock driven by absolute deadlines.
///
/// Deadline `k` is always `origin + k * period`, so jitter in one tick never
/// shifts the ones after it. When the caller falls a whole period or more
/// behind, the missed deadlines are skipped instead of fired back to back.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    origin: Instant,
    period: Duration,
    next: u64,
    overruns: u64,
}

impl TickSchedule {
    /// Starts a schedule whose first deadline is now.
    pub fn new(period: Duration) -> Self {
        Self::starting_at(Instant::now(), period)
    }

    pub fn starting_at(origin: Instant, period: Duration) -> Self {
        Self {
            origin,
            period: period.max(Duration::from_nanos(1)),
            next: 0,
            overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of deadlines skipped so far.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Returns the deadline of the next tick and advances past it.
    pub fn next_deadline(&mut self, now: Instant) -> Instant {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let due = (elapsed / self.period.as_nanos()) as u64;
        if self.next < due {
            let skipped = due - self.next;
            self.overruns += skipped;
            debug!(skipped, total = self.overruns, "sampling loop overran");
            self.next = due;
        }
        let deadline = self.deadline_of(self.next);
        self.next += 1;
        deadline
    }

    fn deadline_of(&self, tick: u64) -> Instant {
        let offset = self.period.as_nanos().saturating_mul(u128::from(tick));
        self.origin + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
    }
}

/// Stop flag that can interrupt a pending tick wait.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) -> Result<()> {
        *self.lock()? = true;
        self.wake.notify_all();
        Ok(())
    }

    pub fn is_requested(&self) -> Result<bool> {
        Ok(*self.lock()?)
    }

    /// Sleeps until `deadline`. Returns `true` if a stop was requested first.
    pub fn wait_until(&self, deadline: Instant) -> Result<bool> {
        let mut stopped = self.lock()?;
        loop {
            if *stopped {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .map_err(|_| BridgeError::msg("stop signal has been poisoned"))?;
            stopped = guard;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, bool>> {
        self.stopped
            .lock()
            .map_err(|_| BridgeError::msg("stop signal has been poisoned"))
    }
}
