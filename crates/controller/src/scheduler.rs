//! The main loop: one cooperative task that samples sensors and runs the
//! controller's rules, each at its own cadence.
//!
//! ```text
//! loop:
//!   now = clock.now_ms()
//!   sampling due?          → sample (outside the lock)
//!   irrigation check due?  → controller.auto_check
//!   safety monitor due?    → controller.safety_tick
//!   sampler.observe_irrigation(pump_active)
//!   sleep(loop_sleep)
//! ```
//!
//! Every rule runs under the shared write lock, so HTTP commands and loop
//! decisions never interleave.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::Timing;
use crate::sampler::SensorSampler;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Milliseconds since some fixed origin. Never goes backwards.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Time since the process started.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock(std::sync::atomic::AtomicU64);

#[cfg(test)]
impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(start_ms))
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Periodic tasks
// ---------------------------------------------------------------------------

/// A named cadence. Due on the first check, then whenever `interval` has
/// passed since the last run.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    name: &'static str,
    interval_ms: u64,
    last_run: Option<u64>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval_ms: interval.as_millis() as u64,
            last_run: None,
        }
    }

    /// Returns true and marks the task as run if it is due at `now_ms`.
    pub fn due(&mut self, now_ms: u64) -> bool {
        let due = match self.last_run {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        };
        if due {
            self.last_run = Some(now_ms);
            debug!(task = self.name, now_ms, "task due");
        }
        due
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

pub struct MainLoop<S> {
    sampler: S,
    clock: Arc<dyn Clock>,
    sampling: PeriodicTask,
    irrigation_check: PeriodicTask,
    safety: PeriodicTask,
    loop_sleep: Duration,
}

impl<S: SensorSampler> MainLoop<S> {
    pub fn new(sampler: S, clock: Arc<dyn Clock>, timing: &Timing) -> Self {
        Self {
            sampler,
            clock,
            sampling: PeriodicTask::new(
                "sampling",
                Duration::from_secs(timing.sample_interval_sec),
            ),
            irrigation_check: PeriodicTask::new(
                "irrigation-check",
                Duration::from_secs(timing.irrigation_check_interval_sec),
            ),
            safety: PeriodicTask::new(
                "safety-monitor",
                Duration::from_millis(timing.safety_monitor_interval_ms),
            ),
            loop_sleep: Duration::from_millis(timing.loop_sleep_ms),
        }
    }

    /// One loop iteration without the trailing sleep.
    pub async fn step(&mut self, shared: &SharedState) {
        let now = self.clock.now_ms();

        // Sampling can block on I2C; keep it out of the lock so the web UI
        // stays responsive.
        let fresh = self.sampling.due(now).then(|| self.sampler.sample(now));
        let check_due = self.irrigation_check.due(now);
        let safety_due = self.safety.due(now);

        if fresh.is_none() && !check_due && !safety_due {
            return;
        }

        let pump_active = {
            let mut st = shared.write().await;
            if let Some(snap) = fresh {
                st.record_reading(snap);
            }
            if check_due {
                st.run_auto_check();
            }
            if safety_due {
                st.run_safety_tick();
            }
            st.controller.state().pump_active
        };

        self.sampler.observe_irrigation(pump_active);
    }

    /// Run forever. Intended to be the last thing `main` awaits.
    pub async fn run(mut self, shared: SharedState) {
        info!(
            sample_ms = self.sampling.interval_ms,
            check_ms = self.irrigation_check.interval_ms,
            safety_ms = self.safety.interval_ms,
            sleep_ms = self.loop_sleep.as_millis() as u64,
            "main loop started"
        );
        loop {
            self.step(&shared).await;
            tokio::time::sleep(self.loop_sleep).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
