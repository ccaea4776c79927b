//! `RateController` (C4) — adaptive exposure rate and congestion window.
//!
//! Shaped like the reference daemon's QoS `TokenBucket`: a small struct that
//! remembers the last tick it ran and updates a couple of `f64`/counter
//! fields on each call, rather than spawning its own timer task. The caller
//! (the Emitter worker, §5) drives `tick()` on its own schedule.

use std::time::{Duration, Instant};

/// Per-surface adaptive rate state (§4.4).
#[derive(Debug)]
pub struct RateController {
    exposure_rate: f64,
    congestion_window: u32,
    rate_min: f64,
    rate_max: f64,
    window: Duration,
    pull_pressure_in_window: u64,
    last_tick: Instant,
}

impl RateController {
    pub fn new(initial_rate: f64, rate_min: f64, rate_max: f64, window: Duration) -> Self {
        Self {
            exposure_rate: initial_rate.clamp(rate_min, rate_max),
            congestion_window: 1,
            rate_min,
            rate_max,
            window,
            pull_pressure_in_window: 0,
            last_tick: Instant::now(),
        }
    }

    /// Current chunks/sec exposure rate.
    pub fn exposure_rate(&self) -> f64 {
        self.exposure_rate
    }

    /// Current count of chunks allowed to be outstanding un-acked.
    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    /// Record a PULL_REQUEST or CHUNK_NACK arrival — pull pressure.
    pub fn record_pull_pressure(&mut self) {
        self.pull_pressure_in_window += 1;
    }

    /// Run the scheduling tick (§4.4) if at least `window` has elapsed since
    /// the last one. No-op otherwise, so callers can call this on every
    /// Emitter loop iteration without overshooting the adaptation cadence.
    pub fn tick(&mut self, now: Instant) {
        if now.duration_since(self.last_tick) < self.window {
            return;
        }

        if self.pull_pressure_in_window as u32 > self.congestion_window {
            self.exposure_rate = (self.exposure_rate * 1.1).min(self.rate_max);
            self.congestion_window += 1;
        } else if self.pull_pressure_in_window == 0 {
            self.exposure_rate = (self.exposure_rate * 0.9).max(self.rate_min);
            self.congestion_window = self.congestion_window.saturating_sub(1).max(1);
        }
        // else: pressure present but not exceeding the window — hold steady.

        self.pull_pressure_in_window = 0;
        self.last_tick = now;
    }

    /// Minimum interval, in nanoseconds, between consecutive CHUNK_DATA
    /// sends at the current rate. Used by the Emitter's pacing sleep.
    pub fn inter_send_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.exposure_rate.max(self.rate_min))
    }
}
