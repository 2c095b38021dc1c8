// src/pipeline/throttle.rs

//! Per-job token bucket for upstream calls.
//!
//! The bucket holds at most `calls_per_window` tokens and refills
//! continuously at `calls_per_window / window_secs` tokens per second. A
//! tick is admitted with at least one token; afterwards every upstream
//! call it actually made is charged, so a hydration step that also
//! expanded both id lists costs three.

use chrono::{DateTime, Utc};

use crate::models::{ThrottleConfig, TickBudget};

/// Token-bucket arithmetic over a job's persisted [`TickBudget`].
#[derive(Debug, Clone)]
pub struct Throttle {
    enabled: bool,
    capacity: f64,
    window_secs: f64,
}

impl Throttle {
    pub fn new(config: &ThrottleConfig) -> Self {
        let capacity = f64::from(config.calls_per_window);
        Self {
            enabled: config.enabled,
            capacity,
            window_secs: config.window_secs.max(1) as f64,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Bucket state at `now`. A job without a budget starts full.
    pub fn refill(&self, budget: Option<&TickBudget>, now: DateTime<Utc>) -> TickBudget {
        let tokens = match budget {
            None => self.capacity,
            Some(b) => {
                let elapsed = (now - b.refilled_at).num_milliseconds().max(0) as f64 / 1000.0;
                (b.tokens + elapsed * self.capacity / self.window_secs).min(self.capacity)
            }
        };
        TickBudget {
            tokens,
            refilled_at: now,
        }
    }

    /// Refilled budget if a tick may run now, otherwise the whole seconds
    /// until one token is available.
    pub fn admit(&self, budget: Option<&TickBudget>, now: DateTime<Utc>) -> Result<TickBudget, u64> {
        let refilled = self.refill(budget, now);
        if !self.enabled || refilled.tokens >= 1.0 {
            return Ok(refilled);
        }
        let missing = 1.0 - refilled.tokens;
        Err((missing * self.window_secs / self.capacity).ceil() as u64)
    }

    /// Charge `calls` tokens. The bucket may go into debt, bounded by one
    /// window's worth, which later admissions have to pay back.
    pub fn charge(&self, budget: Option<&TickBudget>, calls: u32, now: DateTime<Utc>) -> TickBudget {
        let mut refilled = self.refill(budget, now);
        refilled.tokens = (refilled.tokens - f64::from(calls)).max(-self.capacity);
        refilled
    }
}
