//! GCRA admission control.
//!
//! The limiter tracks a single scalar, the theoretical arrival time (TAT).
//! Admitting a request of cost `c` advances the TAT by `c / rate`; the
//! request may proceed once `TAT - burst/rate` has passed. Idle periods
//! reset the pace (TAT never lags behind the clock), so no reservoir beyond
//! `burst` ever accumulates.
//!
//! Admission decisions are serialized by a mutex; the wait itself always
//! happens outside the lock, blocking for sync callers and as a cooperative
//! `tokio` sleep for async callers. A caller that abandons its slot after
//! reserving does not rewind the TAT; the limiter upper-bounds throughput,
//! it does not maximize utilization.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate must be positive (got {0} tokens per minute)")]
    InvalidRate(u32),

    #[error("burst must be positive")]
    InvalidBurst,

    #[error("request cost {cost} exceeds the burst capacity {burst}; it can never be admitted")]
    CostExceedsBurst { cost: u32, burst: u32 },
}

/// GCRA rate limiter shared by sync and async call sites.
#[derive(Debug)]
pub struct RateLimiter {
    /// Cost units per second.
    rate: f64,
    /// Maximum reservoir in cost units.
    burst: u32,
    origin: Instant,
    /// Theoretical arrival time, in seconds since `origin`.
    tat: Mutex<f64>,
}

impl RateLimiter {
    /// Limiter admitting `tpm` cost units per minute with a burst reservoir
    /// of the full minute budget.
    pub fn per_minute(tpm: u32) -> Result<Self, LimiterError> {
        Self::with_burst(tpm, tpm)
    }

    /// Limiter with an explicit burst reservoir.
    pub fn with_burst(tpm: u32, burst: u32) -> Result<Self, LimiterError> {
        if tpm == 0 {
            return Err(LimiterError::InvalidRate(tpm));
        }
        if burst == 0 {
            return Err(LimiterError::InvalidBurst);
        }
        Ok(Self {
            rate: f64::from(tpm) / 60.0,
            burst,
            origin: Instant::now(),
            tat: Mutex::new(0.0),
        })
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Reserve a slot for a request of `cost` units and return how long the
    /// caller must wait before proceeding. The reservation is made
    /// immediately; the caller owns the sleep.
    pub fn reserve(&self, cost: u32) -> Result<Duration, LimiterError> {
        if cost == 0 {
            return Ok(Duration::ZERO);
        }
        if cost > self.burst {
            return Err(LimiterError::CostExceedsBurst {
                cost,
                burst: self.burst,
            });
        }

        let mut tat = self.tat.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.origin.elapsed().as_secs_f64();
        let increment = f64::from(cost) / self.rate;
        let next = tat.max(now) + increment;
        let allow_at = next - f64::from(self.burst) / self.rate;
        *tat = next;

        if allow_at <= now {
            Ok(Duration::ZERO)
        } else {
            Ok(Duration::from_secs_f64(allow_at - now))
        }
    }

    /// Blocking admission: reserve, then sleep out the assigned delay.
    pub fn acquire(&self, cost: u32) -> Result<(), LimiterError> {
        let wait = self.reserve(cost)?;
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Ok(())
    }

    /// Cooperative admission: reserve, then suspend for the assigned delay.
    /// Cancellation mid-wait does not refund the reservation.
    pub async fn acquire_async(&self, cost: u32) -> Result<(), LimiterError> {
        let wait = self.reserve(cost)?;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }
}
