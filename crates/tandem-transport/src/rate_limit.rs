//! Per-connection frame rate limiting using a token bucket

use std::time::{Duration, Instant};

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Sustained frames per second
    pub frames_per_second: u32,
    /// Burst capacity (max tokens)
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn new(frames_per_second: u32, burst_size: u32) -> Self {
        Self {
            frames_per_second,
            burst_size: burst_size.max(1),
        }
    }

    /// Create from a simple "frames/second" value with default burst = 2x rate
    pub fn from_rate(frames_per_second: u32) -> Self {
        Self::new(frames_per_second, frames_per_second.saturating_mul(2))
    }
}

/// Token bucket owned by a single connection task
///
/// Allows bursting up to `burst_size` frames, then refills continuously at
/// `frames_per_second`. A limited connection is slowed down rather than
/// dropped: the caller waits `wait_time()` before reading its next frame.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    fn starting_at(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: f64::from(config.burst_size),
            last_refill: now,
        }
    }

    /// Try to take a token. Returns false when rate limited.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available
    pub fn wait_time(&mut self) -> Duration {
        self.wait_time_at(Instant::now())
    }

    pub fn wait_time_at(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 || self.config.frames_per_second == 0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - self.tokens;
        Duration::from_secs_f64(missing / f64::from(self.config.frames_per_second))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let added = elapsed.as_secs_f64() * f64::from(self.config.frames_per_second);
        self.tokens = (self.tokens + added).min(f64::from(self.config.burst_size));
    }
}
