use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::clock::duration_to_nanos;
use crate::clock::millis_to_nanos;
use crate::error::RateLimitError;
use crate::error::Result;

/// How sub-token refill progress is treated when a key is credited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefillMode {
    /// Advance the refill timestamp to `now`, dropping any fractional token
    #[default]
    Truncate,

    /// Advance the refill timestamp only by the time worth of the credited
    /// tokens, so partial progress counts towards the next token
    Carry,
}

/// Serializable bucket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens held per key
    pub capacity: u64,

    /// Time in milliseconds over which `capacity` tokens accrue
    pub interval_ms: u64,

    #[serde(default)]
    pub refill: RefillMode,

    /// Drop keys idle for this long. Must be at least `interval_ms`.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        // 5 requests per minute
        Self { capacity: 5, interval_ms: 60_000, refill: RefillMode::Truncate, idle_timeout_ms: None }
    }
}

/// Validated limits shared by every key of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    pub capacity: u64,
    pub interval_nanos: u64,
    pub refill: RefillMode,
    pub idle_timeout_nanos: Option<u64>,
}

impl Limits {
    pub fn new(capacity: u64, interval: Duration, refill: RefillMode, idle_timeout: Option<Duration>) -> Result<Self> {
        if capacity == 0 {
            return Err(RateLimitError::InvalidConfig("capacity must be greater than 0"));
        }

        let interval_nanos = duration_to_nanos(interval);
        if interval_nanos == 0 {
            return Err(RateLimitError::InvalidConfig("interval must be greater than 0"));
        }

        let idle_timeout_nanos = idle_timeout.map(duration_to_nanos);
        if idle_timeout_nanos.is_some_and(|idle| idle < interval_nanos) {
            // A key idle for less than one interval may still be below
            // capacity, so dropping it would hand out a fresh full bucket.
            return Err(RateLimitError::InvalidConfig("idle timeout must be at least one interval"));
        }

        Ok(Self { capacity, interval_nanos, refill, idle_timeout_nanos })
    }

    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        Self::new(
            config.capacity,
            Duration::from_nanos(millis_to_nanos(config.interval_ms)),
            config.refill,
            config.idle_timeout_ms.map(Duration::from_millis),
        )
    }

    /// Whole tokens earned over `elapsed` nanoseconds
    #[inline(always)]
    pub fn tokens_for(&self, elapsed: u64) -> u64 {
        // Divide first: a whole number of intervals then yields an exact
        // multiple of capacity. Float-to-int `as` saturates on overflow.
        (elapsed as f64 / self.interval_nanos as f64 * self.capacity as f64) as u64
    }

    /// Nanoseconds needed to earn `tokens`, rounded up
    #[inline(always)]
    pub fn nanos_for(&self, tokens: u64) -> u64 {
        let capacity = u128::from(self.capacity);
        let nanos = (u128::from(tokens) * u128::from(self.interval_nanos)).div_ceil(capacity);
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_nanos.map(Duration::from_nanos)
    }
}
