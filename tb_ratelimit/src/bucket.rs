use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::BucketConfig;
use crate::config::Limits;
use crate::config::RefillMode;
use crate::error::RateLimitError;
use crate::error::Result;
use crate::key_state::KeyState;
use crate::limiter::KeyedLimiter;
use crate::store::Store;

/// Initial map capacity for a new bucket
const INITIAL_KEYS: usize = 20;

/// Per-key token bucket
///
/// Every key gets its own token count, refilled continuously at
/// `capacity / interval` up to `capacity`. Keys are created full on first
/// use. Capacity and interval are fixed for the lifetime of the bucket and
/// shared by all keys.
pub struct Bucket {
    limits: Limits,
    clock: Arc<dyn Clock>,
    store: Store,
}

impl Bucket {
    /// Create a bucket backed by the wall clock
    pub fn new(capacity: u64, interval: Duration) -> Result<Self> {
        Self::builder().capacity(capacity).interval(interval).build()
    }

    /// Create a bucket reading time from `clock`
    pub fn with_clock<C: Clock + 'static>(capacity: u64, interval: Duration, clock: C) -> Result<Self> {
        Self::builder().capacity(capacity).interval(interval).clock(clock).build()
    }

    /// Create a wall-clock bucket from serialized settings
    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        Ok(Self::from_limits(Limits::from_config(config)?, Arc::new(SystemClock)))
    }

    /// Create a builder for configuring a bucket
    pub fn builder() -> BucketBuilder {
        BucketBuilder::new()
    }

    fn from_limits(limits: Limits, clock: Arc<dyn Clock>) -> Self {
        Self { limits, clock, store: Store::with_capacity(INITIAL_KEYS) }
    }

    /// Take `amount` tokens for `key`
    ///
    /// Returns the tokens left for the key, or `TokensExceeded` if fewer than
    /// `amount` are available after refill. Never blocks, so there is no
    /// cancellation point and no context or cancellation token to pass.
    pub fn take(&self, key: &str, amount: u64) -> Result<u64> {
        loop {
            let state = self.store.get_or_insert_with(key, || {
                debug!(key, capacity = self.limits.capacity, "Creating key state");
                KeyState::new(self.limits.capacity, self.clock.now_nanos())
            });

            match state.take(amount, &self.limits, self.clock.as_ref()) {
                Some(Err(err)) => {
                    trace!(key, amount, %err, "Take denied");
                    return Err(err);
                }
                Some(remaining) => return remaining,
                // Evicted between lookup and lock, resolve the key again
                None => continue,
            }
        }
    }

    /// Take a single token for `key`
    pub fn take_one(&self, key: &str) -> Result<u64> {
        self.take(key, 1)
    }

    /// Tokens `key` could take right now, or `None` if it has no state yet
    ///
    /// An unknown key would start at `capacity`. Never creates or debits.
    pub fn available(&self, key: &str) -> Option<u64> {
        self.store.get(key).ok()?.available(&self.limits, self.clock.as_ref())
    }

    /// Drop the state for `key`, returning whether it existed
    ///
    /// The key starts full again on its next take.
    pub fn forget(&self, key: &str) -> bool {
        match self.store.delete(key) {
            Some(state) => {
                state.retire();
                true
            }
            None => false,
        }
    }

    /// Remove keys that have been idle for at least the idle timeout
    ///
    /// Does nothing unless an idle timeout is configured. The timeout is at
    /// least one interval, so a removed key would already be back at full
    /// capacity and recreating it is not observable.
    pub fn evict_idle(&self) -> usize {
        let Some(idle_nanos) = self.limits.idle_timeout_nanos else {
            return 0;
        };

        let now = self.clock.now_nanos();
        let mut evicted = 0;
        self.store.retain(|_, state| {
            let idle = state.retire_if_idle(now, idle_nanos);
            evicted += usize::from(idle);
            !idle
        });

        if evicted > 0 {
            debug!(evicted, remaining = self.store.len(), "Evicted idle keys");
        }
        evicted
    }

    /// Start a background task evicting idle keys every `period`
    ///
    /// The task holds a weak reference and exits once the bucket is dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let bucket = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(1));
        info!(?period, idle_timeout = ?self.limits.idle_timeout(), "Starting idle key sweeper");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let Some(bucket) = bucket.upgrade() else {
                    debug!("Bucket dropped, stopping sweeper");
                    break;
                };
                bucket.evict_idle();
            }
        })
    }

    /// Maximum tokens per key
    pub fn capacity(&self) -> u64 {
        self.limits.capacity
    }

    /// Time over which `capacity` tokens accrue
    pub fn interval(&self) -> Duration {
        self.limits.interval()
    }

    pub fn refill_mode(&self) -> RefillMode {
        self.limits.refill
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.limits.idle_timeout()
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl KeyedLimiter for Bucket {
    fn try_take(&self, key: &str, amount: u64) -> Result<u64> {
        self.take(key, amount)
    }

    fn capacity(&self) -> u64 {
        self.limits.capacity
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("limits", &self.limits).field("keys", &self.store.len()).finish_non_exhaustive()
    }
}

/// Builder for configuring a bucket
pub struct BucketBuilder {
    capacity: Option<u64>,
    interval: Option<Duration>,
    refill: RefillMode,
    idle_timeout: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl BucketBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self { capacity: None, interval: None, refill: RefillMode::Truncate, idle_timeout: None, clock: None }
    }

    /// Set the per-key capacity (max tokens)
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the time over which `capacity` tokens accrue
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// `capacity` tokens per second
    pub fn per_second(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self.interval = Some(Duration::from_secs(1));
        self
    }

    /// `capacity` tokens per minute
    pub fn per_minute(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self.interval = Some(Duration::from_secs(60));
        self
    }

    pub fn refill_mode(mut self, refill: RefillMode) -> Self {
        self.refill = refill;
        self
    }

    /// Allow idle keys to be evicted after `idle_timeout`
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Read time from `clock` instead of the wall clock
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Build the bucket
    pub fn build(self) -> Result<Bucket> {
        let capacity = self.capacity.ok_or(RateLimitError::InvalidConfig("capacity must be set"))?;
        let interval = self.interval.ok_or(RateLimitError::InvalidConfig("interval must be set"))?;
        let limits = Limits::new(capacity, interval, self.refill, self.idle_timeout)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(Bucket::from_limits(limits, clock))
    }
}

impl Default for BucketBuilder {
    fn default() -> Self {
        Self::new()
    }
}
