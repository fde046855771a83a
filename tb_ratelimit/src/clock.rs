use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Time source for rate limiters
///
/// Timestamps are nanoseconds on an arbitrary but fixed timeline. Only
/// differences between two readings of the same clock are meaningful.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds
    fn now_nanos(&self) -> u64;
}

/// Wall-clock time source, nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline(always)]
    fn now_nanos(&self) -> u64 {
        // A clock set before 1970 reads as the epoch; the refill step treats
        // a backwards jump as zero elapsed time.
        SystemTime::now().duration_since(UNIX_EPOCH).map(duration_to_nanos).unwrap_or(0)
    }
}

/// Caller-controlled time source
///
/// Clones share the same timeline, so a test can keep one handle and hand
/// another to the bucket.
#[derive(Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a manual clock starting at `start_nanos`
    pub fn new(start_nanos: u64) -> Self {
        Self { nanos: Arc::new(AtomicU64::new(start_nanos)) }
    }

    /// Jump to an absolute timestamp
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(duration_to_nanos(by), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline(always)]
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("nanos", &self.now_nanos()).finish()
    }
}

/// Convert seconds to nanoseconds
#[inline(always)]
pub const fn secs_to_nanos(secs: u64) -> u64 {
    secs * 1_000_000_000
}

/// Convert milliseconds to nanoseconds
#[inline(always)]
pub const fn millis_to_nanos(millis: u64) -> u64 {
    millis * 1_000_000
}

/// Convert a duration to nanoseconds, saturating at `u64::MAX` (~584 years)
#[inline(always)]
pub fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
