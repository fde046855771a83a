use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::Limits;
use crate::config::RefillMode;
use crate::error::RateLimitError;
use crate::error::Result;

/// Token accounting for a single key
///
/// All fields sit behind one mutex, so refill, check and debit for a key
/// happen as a single step. Different keys never share this lock.
#[derive(Debug)]
pub struct KeyState {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Available tokens, always within `[0, capacity]`
    tokens: u64,

    /// Timestamp the refill was last credited up to
    last_check: u64,

    /// Timestamp of the most recent refill attempt, used for idle eviction.
    /// Never behind `last_check`.
    last_seen: u64,

    /// Set once the store has dropped this entry
    retired: bool,
}

impl KeyState {
    /// Create a full key state as of `now`
    pub fn new(capacity: u64, now: u64) -> Self {
        Self { inner: Mutex::new(Inner { tokens: capacity, last_check: now, last_seen: now, retired: false }) }
    }

    /// Refill, then debit `amount` tokens
    ///
    /// Returns the tokens left on success. A denied take keeps the refill.
    /// Returns `None` if the state was retired, in which case the caller must
    /// look the key up again.
    pub(crate) fn take(&self, amount: u64, limits: &Limits, clock: &dyn Clock) -> Option<Result<u64>> {
        let mut inner = self.inner.lock();
        if inner.retired {
            return None;
        }

        let now = clock.now_nanos();
        inner.refill(now, limits);

        if amount > inner.tokens {
            return Some(Err(RateLimitError::TokensExceeded { requested: amount, available: inner.tokens }));
        }

        inner.tokens -= amount;
        Some(Ok(inner.tokens))
    }

    /// Tokens available right now, after refill, without debiting
    pub(crate) fn available(&self, limits: &Limits, clock: &dyn Clock) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.retired {
            return None;
        }

        inner.refill(clock.now_nanos(), limits);
        Some(inner.tokens)
    }

    /// Mark the state retired if it has not been used for `idle_nanos`
    pub(crate) fn retire_if_idle(&self, now: u64, idle_nanos: u64) -> bool {
        let mut inner = self.inner.lock();
        if now.saturating_sub(inner.last_seen) < idle_nanos {
            return false;
        }

        inner.retired = true;
        true
    }

    pub(crate) fn retire(&self) {
        self.inner.lock().retired = true;
    }

    /// Token count as of the last operation, without refilling
    #[cfg(test)]
    pub(crate) fn tokens(&self) -> u64 {
        self.inner.lock().tokens
    }

    /// Timestamp the refill was last credited up to
    #[cfg(test)]
    pub(crate) fn last_check(&self) -> u64 {
        self.inner.lock().last_check
    }
}

impl Inner {
    #[inline(always)]
    fn refill(&mut self, now: u64, limits: &Limits) {
        self.last_seen = self.last_seen.max(now);

        // A clock that went backwards counts as no time passing
        let elapsed = now.saturating_sub(self.last_check);
        if elapsed == 0 {
            return;
        }

        let tokens_to_add = limits.tokens_for(elapsed);
        if tokens_to_add == 0 {
            return;
        }

        let refilled = self.tokens.saturating_add(tokens_to_add);
        if refilled >= limits.capacity {
            self.tokens = limits.capacity;
            self.last_check = now;
            return;
        }

        self.tokens = refilled;
        self.last_check = match limits.refill {
            RefillMode::Truncate => now,
            RefillMode::Carry => self.last_check + limits.nanos_for(tokens_to_add).min(elapsed),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::clock::millis_to_nanos;
    use crate::clock::secs_to_nanos;

    fn limits(capacity: u64, interval: Duration, refill: RefillMode) -> Limits {
        Limits::new(capacity, interval, refill, None).unwrap()
    }

    #[test]
    fn test_starts_full() {
        let clock = ManualClock::new(secs_to_nanos(100));
        let state = KeyState::new(10, clock.now_nanos());

        assert_eq!(state.tokens(), 10);
        assert_eq!(state.last_check(), secs_to_nanos(100));
    }

    #[test]
    fn test_take_debits() {
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(3600), RefillMode::Truncate);
        let state = KeyState::new(10, 0);

        assert_eq!(state.take(3, &limits, &clock), Some(Ok(7)));
        assert_eq!(state.take(7, &limits, &clock), Some(Ok(0)));
        assert_eq!(state.take(1, &limits, &clock), Some(Err(RateLimitError::TokensExceeded { requested: 1, available: 0 })));
    }

    #[test]
    fn test_zero_amount() {
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(1), RefillMode::Truncate);
        let state = KeyState::new(10, 0);

        assert_eq!(state.take(0, &limits, &clock), Some(Ok(10)));
    }

    #[test]
    fn test_denied_take_keeps_refill() {
        // 1 token per second
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(10), RefillMode::Truncate);
        let state = KeyState::new(10, 0);

        assert_eq!(state.take(10, &limits, &clock), Some(Ok(0)));

        clock.advance(Duration::from_secs(3));
        assert_eq!(state.take(5, &limits, &clock), Some(Err(RateLimitError::TokensExceeded { requested: 5, available: 3 })));
        assert_eq!(state.tokens(), 3);
        assert_eq!(state.last_check(), secs_to_nanos(3));
    }

    #[test]
    fn test_refill_clamps_to_capacity() {
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(10), RefillMode::Truncate);
        let state = KeyState::new(10, 0);

        assert_eq!(state.take(2, &limits, &clock), Some(Ok(8)));

        clock.advance(Duration::from_secs(1_000));
        assert_eq!(state.available(&limits, &clock), Some(10));
    }

    #[test]
    fn test_truncate_drops_fraction() {
        // 1 token per second
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(10), RefillMode::Truncate);
        let state = KeyState::new(10, 0);
        assert_eq!(state.take(10, &limits, &clock), Some(Ok(0)));

        clock.set(millis_to_nanos(1_500));
        assert_eq!(state.take(1, &limits, &clock), Some(Ok(0)));
        assert_eq!(state.last_check(), millis_to_nanos(1_500));

        // Half a second since the last credit is not enough
        clock.set(millis_to_nanos(2_000));
        assert!(state.take(1, &limits, &clock).unwrap().is_err());
    }

    #[test]
    fn test_carry_keeps_fraction() {
        // 1 token per second
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(10), RefillMode::Carry);
        let state = KeyState::new(10, 0);
        assert_eq!(state.take(10, &limits, &clock), Some(Ok(0)));

        clock.set(millis_to_nanos(1_500));
        assert_eq!(state.take(1, &limits, &clock), Some(Ok(0)));
        assert_eq!(state.last_check(), secs_to_nanos(1));

        // The leftover half second completes the next token
        clock.set(millis_to_nanos(2_000));
        assert_eq!(state.take(1, &limits, &clock), Some(Ok(0)));
        assert_eq!(state.last_check(), secs_to_nanos(2));
    }

    #[test]
    fn test_carry_snaps_when_full() {
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(10), RefillMode::Carry);
        let state = KeyState::new(10, 0);
        assert_eq!(state.take(1, &limits, &clock), Some(Ok(9)));

        clock.set(millis_to_nanos(5_500));
        assert_eq!(state.available(&limits, &clock), Some(10));
        assert_eq!(state.last_check(), millis_to_nanos(5_500));
    }

    #[test]
    fn test_clock_going_backwards() {
        let clock = ManualClock::new(secs_to_nanos(10));
        let limits = limits(10, Duration::from_secs(10), RefillMode::Truncate);
        let state = KeyState::new(10, clock.now_nanos());
        assert_eq!(state.take(10, &limits, &clock), Some(Ok(0)));

        clock.set(secs_to_nanos(5));
        assert!(state.take(1, &limits, &clock).unwrap().is_err());
        assert_eq!(state.last_check(), secs_to_nanos(10));
    }

    #[test]
    fn test_retire_if_idle() {
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(1), RefillMode::Truncate);
        let state = KeyState::new(10, 0);

        clock.set(secs_to_nanos(5));
        assert_eq!(state.take(1, &limits, &clock), Some(Ok(9)));

        assert!(!state.retire_if_idle(secs_to_nanos(6), secs_to_nanos(2)));
        assert!(state.retire_if_idle(secs_to_nanos(7), secs_to_nanos(2)));

        assert_eq!(state.take(1, &limits, &clock), None);
        assert_eq!(state.available(&limits, &clock), None);
    }

    #[test]
    fn test_peek_counts_as_activity() {
        let clock = ManualClock::new(0);
        let limits = limits(10, Duration::from_secs(10), RefillMode::Truncate);
        let state = KeyState::new(10, 0);
        assert_eq!(state.take(10, &limits, &clock), Some(Ok(0)));

        clock.set(millis_to_nanos(9_500));
        assert_eq!(state.available(&limits, &clock), Some(9));

        // Only half a token has accrued since the peek, so the key is not idle
        assert!(!state.retire_if_idle(secs_to_nanos(10), secs_to_nanos(10)));
    }
}
