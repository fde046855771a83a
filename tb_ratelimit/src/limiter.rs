use crate::error::Result;

/// Core trait for keyed rate limiters
///
/// Lets request handlers hold an `Arc<dyn KeyedLimiter>` without caring how
/// the limiter is configured or which clock it reads.
pub trait KeyedLimiter: Send + Sync {
    /// Try to take `amount` tokens for `key` without blocking, returning the
    /// tokens left
    fn try_take(&self, key: &str, amount: u64) -> Result<u64>;

    /// Try to take a single token for `key`
    fn try_take_one(&self, key: &str) -> Result<u64> {
        self.try_take(key, 1)
    }

    /// Maximum tokens a key can hold
    fn capacity(&self) -> u64;
}
