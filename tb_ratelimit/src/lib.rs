//! # tb_ratelimit
//!
//! Per-key token bucket rate limiting. A [`Bucket`] tracks an independent
//! token count for every key it sees, refilling each continuously up to a
//! shared capacity.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod key_state;
pub mod limiter;
pub mod store;

pub use bucket::Bucket;
pub use bucket::BucketBuilder;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use config::BucketConfig;
pub use config::RefillMode;
pub use error::RateLimitError;
pub use error::Result;
pub use key_state::KeyState;
pub use limiter::KeyedLimiter;
pub use store::Store;
