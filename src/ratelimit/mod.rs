//! Rate limiting algorithms and their persisted state.

mod compound;
mod factory;
mod fixed_window;
mod limiter;
mod policy;
mod sliding_window;
mod storage;
mod token_bucket;

pub use compound::CompoundLimiter;
pub use factory::RateLimiterFactory;
pub use fixed_window::FixedWindowLimiter;
pub use limiter::{Limiter, NoLimiter, RateLimit, DEFAULT_LOCK_WAIT};
pub use policy::{parse_interval, Rate, RateLimitPolicy};
pub use sliding_window::SlidingWindowLimiter;
pub use storage::{DbStorage, LimiterState, Storage};
pub use token_bucket::TokenBucketLimiter;
