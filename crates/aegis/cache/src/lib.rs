//! Cache & limiter layer: TTL-bound entries over an external key/value
//! service, with the three consumers the engine contract names — the
//! fixed-window rate limiter, the single-use OTP store, and the
//! idempotency-result cache.

#![deny(unsafe_code)]

mod error;
pub mod idempotency;
pub mod kv;
pub mod limiter;
pub mod otp;

pub use error::{CacheError, CacheResult};
pub use idempotency::{fingerprint, IdempotencyCache};
pub use kv::{Counter, KeyValueStore, MemoryKv};
pub use limiter::{RateDecision, RateLimiter, RateLimiterConfig};
pub use otp::OtpStore;
