//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max client messages per second (inputs, attacks, acks, pongs)
pub const MESSAGE_RATE_LIMIT: u32 = 120;

/// Per-connection rate limiter state
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    message_limiter: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        Self::with_limit(MESSAGE_RATE_LIMIT)
    }

    pub fn with_limit(per_second: u32) -> Self {
        Self {
            message_limiter: create_limiter(per_second),
        }
    }

    /// Check if a client message is allowed (returns true if allowed)
    pub fn check_message(&self) -> bool {
        self.message_limiter.check().is_ok()
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_beyond_quota_is_rejected() {
        let limiter = ConnectionRateLimiter::with_limit(5);
        let allowed = (0..20).filter(|_| limiter.check_message()).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn exhausted_quota_rejects_next_message() {
        let limiter = ConnectionRateLimiter::with_limit(3);
        assert!((0..3).all(|_| limiter.check_message()));
        assert!(!limiter.check_message());
    }

    #[test]
    fn zero_quota_still_admits_one() {
        let limiter = ConnectionRateLimiter::with_limit(0);
        assert!(limiter.check_message());
    }
}
