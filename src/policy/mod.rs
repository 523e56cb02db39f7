use std::time::Duration;

/// A single fixed window rule within a rate limit policy.
///
/// A policy is an ordered list of these; a unit of quota is only granted when every rule in the
/// policy still has room.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct RateLimit {
    /// The total requests to be allowed within the interval.
    pub max_requests: u64,
    /// The rate limiting interval.
    pub interval: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u64, interval: Duration) -> Self {
        Self {
            max_requests,
            interval,
        }
    }

    pub fn per_second(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn per_hour(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(60 * 60))
    }
}
