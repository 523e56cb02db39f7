#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "dashmap")]
mod policies;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use std::future::Future;
use std::time::Duration;

/// The outcome of a single attempt to consume one unit of quota.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Consumption {
    /// One unit of quota was consumed and is now held by the caller.
    Granted,
    /// No quota is available; nothing was consumed.
    Exhausted {
        /// How long the caller should wait before trying again.
        wait: Duration,
    },
}

impl Consumption {
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn is_exhausted(self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Registers named rate limit policies with a rate limiting store.
///
/// Like [QuotaGate], implementations are expected to be cheap to [Clone] and safe to share
/// between concurrent callers.
pub trait RateLimitRegistry {
    /// A single rule descriptor within a policy, opaque to the
    /// [RequestThrottler](crate::RequestThrottler).
    type RateLimit;
    type Error;

    /// Register (or re-register) the rules for a policy key.
    ///
    /// The rules must be stored in the order given.
    fn register_rate_limits(
        &self,
        policy_key: &str,
        rate_limits: Vec<Self::RateLimit>,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}

/// Consumes, releases and resets quota for a `(policy key, subject id)` pair.
///
/// All mutual exclusion over the quota counters is the responsibility of the implementation, the
/// [RequestThrottler](crate::RequestThrottler) calls it concurrently without any locking of its
/// own.
pub trait QuotaGate {
    type Error;

    /// Attempt to consume one unit of quota.
    ///
    /// Running out of quota is not an error: it is reported as [Consumption::Exhausted] along
    /// with a suggested wait. Errors are reserved for failures of the store itself.
    fn check_and_increase(
        &self,
        policy_key: &str,
        subject_id: &str,
    ) -> impl Future<Output = Result<Consumption, Self::Error>>;

    /// Give back one previously consumed unit of quota.
    ///
    /// E.g. We may not want a request that failed due to a server error to count against a user's
    /// rate limit, we can only know that after having consumed the quota, so we must deduct from
    /// the counter afterwards.
    fn decrease(
        &self,
        policy_key: &str,
        subject_id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Clear all quota state held for the pair.
    fn reset(
        &self,
        policy_key: &str,
        subject_id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumption_predicates() {
        assert!(Consumption::Granted.is_granted());
        assert!(!Consumption::Granted.is_exhausted());
        let exhausted = Consumption::Exhausted {
            wait: Duration::from_secs(42),
        };
        assert!(exhausted.is_exhausted());
        assert!(!exhausted.is_granted());
    }
}
