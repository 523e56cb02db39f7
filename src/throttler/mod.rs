mod error;

pub(crate) use error::retry_cap_exceeded_response;
pub use error::{ThrottleError, RETRY_CAP_EXCEEDED_MESSAGE};

use crate::backend::{Consumption, QuotaGate, RateLimitRegistry};
use std::time::Duration;

/// Reported by a successful [RequestThrottler::acquire_with_wait].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Acquired {
    /// Number of consumption attempts made, including the successful one.
    pub attempts: u32,
    /// Total time spent waiting between attempts.
    pub waited: Duration,
}

/// Waits for quota instead of failing as soon as a rate limit is reached.
///
/// The throttler holds no quota state of its own, everything is delegated to the
/// [RateLimitRegistry] and [QuotaGate]. Concurrent callers each run their own retry loop;
/// mutual exclusion over the quota counters is the responsibility of the gate.
#[derive(Clone, Debug)]
pub struct RequestThrottler<R, G> {
    registry: R,
    gate: G,
    attempt_cap: Option<u32>,
}

impl<R, G> RequestThrottler<R, G>
where
    R: RateLimitRegistry,
    G: QuotaGate,
{
    /// Create a throttler with no attempt cap.
    pub fn new(registry: R, gate: G) -> Self {
        Self::builder(registry, gate).build()
    }

    pub fn builder(registry: R, gate: G) -> ThrottlerBuilder<R, G> {
        ThrottlerBuilder {
            registry,
            gate,
            attempt_cap: None,
        }
    }

    /// Register a named rate limit policy.
    ///
    /// The rules are forwarded to the registry as given, registry errors are returned unchanged.
    pub async fn register_policy(
        &self,
        policy_key: &str,
        rate_limits: Vec<R::RateLimit>,
    ) -> Result<(), R::Error> {
        self.registry
            .register_rate_limits(policy_key, rate_limits)
            .await
    }

    /// Consume one unit of quota, waiting for it to become available if necessary.
    ///
    /// Each time the gate reports the quota as exhausted, the attempt is counted and the
    /// suggested wait is slept before trying again. Once the number of attempts reaches the
    /// attempt cap, [ThrottleError::RetryCapExceeded] is returned instead. The cap is read once,
    /// when the call starts.
    ///
    /// Errors from the gate are never retried, they are returned as [ThrottleError::Gate].
    ///
    /// On success exactly one unit of quota is held, which can be given back with
    /// [RequestThrottler::release].
    pub async fn acquire_with_wait(
        &self,
        policy_key: &str,
        subject_id: &str,
    ) -> Result<Acquired, ThrottleError<G::Error>> {
        let attempt_cap = self.attempt_cap;
        let mut attempts = 0u32;
        let mut waited = Duration::ZERO;
        loop {
            let wait = match self.gate.check_and_increase(policy_key, subject_id).await {
                Ok(Consumption::Granted) => {
                    return Ok(Acquired {
                        attempts: attempts.saturating_add(1),
                        waited,
                    });
                }
                Ok(Consumption::Exhausted { wait }) => wait,
                Err(e) => return Err(ThrottleError::Gate(e)),
            };
            attempts = attempts.saturating_add(1);
            if attempt_cap.is_some_and(|cap| attempts >= cap) {
                log::warn!(
                    "Gave up waiting for quota on {policy_key} for {subject_id} after {attempts} attempts"
                );
                return Err(ThrottleError::RetryCapExceeded {
                    attempts,
                    retry_after: wait,
                });
            }
            log::debug!(
                "Quota exhausted on {policy_key} for {subject_id} (attempt {attempts}), retrying in {wait:?}"
            );
            actix_web::rt::time::sleep(wait).await;
            waited = waited.saturating_add(wait);
        }
    }

    /// Give back one unit of quota previously acquired.
    pub async fn release(&self, policy_key: &str, subject_id: &str) -> Result<(), G::Error> {
        self.gate.decrease(policy_key, subject_id).await
    }

    /// Clear all quota state for the pair.
    pub async fn reset_all(&self, policy_key: &str, subject_id: &str) -> Result<(), G::Error> {
        self.gate.reset(policy_key, subject_id).await
    }
}

impl<R, G> RequestThrottler<R, G> {
    /// Set the maximum number of consumption attempts for subsequent calls to
    /// [RequestThrottler::acquire_with_wait].
    ///
    /// A cap of 1 fails on the first exhaustion without waiting, a cap of 0 behaves the same.
    pub fn set_attempt_cap(&mut self, attempt_cap: u32) {
        self.attempt_cap = Some(attempt_cap);
    }

    /// Remove the attempt cap, so that [RequestThrottler::acquire_with_wait] waits indefinitely.
    pub fn clear_attempt_cap(&mut self) {
        self.attempt_cap = None;
    }

    pub fn attempt_cap(&self) -> Option<u32> {
        self.attempt_cap
    }
}

impl<B> RequestThrottler<B, B>
where
    B: RateLimitRegistry + QuotaGate + Clone,
{
    /// Create a throttler from a store that acts as both registry and gate.
    pub fn from_backend(backend: B) -> Self {
        Self::new(backend.clone(), backend)
    }
}

pub struct ThrottlerBuilder<R, G> {
    registry: R,
    gate: G,
    attempt_cap: Option<u32>,
}

impl<R, G> ThrottlerBuilder<R, G>
where
    R: RateLimitRegistry,
    G: QuotaGate,
{
    /// Limit the number of consumption attempts per acquire.
    ///
    /// Default is None (unbounded).
    pub fn attempt_cap(mut self, attempt_cap: Option<u32>) -> Self {
        self.attempt_cap = attempt_cap;
        self
    }

    pub fn build(self) -> RequestThrottler<R, G> {
        RequestThrottler {
            registry: self.registry,
            gate: self.gate,
            attempt_cap: self.attempt_cap,
        }
    }
}
