use crate::backend::policies::{bucket_key, PolicyTable, MIN_WAIT};
use crate::backend::{Consumption, QuotaGate, RateLimitRegistry};
use crate::policy::RateLimit;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use actix_web::{HttpResponse, ResponseError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No rate limits are registered for policy: {0}")]
    UnknownPolicy(String),
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// A fixed window rate limit store that uses [DashMap](dashmap::DashMap) to keep counters
/// in memory.
///
/// Implements both [RateLimitRegistry] and [QuotaGate], clones share the same state.
///
/// # Concurrency
///
/// Each rule of a policy is a separate counter. An attempt increments every rule first and
/// undoes all of them when any rule is exhausted, so between those two steps the attempt is
/// visible to other callers. On a multi-rule policy a concurrent caller may therefore be refused
/// by an attempt that is about to be undone. It then waits and retries like any other refusal.
#[derive(Clone)]
pub struct InMemoryBackend {
    policies: PolicyTable,
    map: Arc<DashMap<String, Value>>,
    gc_handle: Option<Arc<GcHandle>>,
}

struct Value {
    ttl: Instant,
    count: u64,
}

// Aborts the garbage collector once the last clone of the backend is dropped.
struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    fn garbage_collector(map: Arc<DashMap<String, Value>>, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                map.retain(|_k, v| v.ttl > now);
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }

    fn rate_limits(&self, policy_key: &str) -> Result<Arc<[RateLimit]>, Error> {
        self.policies
            .get(policy_key)
            .ok_or_else(|| Error::UnknownPolicy(policy_key.to_owned()))
    }

    /// Returns the count after incrementing, and the expiry of the current window.
    fn increment(&self, key: String, interval: Duration, now: Instant) -> (u64, Instant) {
        let mut count = 1;
        let mut expiry = now
            .checked_add(interval)
            .expect("Interval unexpectedly large");
        self.map
            .entry(key)
            .and_modify(|v| {
                // If this bucket hasn't yet expired, increment and extract the count/expiry
                if v.ttl > now {
                    v.count += 1;
                    count = v.count;
                    expiry = v.ttl;
                } else {
                    // If this bucket has expired we will reset the count to 1 and set a new TTL.
                    v.ttl = expiry;
                    v.count = count;
                }
            })
            .or_insert_with(|| Value {
                // If the bucket doesn't exist, create it with a count of 1, and set the TTL.
                ttl: expiry,
                count,
            });
        (count, expiry)
    }

    fn decrement(&self, key: String) {
        self.map.entry(key).and_modify(|v| {
            v.count = v.count.saturating_sub(1);
        });
    }
}

impl RateLimitRegistry for InMemoryBackend {
    type RateLimit = RateLimit;
    type Error = Error;

    async fn register_rate_limits(
        &self,
        policy_key: &str,
        rate_limits: Vec<RateLimit>,
    ) -> Result<(), Self::Error> {
        self.policies.register(policy_key, rate_limits);
        Ok(())
    }
}

impl QuotaGate for InMemoryBackend {
    type Error = Error;

    async fn check_and_increase(
        &self,
        policy_key: &str,
        subject_id: &str,
    ) -> Result<Consumption, Self::Error> {
        let rate_limits = self.rate_limits(policy_key)?;
        let now = Instant::now();
        let mut wait: Option<Duration> = None;
        for (index, rate_limit) in rate_limits.iter().enumerate() {
            let key = bucket_key(policy_key, subject_id, index);
            let (count, expiry) = self.increment(key, rate_limit.interval, now);
            if count > rate_limit.max_requests {
                let until_reset = expiry.saturating_duration_since(now).max(MIN_WAIT);
                wait = Some(wait.map_or(until_reset, |w| w.max(until_reset)));
            }
        }
        let Some(wait) = wait else {
            return Ok(Consumption::Granted);
        };
        // Nothing is consumed on exhaustion, so undo the increments of every rule
        for index in 0..rate_limits.len() {
            self.decrement(bucket_key(policy_key, subject_id, index));
        }
        Ok(Consumption::Exhausted { wait })
    }

    async fn decrease(&self, policy_key: &str, subject_id: &str) -> Result<(), Self::Error> {
        let rate_limits = self.rate_limits(policy_key)?;
        for index in 0..rate_limits.len() {
            self.decrement(bucket_key(policy_key, subject_id, index));
        }
        Ok(())
    }

    async fn reset(&self, policy_key: &str, subject_id: &str) -> Result<(), Self::Error> {
        let rate_limits = self.rate_limits(policy_key)?;
        for index in 0..rate_limits.len() {
            self.map.remove(&bucket_key(policy_key, subject_id, index));
        }
        Ok(())
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired buckets.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<String, Value>::new());
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(GcHandle(InMemoryBackend::garbage_collector(
                map.clone(),
                gc_interval,
            )))
        });
        InMemoryBackend {
            policies: PolicyTable::default(),
            map,
            gc_handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const POLICY: &str = "use-case";
    const SUBJECT: &str = "user-1";

    async fn make_backend(rate_limits: Vec<RateLimit>) -> InMemoryBackend {
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        backend
            .register_rate_limits(POLICY, rate_limits)
            .await
            .unwrap();
        backend
    }

    #[actix_web::test]
    async fn test_allow_deny() {
        tokio::time::pause();
        let backend = make_backend(vec![RateLimit::new(5, MINUTE)]).await;
        for _ in 0..5 {
            // First 5 should be granted
            let consumption = backend.check_and_increase(POLICY, SUBJECT).await.unwrap();
            assert!(consumption.is_granted());
        }
        // Sixth should be exhausted, with the full window left to wait
        let consumption = backend.check_and_increase(POLICY, SUBJECT).await.unwrap();
        assert_eq!(consumption, Consumption::Exhausted { wait: MINUTE });
        // Other subjects have their own quota
        let consumption = backend.check_and_increase(POLICY, "user-2").await.unwrap();
        assert!(consumption.is_granted());
    }

    #[actix_web::test]
    async fn test_window_expiry() {
        tokio::time::pause();
        let backend = make_backend(vec![RateLimit::new(1, MINUTE)]).await;
        assert!(backend
            .check_and_increase(POLICY, SUBJECT)
            .await
            .unwrap()
            .is_granted());
        tokio::time::advance(Duration::from_secs(20)).await;
        // The suggested wait should be what is left of the window
        assert_eq!(
            backend.check_and_increase(POLICY, SUBJECT).await.unwrap(),
            Consumption::Exhausted {
                wait: Duration::from_secs(40)
            }
        );
        tokio::time::advance(Duration::from_secs(40)).await;
        // We want to be sure the key is still present, and we are testing the expiry logic
        assert!(backend.map.contains_key(&bucket_key(POLICY, SUBJECT, 0)));
        assert!(backend
            .check_and_increase(POLICY, SUBJECT)
            .await
            .unwrap()
            .is_granted());
    }

    #[actix_web::test]
    async fn test_exhaustion_consumes_nothing() {
        tokio::time::pause();
        let backend = make_backend(vec![
            RateLimit::new(10, Duration::from_secs(1)),
            RateLimit::new(2, MINUTE),
        ])
        .await;
        for _ in 0..2 {
            assert!(backend
                .check_and_increase(POLICY, SUBJECT)
                .await
                .unwrap()
                .is_granted());
        }
        for _ in 0..3 {
            // The per-minute rule is exhausted, so the wait is set by it
            assert_eq!(
                backend.check_and_increase(POLICY, SUBJECT).await.unwrap(),
                Consumption::Exhausted { wait: MINUTE }
            );
        }
        // The per-second rule must not have counted the denied attempts
        assert_eq!(
            backend.map.get(&bucket_key(POLICY, SUBJECT, 0)).unwrap().count,
            2
        );
        assert_eq!(
            backend.map.get(&bucket_key(POLICY, SUBJECT, 1)).unwrap().count,
            2
        );
    }

    #[actix_web::test]
    async fn test_wait_never_zero() {
        tokio::time::pause();
        let backend = make_backend(vec![RateLimit::new(1, MINUTE)]).await;
        backend.check_and_increase(POLICY, SUBJECT).await.unwrap();
        // Right before the window closes there is still something to wait for
        tokio::time::advance(MINUTE - Duration::from_millis(1)).await;
        assert_eq!(
            backend.check_and_increase(POLICY, SUBJECT).await.unwrap(),
            Consumption::Exhausted {
                wait: Duration::from_millis(1)
            }
        );

        // A rule that never has room, and a window that is already over when it is opened
        backend
            .register_rate_limits("closed", vec![RateLimit::new(0, Duration::ZERO)])
            .await
            .unwrap();
        assert_eq!(
            backend.check_and_increase("closed", SUBJECT).await.unwrap(),
            Consumption::Exhausted { wait: MIN_WAIT }
        );
    }

    #[actix_web::test]
    async fn test_sub_second_window() {
        tokio::time::pause();
        let interval = Duration::from_millis(500);
        let backend = make_backend(vec![RateLimit::new(1, interval)]).await;
        backend.check_and_increase(POLICY, SUBJECT).await.unwrap();
        assert_eq!(
            backend.check_and_increase(POLICY, SUBJECT).await.unwrap(),
            Consumption::Exhausted { wait: interval }
        );
        tokio::time::advance(interval).await;
        assert!(backend
            .check_and_increase(POLICY, SUBJECT)
            .await
            .unwrap()
            .is_granted());
    }

    #[actix_web::test]
    async fn test_colon_separated_keys_do_not_collide() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        for policy in ["a", "a:b"] {
            backend
                .register_rate_limits(policy, vec![RateLimit::per_minute(1)])
                .await
                .unwrap();
        }
        // Joined with ':' both pairs would read "a:b:0:0"
        assert!(backend
            .check_and_increase("a", "b:0")
            .await
            .unwrap()
            .is_granted());
        assert!(backend
            .check_and_increase("a:b", "0")
            .await
            .unwrap()
            .is_granted());
        // Each pair still has its own quota
        assert!(backend
            .check_and_increase("a", "b:0")
            .await
            .unwrap()
            .is_exhausted());
        assert!(backend
            .check_and_increase("a:b", "0")
            .await
            .unwrap()
            .is_exhausted());

        // IPv6 subjects contain ':' as well
        backend
            .register_rate_limits("api", vec![RateLimit::per_minute(1)])
            .await
            .unwrap();
        backend
            .register_rate_limits("api:2a00", vec![RateLimit::per_minute(1)])
            .await
            .unwrap();
        assert!(backend
            .check_and_increase("api", "2a00:1450:4009:81f::/64")
            .await
            .unwrap()
            .is_granted());
        assert!(backend
            .check_and_increase("api:2a00", "1450:4009:81f::/64")
            .await
            .unwrap()
            .is_granted());
    }

    #[actix_web::test]
    async fn test_longest_wait_wins() {
        tokio::time::pause();
        let backend = make_backend(vec![
            RateLimit::new(1, Duration::from_secs(1)),
            RateLimit::new(1, MINUTE),
        ])
        .await;
        backend.check_and_increase(POLICY, SUBJECT).await.unwrap();
        assert_eq!(
            backend.check_and_increase(POLICY, SUBJECT).await.unwrap(),
            Consumption::Exhausted { wait: MINUTE }
        );
    }

    #[actix_web::test]
    async fn test_decrease() {
        tokio::time::pause();
        let backend = make_backend(vec![RateLimit::new(1, MINUTE)]).await;
        assert!(backend
            .check_and_increase(POLICY, SUBJECT)
            .await
            .unwrap()
            .is_granted());
        backend.decrease(POLICY, SUBJECT).await.unwrap();
        // The released unit can be consumed again
        assert!(backend
            .check_and_increase(POLICY, SUBJECT)
            .await
            .unwrap()
            .is_granted());
        // Releasing more than was consumed must not go negative
        backend.decrease(POLICY, SUBJECT).await.unwrap();
        backend.decrease(POLICY, SUBJECT).await.unwrap();
        assert_eq!(
            backend.map.get(&bucket_key(POLICY, SUBJECT, 0)).unwrap().count,
            0
        );
    }

    #[actix_web::test]
    async fn test_reset() {
        tokio::time::pause();
        let backend = make_backend(vec![RateLimit::new(1, MINUTE)]).await;
        backend.check_and_increase(POLICY, SUBJECT).await.unwrap();
        assert!(backend
            .check_and_increase(POLICY, SUBJECT)
            .await
            .unwrap()
            .is_exhausted());
        backend.reset(POLICY, SUBJECT).await.unwrap();
        assert!(!backend.map.contains_key(&bucket_key(POLICY, SUBJECT, 0)));
        // Counter should have been reset
        assert!(backend
            .check_and_increase(POLICY, SUBJECT)
            .await
            .unwrap()
            .is_granted());
    }

    #[actix_web::test]
    async fn test_unknown_policy() {
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        let err = backend
            .check_and_increase("missing", SUBJECT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPolicy(ref key) if key == "missing"));
        assert!(backend.decrease("missing", SUBJECT).await.is_err());
        assert!(backend.reset("missing", SUBJECT).await.is_err());
    }

    #[actix_web::test]
    async fn test_garbage_collection() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder()
            .with_gc_interval(Some(MINUTE))
            .build();
        backend
            .register_rate_limits("short", vec![RateLimit::new(1, MINUTE)])
            .await
            .unwrap();
        backend
            .register_rate_limits("long", vec![RateLimit::new(1, MINUTE * 2)])
            .await
            .unwrap();
        backend.check_and_increase("short", SUBJECT).await.unwrap();
        backend.check_and_increase("long", SUBJECT).await.unwrap();
        assert!(backend.map.contains_key(&bucket_key("short", SUBJECT, 0)));
        assert!(backend.map.contains_key(&bucket_key("long", SUBJECT, 0)));
        // Advance time such that the garbage collector runs,
        // the expired short bucket should be cleaned, but the long one should remain.
        tokio::time::advance(MINUTE).await;
        assert!(!backend.map.contains_key(&bucket_key("short", SUBJECT, 0)));
        assert!(backend.map.contains_key(&bucket_key("long", SUBJECT, 0)));
    }

    #[actix_web::test]
    async fn test_gc_survives_clone_drop() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder()
            .with_gc_interval(Some(MINUTE))
            .build();
        backend
            .register_rate_limits(POLICY, vec![RateLimit::new(1, MINUTE)])
            .await
            .unwrap();
        backend.check_and_increase(POLICY, SUBJECT).await.unwrap();
        // Dropping a clone must not stop the collector for the remaining handles
        drop(backend.clone());
        tokio::time::advance(MINUTE).await;
        assert!(!backend.map.contains_key(&bucket_key(POLICY, SUBJECT, 0)));
    }
}
