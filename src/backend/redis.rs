use crate::backend::policies::{bucket_key, PolicyTable, MIN_WAIT};
use crate::backend::{Consumption, QuotaGate, RateLimitRegistry};
use crate::policy::RateLimit;
use actix_web::{HttpResponse, ResponseError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const BITFIELD_ENCODING: &str = "u63";
const BITFIELD_OFFSET: u8 = 0;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[error("Unexpected negative TTL response for the rate limit key")]
    NegativeTtl,
    #[error("No rate limits are registered for policy: {0}")]
    UnknownPolicy(String),
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// A fixed window rate limit store that keeps its counters in Redis.
///
/// Counters are shared by every process using the same Redis instance, but registered policies
/// are local to this backend (and its clones), so each process must register its own.
///
/// Windows are kept with millisecond precision. When Redis fails part way through an attempt,
/// the rules already incremented are undone on a best-effort basis before the error is returned.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    policies: PolicyTable,
}

impl RedisBackend {
    /// Create a RedisBackendBuilder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_wait_throttle::backend::redis::RedisBackend;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let backend = RedisBackend::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    fn make_key(&self, policy_key: &str, subject_id: &str, index: usize) -> String {
        let key = bucket_key(policy_key, subject_id, index);
        match &self.key_prefix {
            None => key,
            Some(prefix) => format!("{prefix}{key}"),
        }
    }

    fn rate_limits(&self, policy_key: &str) -> Result<Arc<[RateLimit]>, Error> {
        self.policies
            .get(policy_key)
            .ok_or_else(|| Error::UnknownPolicy(policy_key.to_owned()))
    }

    /// Returns the count after incrementing, and the time left until the window resets.
    async fn increment(&self, key: &str, interval: Duration) -> Result<(u64, Duration), Error> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut pipe = redis::pipe();
        pipe.atomic()
            // Increment the rate limit count
            .cmd("BITFIELD")
            .arg(key)
            .arg("OVERFLOW")
            .arg("SAT")
            .arg("INCRBY")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(1)
            .arg("GET")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            // Set the key to expire (only if it doesn't already have an expiry)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(interval_ms)
            .arg("NX")
            .ignore()
            // Return time-to-live of key in milliseconds
            .cmd("PTTL")
            .arg(key);

        let mut con = self.connection.clone();
        let (counts, pttl): (Vec<u64>, i64) = pipe.query_async(&mut con).await?;
        if pttl < 0 {
            return Err(Error::NegativeTtl);
        }
        let count = *counts.first().expect("BITFIELD should return one value");
        Ok((count, Duration::from_millis(pttl as u64)))
    }

    async fn decrement(&self, key: &str) -> Result<(), Error> {
        let mut con = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Decrement the rate limit count
            .cmd("BITFIELD")
            .arg(key)
            .arg("OVERFLOW")
            .arg("SAT")
            .arg("INCRBY")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(-1)
            // Set the key to expire immediately, if it doesn't already have an expiry
            .cmd("EXPIRE")
            .arg(key)
            .arg(0)
            .arg("NX")
            .ignore();

        let () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    /// Decrements every key, even when some fail. Returns the first failure.
    async fn decrement_all(&self, keys: &[String]) -> Result<(), Error> {
        let mut result = Ok(());
        for key in keys {
            if let Err(e) = self.decrement(key).await {
                log::error!("Failed to decrement rate limit key {key}: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this backend.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisBackend {
        RedisBackend {
            connection: self.connection,
            key_prefix: self.key_prefix,
            policies: PolicyTable::default(),
        }
    }
}

impl RateLimitRegistry for RedisBackend {
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

impl QuotaGate for RedisBackend {
    type Error = Error;

    async fn check_and_increase(
        &self,
        policy_key: &str,
        subject_id: &str,
    ) -> Result<Consumption, Self::Error> {
        let rate_limits = self.rate_limits(policy_key)?;
        let mut incremented = Vec::with_capacity(rate_limits.len());
        let mut wait: Option<Duration> = None;
        for (index, rate_limit) in rate_limits.iter().enumerate() {
            let key = self.make_key(policy_key, subject_id, index);
            let result = self.increment(&key, rate_limit.interval).await;
            match result {
                Ok((count, until_reset)) => {
                    incremented.push(key);
                    if count > rate_limit.max_requests {
                        let until_reset = until_reset.max(MIN_WAIT);
                        wait = Some(wait.map_or(until_reset, |w| w.max(until_reset)));
                    }
                }
                Err(e) => {
                    // The caller holds nothing, failures here are logged by decrement_all
                    let _ = self.decrement_all(&incremented).await;
                    return Err(e);
                }
            }
        }
        let Some(wait) = wait else {
            return Ok(Consumption::Granted);
        };
        // Nothing is consumed on exhaustion, so undo the increments of every rule
        self.decrement_all(&incremented).await?;
        Ok(Consumption::Exhausted { wait })
    }

    async fn decrease(&self, policy_key: &str, subject_id: &str) -> Result<(), Self::Error> {
        let rate_limits = self.rate_limits(policy_key)?;
        let keys: Vec<String> = (0..rate_limits.len())
            .map(|index| self.make_key(policy_key, subject_id, index))
            .collect();
        self.decrement_all(&keys).await
    }

    /// Note that the key prefix (if set) is automatically included.
    async fn reset(&self, policy_key: &str, subject_id: &str) -> Result<(), Self::Error> {
        let rate_limits = self.rate_limits(policy_key)?;
        let keys: Vec<String> = (0..rate_limits.len())
            .map(|index| self.make_key(policy_key, subject_id, index))
            .collect();
        let mut con = self.connection.clone();
        let () = con.del(keys).await?;
        Ok(())
    }
}
