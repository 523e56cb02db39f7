use crate::backend::{QuotaGate, RateLimitRegistry};
use crate::middleware::{
    AllowedTransformation, DeniedResponse, RollbackCondition, Throttle, ThrottleInput,
};
use crate::throttler::{retry_cap_exceeded_response, Acquired, RequestThrottler};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

pub static X_THROTTLE_ATTEMPTS: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-throttle-attempts"));

pub static X_THROTTLE_WAITED: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-throttle-waited"));

pub struct ThrottleBuilder<R, G, F> {
    throttler: RequestThrottler<R, G>,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<R, G, F, O> ThrottleBuilder<R, G, F>
where
    R: RateLimitRegistry + 'static,
    G: QuotaGate + 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<ThrottleInput, actix_web::Error>>,
{
    pub(super) fn new(throttler: RequestThrottler<R, G>, input_fn: F) -> Self {
        Self {
            throttler,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_attempts: u32, retry_after: Duration| {
                retry_cap_exceeded_response(retry_after)
            }),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the quota gate returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [ThrottleBuilder::request_allowed_transformation] function, such that the
    /// following headers are set in allowed responses:
    ///
    /// - `x-throttle-attempts` (attempts needed to acquire the quota)\
    /// - `x-throttle-waited` (milliseconds spent waiting for the quota)
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(throttle_headers));
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers, given how the quota was acquired and
    /// whether it was released again by the [ThrottleBuilder::rollback_condition].
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [Acquired] report will be [None] if the quota gate failed and
    /// [ThrottleBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&Acquired>, bool) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the attempt cap is reached, configure the [HttpResponse] returned.
    ///
    /// The function is given the number of attempts made and the wait suggested by the last one.
    ///
    /// Defaults to status 429 with a `retry-after` header and a "Loop limit was reached" body.
    pub fn request_denied_response<D>(mut self, denied_response: D) -> Self
    where
        D: Fn(u32, Duration) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// After processing a request, release the acquired quota based on the status code of the
    /// returned response.
    ///
    /// By default the quota is never released.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Configures the [ThrottleBuilder::rollback_condition] to release if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status: StatusCode| status.is_server_error()));
        self
    }

    pub fn build(self) -> Throttle<R, G, F> {
        Throttle {
            throttler: Rc::new(self.throttler),
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
            rollback_condition: self.rollback_condition,
        }
    }
}

fn throttle_headers(map: &mut HeaderMap, acquired: Option<&Acquired>, _released: bool) {
    if let Some(acquired) = acquired {
        map.insert(
            X_THROTTLE_ATTEMPTS.clone(),
            HeaderValue::from(acquired.attempts),
        );
        map.insert(
            X_THROTTLE_WAITED.clone(),
            HeaderValue::from(acquired.waited.as_millis() as u64),
        );
    }
}
