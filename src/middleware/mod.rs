pub mod builder;
pub mod input_builder;

use crate::backend::{QuotaGate, RateLimitRegistry};
use crate::throttler::{Acquired, RequestThrottler, ThrottleError};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use builder::ThrottleBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::time::Duration;
use std::{future::Future, rc::Rc};

type AllowedTransformation = dyn Fn(&mut HeaderMap, Option<&Acquired>, bool);
type DeniedResponse = dyn Fn(u32, Duration) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// Identifies the quota a request should consume.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ThrottleInput {
    /// The registered policy to apply.
    pub policy_key: String,
    /// Who the quota is consumed on behalf of.
    pub subject_id: String,
}

/// Throttling middleware.
///
/// Unlike a plain rate limiter, requests that find the quota exhausted are held back until quota
/// becomes available, using [RequestThrottler::acquire_with_wait]. They are only rejected once the
/// throttler's attempt cap is reached.
pub struct Throttle<R, G, F> {
    throttler: Rc<RequestThrottler<R, G>>,
    input_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<R, G, F> Clone for Throttle<R, G, F> {
    fn clone(&self) -> Self {
        Self {
            throttler: self.throttler.clone(),
            input_fn: self.input_fn.clone(),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        }
    }
}

impl<R, G, F, O> Throttle<R, G, F>
where
    R: RateLimitRegistry + 'static,
    G: QuotaGate + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<ThrottleInput, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `throttler`: The throttler to acquire quota from, its attempt cap applies to each request.
    /// * `input_fn`: A future that produces the policy key and subject based on the incoming
    ///   request.
    pub fn builder(throttler: RequestThrottler<R, G>, input_fn: F) -> ThrottleBuilder<R, G, F> {
        ThrottleBuilder::new(throttler, input_fn)
    }
}

impl<S, B, R, G, F, O> Transform<S, ServiceRequest> for Throttle<R, G, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    R: RateLimitRegistry + 'static,
    G: QuotaGate + 'static,
    G::Error: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<ThrottleInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = ThrottleMiddleware<S, R, G, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ThrottleMiddleware {
            service: Rc::new(RefCell::new(service)),
            throttler: self.throttler.clone(),
            input_fn: Rc::clone(&self.input_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        })
    }
}

pub struct ThrottleMiddleware<S, R, G, F> {
    service: Rc<RefCell<S>>,
    throttler: Rc<RequestThrottler<R, G>>,
    input_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<S, B, R, G, F, O> Service<ServiceRequest> for ThrottleMiddleware<S, R, G, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    R: RateLimitRegistry + 'static,
    G: QuotaGate + 'static,
    G::Error: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<ThrottleInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let throttler = self.throttler.clone();
        let input_fn = self.input_fn.clone();
        let fail_open = self.fail_open;
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();
        let rollback_condition = self.rollback_condition.clone();

        Box::pin(async move {
            let input = match (input_fn)(&req).await {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Throttle input function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let acquired = match throttler
                .acquire_with_wait(&input.policy_key, &input.subject_id)
                .await
            {
                Ok(acquired) => Some(acquired),
                Err(ThrottleError::RetryCapExceeded {
                    attempts,
                    retry_after,
                }) => {
                    let response: HttpResponse = (denied_response)(attempts, retry_after);
                    return Ok(req.into_response(response).map_into_right_body());
                }
                // Unable to query the quota gate
                Err(ThrottleError::Gate(e)) => {
                    if fail_open {
                        log::warn!("Quota gate failed: {}, allowing the request anyway", e);
                        None
                    } else {
                        log::error!("Quota gate failed: {}", e);
                        return Ok(req
                            .into_response(e.into().error_response())
                            .map_into_right_body());
                    }
                }
            };

            let mut service_response = service.call(req).await?;

            let mut released = false;
            if acquired.is_some() {
                if let Some(rollback_condition) = rollback_condition {
                    let status = service_response.status();
                    if rollback_condition(status) {
                        if let Err(e) = throttler
                            .release(&input.policy_key, &input.subject_id)
                            .await
                        {
                            log::error!(
                                "Unable to release quota for response: {:?}, error: {e}",
                                status
                            );
                        } else {
                            released = true;
                        };
                    }
                }
            }

            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), acquired.as_ref(), released);
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
