use actix_web::http::header::RETRY_AFTER;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use std::time::Duration;
use thiserror::Error;

/// The message carried by [ThrottleError::RetryCapExceeded].
pub const RETRY_CAP_EXCEEDED_MESSAGE: &str = "Loop limit was reached";

/// Failure of [RequestThrottler::acquire_with_wait](crate::RequestThrottler::acquire_with_wait).
#[derive(Debug, Error)]
pub enum ThrottleError<E> {
    /// The quota stayed exhausted for every attempt allowed by the attempt cap.
    #[error("Loop limit was reached")]
    RetryCapExceeded {
        /// Number of consumption attempts made.
        attempts: u32,
        /// The wait suggested by the final exhausted attempt.
        retry_after: Duration,
    },
    /// The quota gate failed, this is never retried.
    #[error(transparent)]
    Gate(E),
}

impl<E> ThrottleError<E> {
    pub fn is_retry_cap_exceeded(&self) -> bool {
        matches!(self, Self::RetryCapExceeded { .. })
    }

    /// Recover the quota gate's original error, if that was the cause.
    pub fn into_gate_error(self) -> Option<E> {
        match self {
            Self::Gate(e) => Some(e),
            Self::RetryCapExceeded { .. } => None,
        }
    }
}

impl<E> ResponseError for ThrottleError<E>
where
    E: ResponseError + std::error::Error + 'static,
{
    fn status_code(&self) -> StatusCode {
        match self {
            Self::RetryCapExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Gate(e) => e.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            Self::RetryCapExceeded { retry_after, .. } => {
                retry_cap_exceeded_response(*retry_after)
            }
            Self::Gate(e) => e.error_response(),
        }
    }
}

/// Status 429 with a `retry-after` header, and the retry cap message as the body.
pub(crate) fn retry_cap_exceeded_response(retry_after: Duration) -> HttpResponse {
    HttpResponse::TooManyRequests()
        .insert_header((RETRY_AFTER, seconds_rounded_up(retry_after)))
        .body(RETRY_CAP_EXCEEDED_MESSAGE)
}

/// Rounded upwards, so that the quota is guaranteed to be available after waiting.
pub(crate) fn seconds_rounded_up(duration: Duration) -> u64 {
    let millis = duration.as_millis() as f64;
    (millis / 1000f64).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[derive(Debug, Error, PartialEq)]
    #[error("Gate unavailable")]
    struct GateError;

    impl ResponseError for GateError {
        fn status_code(&self) -> StatusCode {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }

    #[test]
    fn test_seconds_rounded_up() {
        assert_eq!(seconds_rounded_up(Duration::ZERO), 0);
        assert_eq!(seconds_rounded_up(Duration::from_secs(42)), 42);
        // Verify rounded upwards from 30.1
        assert_eq!(seconds_rounded_up(Duration::from_secs_f64(30.1)), 31);
    }

    #[test]
    fn test_messages() {
        let err: ThrottleError<GateError> = ThrottleError::RetryCapExceeded {
            attempts: 1,
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "Loop limit was reached");
        assert_eq!(err.to_string(), RETRY_CAP_EXCEEDED_MESSAGE);
        assert!(err.is_retry_cap_exceeded());
        assert!(err.into_gate_error().is_none());

        // Gate errors keep their own message
        let err = ThrottleError::Gate(GateError);
        assert_eq!(err.to_string(), "Gate unavailable");
        assert!(!err.is_retry_cap_exceeded());
        assert_eq!(err.into_gate_error(), Some(GateError));
    }

    #[actix_web::test]
    async fn test_error_response() {
        let err: ThrottleError<GateError> = ThrottleError::RetryCapExceeded {
            attempts: 3,
            retry_after: Duration::from_secs_f64(29.9),
        };
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "30");
        let body = to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, "Loop limit was reached");

        let err = ThrottleError::Gate(GateError);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            err.error_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
