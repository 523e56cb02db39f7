#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
mod middleware;
pub mod policy;
mod throttler;

pub use middleware::builder::{ThrottleBuilder, X_THROTTLE_ATTEMPTS, X_THROTTLE_WAITED};
pub use middleware::input_builder::{ThrottleInputFunctionBuilder, ThrottleInputFuture};
pub use middleware::{Throttle, ThrottleInput, ThrottleMiddleware};
pub use throttler::{
    Acquired, RequestThrottler, ThrottleError, ThrottlerBuilder, RETRY_CAP_EXCEEDED_MESSAGE,
};
