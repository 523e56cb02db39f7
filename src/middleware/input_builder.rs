use crate::middleware::ThrottleInput;
use actix_web::dev::ServiceRequest;
use actix_web::ResponseError;
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use thiserror::Error;

type SubjectFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type ThrottleInputFuture = Ready<Result<ThrottleInput, actix_web::Error>>;

enum SubjectPart {
    RealIp,
    PeerIp,
    Custom(SubjectFn),
}

/// Builds an input function that throttles every request under one policy key.
///
/// The subject is made from the parts added, in the order they were added, joined with `-`.
/// Write your own input function when the policy depends on the request or the subject needs an
/// asynchronous lookup.
pub struct ThrottleInputFunctionBuilder {
    policy_key: String,
    parts: Vec<SubjectPart>,
}

impl ThrottleInputFunctionBuilder {
    /// `policy_key` must be registered with the throttler before the first request.
    pub fn new(policy_key: &str) -> Self {
        Self {
            policy_key: policy_key.to_owned(),
            parts: Vec::new(),
        }
    }

    /// Throttle per client IP as reported by
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr).
    ///
    /// Only trust this behind a proxy you control, the forwarding headers are client supplied
    /// otherwise. IPv6 clients share a subject per /64.
    pub fn real_ip_key(mut self) -> Self {
        self.parts.push(SubjectPart::RealIp);
        self
    }

    /// Throttle per connection peer IP. IPv6 clients share a subject per /64.
    pub fn peer_ip_key(mut self) -> Self {
        self.parts.push(SubjectPart::PeerIp);
        self
    }

    /// Add a subject part taken from the request, e.g. an API key or user id
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.parts.push(SubjectPart::Custom(Box::new(f)));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> ThrottleInputFuture + 'static {
        move |req| ready(self.input(req))
    }

    fn input(&self, req: &ServiceRequest) -> Result<ThrottleInput, actix_web::Error> {
        if self.parts.is_empty() {
            return Err(Error::EmptySubject.into());
        }
        let mut subject = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            subject.push(match part {
                SubjectPart::RealIp => {
                    let info = req.connection_info();
                    ip_key(info.realip_remote_addr().ok_or(Error::MissingAddress)?)?
                }
                SubjectPart::PeerIp => {
                    let info = req.connection_info();
                    ip_key(info.peer_addr().ok_or(Error::MissingAddress)?)?
                }
                SubjectPart::Custom(f) => f(req)?,
            });
        }
        Ok(ThrottleInput {
            policy_key: self.policy_key.clone(),
            subject_id: subject.join("-"),
        })
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIp(#[from] AddrParseError),
    #[error("The remote address of the request is unknown")]
    MissingAddress,
    #[error("No parts were added to the throttle subject")]
    EmptySubject,
}

impl ResponseError for Error {}

// One subject per IPv4 address, and per /64 for IPv6 since a single client usually holds a
// whole /64. IPv4-mapped IPv6 addresses count as their IPv4 address.
fn ip_key(ip_str: &str) -> Result<String, Error> {
    Ok(match ip_str.parse::<IpAddr>()? {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => {
                let [a, b, c, d, ..] = v6.segments();
                format!("{}/64", Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0))
            }
        },
    })
}
