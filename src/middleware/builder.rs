use crate::middleware::input_builder::EnforceInput;
use crate::middleware::{DeniedResponse, RateLimiter};
use crate::resolver::{Decision, RateLimitResolver};
use actix_web::dev::ServiceRequest;
use actix_web::HttpResponse;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

pub struct RateLimiterBuilder<F> {
    resolver: Arc<RateLimitResolver>,
    input_fn: F,
    fail_open: bool,
    denied_response: Rc<DeniedResponse>,
}

impl<F, O> RateLimiterBuilder<F>
where
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<EnforceInput, actix_web::Error>>,
{
    pub(super) fn new(resolver: Arc<RateLimitResolver>, input_fn: F) -> Self {
        Self {
            resolver,
            input_fn,
            fail_open: false,
            denied_response: Rc::new(Decision::denied_response),
        }
    }

    /// Choose whether to allow a request if the resolver returns a failure.
    ///
    /// An unreachable shared store is never a failure here, the resolver falls back to its
    /// in-memory engine instead. Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to [Decision::denied_response], a 429 with a JSON body and the rate limit headers.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&Decision) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    pub fn build(self) -> RateLimiter<F> {
        RateLimiter {
            resolver: self.resolver,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            denied_response: self.denied_response,
        }
    }
}
