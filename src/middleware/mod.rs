pub mod builder;
pub mod input_builder;
#[cfg(test)]
mod tests;

use crate::resolver::{Decision, RateLimitResolver};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{HttpResponse, ResponseError};
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use input_builder::EnforceInput;
use std::cell::RefCell;
use std::sync::Arc;
use std::{future::Future, rc::Rc};

type DeniedResponse = dyn Fn(&Decision) -> HttpResponse;

/// Rate limit middleware.
pub struct RateLimiter<F> {
    resolver: Arc<RateLimitResolver>,
    input_fn: Rc<F>,
    fail_open: bool,
    denied_response: Rc<DeniedResponse>,
}

impl<F> Clone for RateLimiter<F> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            input_fn: self.input_fn.clone(),
            fail_open: self.fail_open,
            denied_response: self.denied_response.clone(),
        }
    }
}

impl<F, O> RateLimiter<F>
where
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<EnforceInput, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `resolver`: Resolves the policies and holds the bucket engines, usually shared by every
    ///   worker.
    /// * `input_fn`: A future that produces the kind, audience and identity of the incoming
    ///   request, see [EnforceInputBuilder](input_builder::EnforceInputBuilder).
    pub fn builder(resolver: Arc<RateLimitResolver>, input_fn: F) -> RateLimiterBuilder<F> {
        RateLimiterBuilder::new(resolver, input_fn)
    }
}

impl<S, B, F, O> Transform<S, ServiceRequest> for RateLimiter<F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<EnforceInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            resolver: self.resolver.clone(),
            input_fn: Rc::clone(&self.input_fn),
            fail_open: self.fail_open,
            denied_response: self.denied_response.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, F> {
    service: Rc<RefCell<S>>,
    resolver: Arc<RateLimitResolver>,
    input_fn: Rc<F>,
    fail_open: bool,
    denied_response: Rc<DeniedResponse>,
}

impl<S, B, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<EnforceInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let resolver = self.resolver.clone();
        let input_fn = self.input_fn.clone();
        let fail_open = self.fail_open;
        let denied_response = self.denied_response.clone();

        Box::pin(async move {
            let input = match (input_fn)(&req).await {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Rate limiter input function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let decision = match resolver
                .enforce(input.kind, input.audience, &input.identity, input.tokens)
                .await
            {
                Ok(decision) => {
                    if !decision.allowed {
                        let response: HttpResponse = (denied_response)(&decision);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    Some(decision)
                }
                // Integrity errors reach here, connectivity errors were already absorbed
                Err(e) => {
                    if fail_open {
                        log::warn!("Rate limiter failed: {}, allowing the request anyway", e);
                        None
                    } else {
                        log::error!("Rate limiter failed: {}", e);
                        return Ok(req.into_response(e.error_response()).map_into_right_body());
                    }
                }
            };

            let mut service_response = service.call(req).await?;
            if let Some(decision) = decision {
                decision.apply_headers(service_response.headers_mut());
            }
            Ok(service_response.map_into_left_body())
        })
    }
}
