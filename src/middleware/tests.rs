use crate::backend::{BackendError, BucketBackend, BucketInput, BucketOutcome, StoreConnector};
use crate::clock::ManualClock;
use crate::middleware::input_builder::{EnforceInput, EnforceInputBuilder};
use crate::middleware::*;
use crate::policy::identity::Identity;
use crate::policy::{Audience, Kind};
use actix_web::http::header::RETRY_AFTER;
use actix_web::http::StatusCode;
use actix_web::test::{read_body, read_body_json, TestRequest};
use actix_web::{get, test, App, HttpResponse, Responder};
use async_trait::async_trait;
use std::time::Duration;

#[get("/listings")]
async fn create_listing() -> impl Responder {
    HttpResponse::Ok().body("Hello world!")
}

#[get("/custom")]
async fn custom_headers() -> impl Responder {
    HttpResponse::Ok()
        .insert_header(("ratelimit-limit", "custom"))
        .body("Hello world!")
}

fn resolver(clock: &ManualClock) -> Arc<RateLimitResolver> {
    Arc::new(
        RateLimitResolver::builder()
            .clock(Arc::new(clock.clone()))
            .fallback_gc_interval(None)
            .build()
            .unwrap(),
    )
}

fn get(ip: &str) -> TestRequest {
    TestRequest::get()
        .uri("/listings")
        .insert_header(("x-forwarded-for", ip))
}

struct MalformedStore;

#[async_trait]
impl BucketBackend for MalformedStore {
    async fn consume(&self, _input: BucketInput) -> Result<BucketOutcome, BackendError> {
        Err(BackendError::MalformedResponse("Nil".to_string()))
    }

    async fn remove_key(&self, _key: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for MalformedStore {
    async fn connect(&self) -> Result<Arc<dyn BucketBackend>, BackendError> {
        Ok(Arc::new(MalformedStore))
    }
}

#[actix_web::test]
async fn test_allow_deny() {
    let clock = ManualClock::new(1_700_000_000_000);
    let input_fn = EnforceInputBuilder::new(Kind::CreateListing).build();
    let limiter = RateLimiter::builder(resolver(&clock), input_fn).build();
    let app = test::init_service(App::new().service(create_listing).wrap(limiter)).await;

    for remaining in (0..5).rev() {
        let response = test::call_service(&app, get("203.0.113.7").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("ratelimit-limit").unwrap(), "5");
        assert_eq!(
            headers.get("ratelimit-remaining").unwrap(),
            &remaining.to_string()
        );
        assert_eq!(headers.get("ratelimit-reset").unwrap(), "60");
        assert!(!headers.contains_key(RETRY_AFTER));
    }

    let response = test::call_service(&app, get("203.0.113.7").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "60");
    assert_eq!(response.headers().get("ratelimit-remaining").unwrap(), "0");
    let body: serde_json::Value = read_body_json(response).await;
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["kind"], "create_listing");
    assert_eq!(body["audience"], "community");
    assert_eq!(body["retryAfterSec"], 60);

    // Another client is unaffected
    let response = test::call_service(&app, get("203.0.113.8").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);

    clock.advance(Duration::from_secs(60));
    let response = test::call_service(&app, get("203.0.113.7").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_custom_deny_response() {
    let clock = ManualClock::new(1_700_000_000_000);
    let input_fn = EnforceInputBuilder::new(Kind::CreateListing).tokens(6).build();
    let limiter = RateLimiter::builder(resolver(&clock), input_fn)
        .request_denied_response(|decision| {
            HttpResponse::build(StatusCode::IM_A_TEAPOT)
                .body(format!("Custom denied response for {}", decision.kind))
        })
        .build();
    let app = test::init_service(App::new().service(create_listing).wrap(limiter)).await;
    let response = test::call_service(&app, get("203.0.113.7").to_request()).await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    let body = String::from_utf8(read_body(response).await.to_vec()).unwrap();
    assert_eq!(body, "Custom denied response for create_listing");
}

#[actix_web::test]
async fn test_existing_headers_are_kept() {
    let clock = ManualClock::new(1_700_000_000_000);
    let input_fn = EnforceInputBuilder::new(Kind::Search).build();
    let limiter = RateLimiter::builder(resolver(&clock), input_fn).build();
    let app = test::init_service(App::new().service(custom_headers).wrap(limiter)).await;
    let request = TestRequest::get()
        .uri("/custom")
        .peer_addr("203.0.113.7:5000".parse().unwrap())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("ratelimit-limit").unwrap(), "custom");
    assert_eq!(response.headers().get("ratelimit-remaining").unwrap(), "59");
}

#[actix_web::test]
async fn test_input_fn_failure() {
    let clock = ManualClock::new(1_700_000_000_000);
    let input_fn = EnforceInputBuilder::new(Kind::Search).build();
    let limiter = RateLimiter::builder(resolver(&clock), input_fn).build();
    let app = test::init_service(App::new().service(create_listing).wrap(limiter)).await;
    // Neither a forwarded nor a peer address
    let request = TestRequest::get().uri("/listings").to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[actix_web::test]
async fn test_fail_open() {
    let clock = ManualClock::new(1_700_000_000_000);
    let resolver = Arc::new(
        RateLimitResolver::builder()
            .clock(Arc::new(clock))
            .shared_store(Arc::new(MalformedStore))
            .fallback_gc_interval(None)
            .build()
            .unwrap(),
    );
    let input_fn = |req: &ServiceRequest| {
        let input = Identity::from_request(req.request(), None).map(|identity| EnforceInput {
            kind: Kind::Search,
            audience: Audience::Community,
            identity,
            tokens: 1,
        });
        futures::future::ready(input.map_err(actix_web::Error::from))
    };

    // Test first without fail open
    let limiter = RateLimiter::builder(resolver.clone(), input_fn).build();
    let app = test::init_service(App::new().service(create_listing).wrap(limiter)).await;
    let response = test::call_service(&app, get("203.0.113.7").to_request()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Test again with fail open enabled
    let limiter = RateLimiter::builder(resolver.clone(), input_fn)
        .fail_open(true)
        .build();
    let app = test::init_service(App::new().service(create_listing).wrap(limiter)).await;
    let response = test::call_service(&app, get("203.0.113.7").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    // No decision, so no headers
    assert!(!response.headers().contains_key("ratelimit-limit"));
    // A malformed reply is not an outage
    assert!(!resolver.is_degraded());
}
