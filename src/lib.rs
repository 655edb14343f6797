#![cfg_attr(docsrs, feature(doc_cfg))]
//! Audience-aware token bucket rate limiting for actix-web.
//!
//! Every request is checked against a per-identity bucket, chosen by the operation [Kind] and the
//! caller's [Audience], and a coarse per-IP bucket shared by all kinds. Buckets live in Redis
//! when available, and in process memory when it is not.

pub mod backend;
pub mod clock;
pub mod config;
mod middleware;
pub mod policy;
pub mod resolver;

pub use config::RateLimitConfig;
pub use middleware::builder::RateLimiterBuilder;
pub use middleware::input_builder::{EnforceInput, EnforceInputBuilder, EnforceInputFuture};
pub use middleware::RateLimiter;
pub use policy::identity::Identity;
pub use policy::{Audience, Kind, Policy};
pub use resolver::{Decision, FallbackMode, RateLimitResolver};
