use crate::backend::BucketOutcome;
use crate::policy::{Audience, Kind};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde::Serialize;

pub static RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("ratelimit-limit"));

pub static RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("ratelimit-remaining"));

pub static RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("ratelimit-reset"));

/// The combined outcome of the per-identity and per-IP gates for one request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Capacity of the per-identity bucket.
    pub limit: u64,
    /// The smaller of the two buckets' remaining tokens.
    pub remaining: u64,
    /// Zero when allowed, otherwise at least one.
    pub retry_after_seconds: u64,
    /// When both buckets are full again, in epoch seconds.
    pub reset_at_epoch_seconds: u64,
    /// Seconds from the time of the decision until `reset_at_epoch_seconds` (rounded upwards, so
    /// that it is guaranteed to be reset after waiting for the duration).
    pub reset_after_seconds: u64,
    pub kind: Kind,
    pub audience: Audience,
}

impl Decision {
    /// Merges the primary and secondary gates: both must allow, and the tighter one is reported.
    pub fn merge(
        kind: Kind,
        audience: Audience,
        limit: u64,
        primary: &BucketOutcome,
        secondary: &BucketOutcome,
        now_ms: u64,
    ) -> Self {
        let allowed = primary.allowed && secondary.allowed;
        let reset_at_ms = primary.reset_at_ms.max(secondary.reset_at_ms);
        let retry_after_seconds = if allowed {
            0
        } else {
            let retry_ms = primary.retry_after_ms.max(secondary.retry_after_ms);
            ceil_seconds(retry_ms).max(1)
        };
        Self {
            allowed,
            limit,
            remaining: primary.remaining.min(secondary.remaining),
            retry_after_seconds,
            reset_at_epoch_seconds: ceil_seconds(reset_at_ms),
            reset_after_seconds: ceil_seconds(reset_at_ms.saturating_sub(now_ms)),
            kind,
            audience,
        }
    }

    /// The decision returned while rate limiting is switched off.
    pub fn unlimited(kind: Kind, audience: Audience, now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            retry_after_seconds: 0,
            reset_at_epoch_seconds: ceil_seconds(now_ms),
            reset_after_seconds: 0,
            kind,
            audience,
        }
    }

    /// Adds the rate limit headers to `map`, leaving any header that is already present alone.
    ///
    /// - `ratelimit-limit`
    /// - `ratelimit-remaining`
    /// - `ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until the request could succeed)
    pub fn apply_headers(&self, map: &mut HeaderMap) {
        let mut insert = |name: HeaderName, value: u64| {
            if !map.contains_key(&name) {
                map.insert(name, HeaderValue::from(value));
            }
        };
        insert(RATELIMIT_LIMIT.clone(), self.limit);
        insert(RATELIMIT_REMAINING.clone(), self.remaining);
        insert(RATELIMIT_RESET.clone(), self.reset_after_seconds);
        if !self.allowed {
            insert(RETRY_AFTER, self.retry_after_seconds);
        }
    }

    pub fn denial_body(&self) -> DenialBody {
        DenialBody {
            error: "rate_limited",
            kind: self.kind,
            audience: self.audience,
            retry_after_sec: self.retry_after_seconds,
            message: format!(
                "Too many {} requests, retry in {} seconds",
                self.kind, self.retry_after_seconds
            ),
        }
    }

    /// A 429 response carrying the headers and a JSON [DenialBody].
    pub fn denied_response(&self) -> HttpResponse {
        let mut response = HttpResponse::TooManyRequests().json(self.denial_body());
        self.apply_headers(response.headers_mut());
        response
    }
}

/// JSON body of a denied request.
#[derive(Debug, Clone, Serialize)]
pub struct DenialBody {
    pub error: &'static str,
    pub kind: Kind,
    pub audience: Audience,
    #[serde(rename = "retryAfterSec")]
    pub retry_after_sec: u64,
    pub message: String,
}

fn ceil_seconds(ms: u64) -> u64 {
    (ms + 999) / 1000
}
