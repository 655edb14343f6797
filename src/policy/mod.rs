//! Rate limit policies indexed by operation kind and audience.

pub mod audience;
pub mod identity;

use crate::backend::BucketParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("Unknown rate limit kind: {0}")]
    UnknownKind(String),
    #[error("Unknown audience: {0}")]
    UnknownAudience(String),
    #[error("Invalid policy for {kind}/{audience}: {reason}")]
    Invalid {
        kind: String,
        audience: String,
        reason: &'static str,
    },
    #[error("Invalid rate limit multiplier: {0}")]
    InvalidMultiplier(f64),
}

/// The logical operation being rate limited.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    CreateListing,
    UpdateListing,
    SendMessage,
    ReportContent,
    Search,
    Login,
}

impl Kind {
    pub const ALL: [Kind; 6] = [
        Kind::CreateListing,
        Kind::UpdateListing,
        Kind::SendMessage,
        Kind::ReportContent,
        Kind::Search,
        Kind::Login,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::CreateListing => "create_listing",
            Kind::UpdateListing => "update_listing",
            Kind::SendMessage => "send_message",
            Kind::ReportContent => "report_content",
            Kind::Search => "search",
            Kind::Login => "login",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PolicyError::UnknownKind(s.to_owned()))
    }
}

/// The tenant class of a caller, ordered from least to most generous.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    #[default]
    Community,
    Campus,
    Partner,
    Staff,
}

impl Audience {
    pub const ALL: [Audience; 4] = [
        Audience::Community,
        Audience::Campus,
        Audience::Partner,
        Audience::Staff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Audience::Community => "community",
            Audience::Campus => "campus",
            Audience::Partner => "partner",
            Audience::Staff => "staff",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Audience::ALL
            .into_iter()
            .find(|audience| audience.as_str() == s)
            .ok_or_else(|| PolicyError::UnknownAudience(s.to_owned()))
    }
}

/// Capacity and refill schedule for one bucket.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum tokens, i.e. the largest burst.
    pub capacity: u64,
    /// Tokens credited per refill interval.
    pub refill_amount: u64,
    pub refill_interval_sec: u64,
    /// Scales the capacity (not the refill rate) to allow larger bursts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_multiplier: Option<f64>,
}

impl Policy {
    pub const fn new(capacity: u64, refill_amount: u64, refill_interval_sec: u64) -> Self {
        Self {
            capacity,
            refill_amount,
            refill_interval_sec,
            burst_multiplier: None,
        }
    }

    /// Refills the whole capacity once per interval.
    pub const fn per_interval(capacity: u64, refill_interval_sec: u64) -> Self {
        Self::new(capacity, capacity, refill_interval_sec)
    }

    pub fn with_burst_multiplier(mut self, burst_multiplier: f64) -> Self {
        self.burst_multiplier = Some(burst_multiplier);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.capacity == 0 {
            return Err("capacity must be non-zero");
        }
        if self.refill_amount == 0 {
            return Err("refill amount must be non-zero");
        }
        if self.refill_interval_sec == 0 {
            return Err("refill interval must be non-zero");
        }
        match self.burst_multiplier {
            Some(m) if !(m.is_finite() && m > 0.0) => Err("burst multiplier must be positive"),
            _ => Ok(()),
        }
    }

    /// Bucket parameters after applying the burst multiplier and the global `multiplier`.
    ///
    /// Scaled values are floored and never drop below one.
    pub fn params(&self, multiplier: f64) -> BucketParams {
        let scale = |value: u64, factor: f64| ((value as f64 * factor).floor() as u64).max(1);
        BucketParams {
            capacity: scale(self.capacity, multiplier * self.burst_multiplier.unwrap_or(1.0)),
            refill_amount: scale(self.refill_amount, multiplier),
            refill_interval_ms: self.refill_interval_sec.saturating_mul(1000),
        }
    }
}

/// Policy overrides keyed by kind and audience, as found in configuration.
pub type PolicyOverrides = HashMap<Kind, HashMap<Audience, Policy>>;

/// A total mapping of every (kind, audience) pair to resolved bucket parameters.
///
/// Built and validated once; lookups cannot fail.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: [[BucketParams; Audience::ALL.len()]; Kind::ALL.len()],
}

impl PolicyTable {
    /// Builds the table from the built-in defaults with `overrides` applied on top.
    pub fn new(overrides: &PolicyOverrides, multiplier: f64) -> Result<Self, PolicyError> {
        validate_multiplier(multiplier)?;
        let placeholder = BucketParams {
            capacity: 1,
            refill_amount: 1,
            refill_interval_ms: 1000,
        };
        let mut entries = [[placeholder; Audience::ALL.len()]; Kind::ALL.len()];
        for kind in Kind::ALL {
            for audience in Audience::ALL {
                let policy = overrides
                    .get(&kind)
                    .and_then(|per_audience| per_audience.get(&audience))
                    .copied()
                    .unwrap_or_else(|| default_policy(kind, audience));
                policy.validate().map_err(|reason| PolicyError::Invalid {
                    kind: kind.to_string(),
                    audience: audience.to_string(),
                    reason,
                })?;
                entries[kind.index()][audience.index()] = policy.params(multiplier);
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, kind: Kind, audience: Audience) -> BucketParams {
        self.entries[kind.index()][audience.index()]
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut entries = [[Policy::per_interval(1, 1).params(1.0); Audience::ALL.len()];
            Kind::ALL.len()];
        for kind in Kind::ALL {
            for audience in Audience::ALL {
                entries[kind.index()][audience.index()] =
                    default_policy(kind, audience).params(1.0);
            }
        }
        Self { entries }
    }
}

pub(crate) fn validate_multiplier(multiplier: f64) -> Result<(), PolicyError> {
    if multiplier.is_finite() && multiplier > 0.0 {
        Ok(())
    } else {
        Err(PolicyError::InvalidMultiplier(multiplier))
    }
}

/// The generous per-IP gate applied to every kind.
pub const DEFAULT_SECONDARY_POLICY: Policy = Policy::per_interval(300, 60);

/// Built-in limits, per minute unless noted.
pub fn default_policy(kind: Kind, audience: Audience) -> Policy {
    use Audience::*;
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * 60;
    match (kind, audience) {
        (Kind::CreateListing, Community) => Policy::per_interval(5, MINUTE),
        (Kind::CreateListing, Campus) => Policy::per_interval(10, MINUTE),
        (Kind::CreateListing, Partner) => Policy::per_interval(30, MINUTE),
        (Kind::CreateListing, Staff) => Policy::per_interval(120, MINUTE),

        (Kind::UpdateListing, Community) => Policy::per_interval(20, MINUTE),
        (Kind::UpdateListing, Campus) => Policy::per_interval(40, MINUTE),
        (Kind::UpdateListing, Partner) => Policy::per_interval(120, MINUTE),
        (Kind::UpdateListing, Staff) => Policy::per_interval(300, MINUTE),

        (Kind::SendMessage, Community) => Policy::new(10, 1, 6).with_burst_multiplier(2.0),
        (Kind::SendMessage, Campus) => Policy::new(20, 1, 3).with_burst_multiplier(2.0),
        (Kind::SendMessage, Partner) => Policy::per_interval(60, MINUTE),
        (Kind::SendMessage, Staff) => Policy::per_interval(200, MINUTE),

        (Kind::ReportContent, Community) => Policy::per_interval(10, HOUR),
        (Kind::ReportContent, Campus) => Policy::per_interval(20, HOUR),
        (Kind::ReportContent, Partner) => Policy::per_interval(50, HOUR),
        (Kind::ReportContent, Staff) => Policy::per_interval(500, HOUR),

        (Kind::Search, Community) => Policy::per_interval(60, MINUTE),
        (Kind::Search, Campus) => Policy::per_interval(120, MINUTE),
        (Kind::Search, Partner) => Policy::per_interval(300, MINUTE),
        (Kind::Search, Staff) => Policy::per_interval(600, MINUTE),

        (Kind::Login, Staff) => Policy::new(10, 1, 30),
        (Kind::Login, _) => Policy::new(5, 1, MINUTE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in Kind::ALL {
            assert_eq!(kind.as_str().parse::<Kind>().unwrap(), kind);
        }
        assert_eq!(
            "delete_everything".parse::<Kind>(),
            Err(PolicyError::UnknownKind("delete_everything".into()))
        );
    }

    #[test]
    fn test_audience_parse() {
        assert_eq!("partner".parse::<Audience>().unwrap(), Audience::Partner);
        assert!("Partner".parse::<Audience>().is_err());
    }

    #[test]
    fn test_index_matches_all_order() {
        for (i, kind) in Kind::ALL.into_iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        for (i, audience) in Audience::ALL.into_iter().enumerate() {
            assert_eq!(audience.index(), i);
        }
    }

    #[test]
    fn test_create_listing_community_default() {
        let table = PolicyTable::default();
        let params = table.get(Kind::CreateListing, Audience::Community);
        assert_eq!(params.capacity, 5);
        assert_eq!(params.refill_amount, 5);
        assert_eq!(params.refill_interval_ms, 60_000);
    }

    #[test]
    fn test_burst_multiplier_scales_capacity_only() {
        let params = Policy::new(10, 1, 6).with_burst_multiplier(2.5).params(1.0);
        assert_eq!(params.capacity, 25);
        assert_eq!(params.refill_amount, 1);
        assert_eq!(params.refill_interval_ms, 6_000);
    }

    #[test]
    fn test_global_multiplier() {
        let params = Policy::per_interval(5, 60).params(0.5);
        assert_eq!(params.capacity, 2);
        assert_eq!(params.refill_amount, 2);
        // Never scaled down to nothing
        let params = Policy::per_interval(1, 60).params(0.1);
        assert_eq!(params.capacity, 1);
        assert_eq!(params.refill_amount, 1);
    }

    #[test]
    fn test_overrides() {
        let mut overrides = PolicyOverrides::new();
        overrides
            .entry(Kind::Search)
            .or_default()
            .insert(Audience::Staff, Policy::per_interval(7, 1));
        let table = PolicyTable::new(&overrides, 2.0).unwrap();
        assert_eq!(table.get(Kind::Search, Audience::Staff).capacity, 14);
        assert_eq!(table.get(Kind::Search, Audience::Staff).refill_interval_ms, 1_000);
        // Untouched entries keep their defaults, scaled
        assert_eq!(table.get(Kind::Search, Audience::Community).capacity, 120);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut overrides = PolicyOverrides::new();
        overrides
            .entry(Kind::Login)
            .or_default()
            .insert(Audience::Campus, Policy::new(5, 0, 60));
        let err = PolicyTable::new(&overrides, 1.0).unwrap_err();
        assert_eq!(
            err,
            PolicyError::Invalid {
                kind: "login".into(),
                audience: "campus".into(),
                reason: "refill amount must be non-zero",
            }
        );
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        assert!(PolicyTable::new(&PolicyOverrides::new(), 0.0).is_err());
        assert!(PolicyTable::new(&PolicyOverrides::new(), f64::NAN).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        for kind in Kind::ALL {
            for audience in Audience::ALL {
                assert!(default_policy(kind, audience).validate().is_ok());
            }
        }
        assert!(DEFAULT_SECONDARY_POLICY.validate().is_ok());
    }
}
