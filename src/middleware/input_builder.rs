use crate::policy::audience::AudienceClassifier;
use crate::policy::identity::Identity;
use crate::policy::{Audience, Kind};
use actix_web::dev::ServiceRequest;
use std::future::{ready, Ready};

type KindFn = Box<dyn Fn(&ServiceRequest) -> Result<Kind, actix_web::Error>>;
type AudienceFn = Box<dyn Fn(&ServiceRequest) -> Result<Audience, actix_web::Error>>;
type OptionalStringFn = Box<dyn Fn(&ServiceRequest) -> Option<String>>;

pub type EnforceInputFuture = Ready<Result<EnforceInput, actix_web::Error>>;

/// What the middleware asks the resolver for one request.
#[derive(Debug, Clone)]
pub struct EnforceInput {
    pub kind: Kind,
    pub audience: Audience,
    pub identity: Identity,
    /// Token cost of the request, usually 1.
    pub tokens: u64,
}

enum KindSource {
    Static(Kind),
    Dynamic(KindFn),
}

enum AudienceSource {
    Static(Audience),
    Dynamic(AudienceFn),
    Label(AudienceClassifier, OptionalStringFn),
}

/// Utility to create an input function that produces an [EnforceInput].
///
/// The identity is always derived from the request with [Identity::from_request].
///
/// This will not be of any use if the kind or audience require an asynchronous lookup; you should
/// instead write your own input function.
pub struct EnforceInputBuilder {
    kind: KindSource,
    audience: AudienceSource,
    user_fn: Option<OptionalStringFn>,
    tokens: u64,
}

impl EnforceInputBuilder {
    /// Every request is of the same kind, from the [Audience::Community] audience, costing one
    /// token.
    pub fn new(kind: Kind) -> Self {
        Self {
            kind: KindSource::Static(kind),
            audience: AudienceSource::Static(Audience::default()),
            user_fn: None,
            tokens: 1,
        }
    }

    /// Dynamically choose the kind, e.g. based on the route.
    pub fn kind_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<Kind, actix_web::Error> + 'static,
    {
        self.kind = KindSource::Dynamic(Box::new(f));
        self
    }

    pub fn audience(mut self, audience: Audience) -> Self {
        self.audience = AudienceSource::Static(audience);
        self
    }

    /// Dynamically choose the audience.
    pub fn audience_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<Audience, actix_web::Error> + 'static,
    {
        self.audience = AudienceSource::Dynamic(Box::new(f));
        self
    }

    /// Classify the audience from a free-text affiliation label of the caller, such as the
    /// organisation name of the signed in user.
    ///
    /// Pass [RateLimitResolver::classifier](crate::RateLimitResolver::classifier) to use the
    /// configured markers.
    pub fn audience_label_fn<F>(mut self, classifier: AudienceClassifier, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.audience = AudienceSource::Label(classifier, Box::new(f));
        self
    }

    /// Id of the authenticated user, if any. Anonymous requests are limited by address.
    pub fn user_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.user_fn = Some(Box::new(f));
        self
    }

    /// Tokens taken by each request.
    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> EnforceInputFuture + 'static {
        move |req| {
            ready((|| {
                let kind = match &self.kind {
                    KindSource::Static(kind) => *kind,
                    KindSource::Dynamic(f) => f(req)?,
                };
                let audience = match &self.audience {
                    AudienceSource::Static(audience) => *audience,
                    AudienceSource::Dynamic(f) => f(req)?,
                    AudienceSource::Label(classifier, f) => {
                        classifier.classify_opt(f(req).as_deref())
                    }
                };
                let user_id = self.user_fn.as_ref().and_then(|f| f(req));
                let identity = Identity::from_request(req.request(), user_id)?;

                Ok(EnforceInput {
                    kind,
                    audience,
                    identity,
                    tokens: self.tokens,
                })
            })())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::error::ErrorNotFound;
    use actix_web::test::TestRequest;

    fn request(path: &str) -> ServiceRequest {
        TestRequest::get()
            .uri(path)
            .insert_header(("x-org", "Springfield College"))
            .peer_addr("203.0.113.7:5000".parse().unwrap())
            .to_srv_request()
    }

    #[actix_web::test]
    async fn test_static_input() {
        let input_fn = EnforceInputBuilder::new(Kind::Search).build();
        let input = input_fn(&request("/search")).await.unwrap();
        assert_eq!(input.kind, Kind::Search);
        assert_eq!(input.audience, Audience::Community);
        assert_eq!(input.identity.ip, "203.0.113.7");
        assert_eq!(input.identity.user_id, None);
        assert_eq!(input.tokens, 1);
    }

    #[actix_web::test]
    async fn test_dynamic_input() {
        let input_fn = EnforceInputBuilder::new(Kind::Search)
            .kind_fn(|req| match req.path() {
                "/listings" => Ok(Kind::CreateListing),
                "/search" => Ok(Kind::Search),
                _ => Err(ErrorNotFound("no rate limit kind")),
            })
            .audience_label_fn(AudienceClassifier::default(), |req| {
                req.headers()
                    .get("x-org")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            })
            .user_fn(|_| Some("42".to_string()))
            .tokens(3)
            .build();
        let input = input_fn(&request("/listings")).await.unwrap();
        assert_eq!(input.kind, Kind::CreateListing);
        assert_eq!(input.audience, Audience::Campus);
        assert_eq!(input.identity.user_id.as_deref(), Some("42"));
        assert_eq!(input.tokens, 3);

        assert!(input_fn(&request("/elsewhere")).await.is_err());
    }

    #[actix_web::test]
    async fn test_static_and_dynamic_audience() {
        let input_fn = EnforceInputBuilder::new(Kind::Login)
            .audience(Audience::Staff)
            .build();
        assert_eq!(
            input_fn(&request("/")).await.unwrap().audience,
            Audience::Staff
        );

        let input_fn = EnforceInputBuilder::new(Kind::Login)
            .audience_fn(|_| Ok(Audience::Partner))
            .build();
        assert_eq!(
            input_fn(&request("/")).await.unwrap().audience,
            Audience::Partner
        );
    }

    #[actix_web::test]
    async fn test_missing_address() {
        let input_fn = EnforceInputBuilder::new(Kind::Search).build();
        let req = TestRequest::get().to_srv_request();
        assert!(input_fn(&req).await.is_err());
    }
}
