use actix_web::http::header::HeaderMap;
use actix_web::HttpRequest;
use sha2::{Digest, Sha256};
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use thiserror::Error;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

// Hex characters kept from the digest, 128 bits
const SUBJECT_HASH_LEN: usize = 32;

/// Who is making a request, as far as rate limiting is concerned.
///
/// Never stored: it is only used to derive hashed bucket keys.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Identity {
    /// An already authenticated user id, if any.
    pub user_id: Option<String>,
    /// Client address, already normalized with [ip_key].
    pub ip: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIpError(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Unable to determine the client IP address")]
    MissingIp,
}

impl actix_web::ResponseError for Error {}

impl Identity {
    /// Builds an identity from an IP address string, grouping IPv6 clients per /64.
    pub fn new(user_id: Option<String>, ip: &str) -> Result<Self, Error> {
        Ok(Self {
            user_id,
            ip: ip_key(ip)?,
        })
    }

    /// Derives the client IP from the request.
    ///
    /// The first parseable address of `X-Forwarded-For` is used, then `X-Real-IP`, then the peer
    /// address of the connection.
    ///
    /// # Security
    ///
    /// The forwarding headers are trusted as-is, which is only suitable for applications deployed
    /// behind a proxy that you control and that overwrites them.
    pub fn from_request(req: &HttpRequest, user_id: Option<String>) -> Result<Self, Error> {
        let ip = forwarded_ip(req.headers())
            .or_else(|| req.peer_addr().map(|addr| addr.ip()))
            .ok_or(Error::MissingIp)?;
        Self::new(user_id, &ip.to_string())
    }

    /// The hashed subject of the per-identity bucket: the user if known, else the address.
    pub fn subject(&self, salt: &str) -> String {
        match &self.user_id {
            Some(user_id) => hash_subject(salt, "user", user_id),
            None => self.ip_subject(salt),
        }
    }

    /// The hashed address, used for the per-IP bucket regardless of the user.
    pub fn ip_subject(&self, salt: &str) -> String {
        hash_subject(salt, "ip", &self.ip)
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|chain| chain.split(',').find_map(|ip| ip.trim().parse().ok()));
    forwarded.or_else(|| {
        headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
    })
}

/// One-way hash of a bucket subject, so that user ids and addresses never reach the store in
/// clear. `scope` keeps a user id that happens to look like an address apart from the address.
pub fn hash_subject(salt: &str, scope: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0u8]);
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(value.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(SUBJECT_HASH_LEN);
    digest
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
// https://support.cloudflare.com/hc/en-us/articles/115001635128-Configuring-Cloudflare-Rate-Limiting
pub fn ip_key(ip_str: &str) -> Result<String, Error> {
    let ip = ip_str.trim().parse::<IpAddr>()?;
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{}/64", subnet)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_ip_key() {
        // Check that IPv4 addresses are preserved
        assert_eq!(ip_key("142.250.187.206").unwrap(), "142.250.187.206");
        // Check that IPv4 mapped addresses are preserved
        assert_eq!(ip_key("::FFFF:142.250.187.206").unwrap(), "142.250.187.206");
        // Check that IPv6 addresses are grouped into /64 subnets
        assert_eq!(
            ip_key("2a00:1450:4009:81f::200e").unwrap(),
            "2a00:1450:4009:81f::/64"
        );
        assert!(ip_key("not an ip").is_err());
    }

    #[test]
    fn test_subject_prefers_user() {
        let anonymous = Identity::new(None, "10.0.0.1").unwrap();
        let user = Identity::new(Some("42".into()), "10.0.0.1").unwrap();
        assert_eq!(anonymous.subject(""), anonymous.ip_subject(""));
        assert_ne!(user.subject(""), user.ip_subject(""));
        assert_eq!(user.ip_subject(""), anonymous.ip_subject(""));
    }

    #[test]
    fn test_hash_subject() {
        let hash = hash_subject("", "ip", "10.0.0.1");
        assert_eq!(hash.len(), SUBJECT_HASH_LEN);
        assert!(!hash.contains("10.0.0.1"));
        assert_eq!(hash, hash_subject("", "ip", "10.0.0.1"));
        // Scope and salt both separate subjects
        assert_ne!(hash, hash_subject("", "user", "10.0.0.1"));
        assert_ne!(hash, hash_subject("pepper", "ip", "10.0.0.1"));
    }

    #[test]
    fn test_from_request_forwarded_chain() {
        let req = TestRequest::default()
            .insert_header((X_FORWARDED_FOR, "garbage, 203.0.113.7, 10.0.0.1"))
            .insert_header((X_REAL_IP, "198.51.100.1"))
            .peer_addr("127.0.0.1:1234".parse().unwrap())
            .to_http_request();
        let identity = Identity::from_request(&req, None).unwrap();
        assert_eq!(identity.ip, "203.0.113.7");
    }

    #[test]
    fn test_from_request_real_ip_then_peer() {
        let req = TestRequest::default()
            .insert_header((X_REAL_IP, "198.51.100.1"))
            .peer_addr("127.0.0.1:1234".parse().unwrap())
            .to_http_request();
        assert_eq!(
            Identity::from_request(&req, None).unwrap().ip,
            "198.51.100.1"
        );

        let req = TestRequest::default()
            .peer_addr("[2a00:1450:4009:81f::200e]:443".parse().unwrap())
            .to_http_request();
        let identity = Identity::from_request(&req, Some("7".into())).unwrap();
        assert_eq!(identity.ip, "2a00:1450:4009:81f::/64");
        assert_eq!(identity.user_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_from_request_without_address() {
        let req = TestRequest::default().to_http_request();
        assert!(matches!(
            Identity::from_request(&req, None),
            Err(Error::MissingIp)
        ));
    }
}
