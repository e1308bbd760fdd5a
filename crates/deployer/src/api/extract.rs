//! Request extractors — user identity cookie, source address, admin gate.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::error::DeployError;
use crate::state::SharedState;

pub const USER_COOKIE: &str = "ctf_user";
const COOKIE_MAX_AGE_SEC: u64 = 365 * 24 * 3600;

/// The pseudonymous participant identity, from the `ctf_user` cookie.
/// A fresh v4 UUID is issued when the cookie is absent or malformed; the
/// handler sets it on the response.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub uuid: String,
    pub fresh: bool,
}

impl UserIdentity {
    /// `Set-Cookie` value for a newly issued identity.
    pub fn cookie_value(&self) -> HeaderValue {
        let value = format!(
            "{}={}; HttpOnly; Path=/; Max-Age={}; SameSite=Lax",
            USER_COOKIE, self.uuid, COOKIE_MAX_AGE_SEC
        );
        HeaderValue::from_str(&value)
            .unwrap_or_else(|_| HeaderValue::from_static("ctf_user=invalid"))
    }

    /// Append the identity cookie to a response when it was just issued.
    pub fn apply(&self, response: &mut axum::response::Response) {
        if self.fresh {
            response.headers_mut().append(SET_COOKIE, self.cookie_value());
        }
    }
}

pub(crate) fn identity_from_cookie_header(raw: Option<&str>) -> UserIdentity {
    if let Some(raw) = raw {
        for pair in raw.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            if name.trim() == USER_COOKIE {
                let candidate = value.trim();
                if Uuid::parse_str(candidate).is_ok() {
                    return UserIdentity {
                        uuid: candidate.to_string(),
                        fresh: false,
                    };
                }
            }
        }
    }
    UserIdentity {
        uuid: Uuid::new_v4().to_string(),
        fresh: true,
    }
}

impl<S> FromRequestParts<S> for UserIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok());
        Ok(identity_from_cookie_header(raw))
    }
}

/// Source address for rate limiting: first `X-Forwarded-For` entry when
/// present, otherwise the socket peer.
#[derive(Debug, Clone)]
pub struct SourceIp(pub String);

pub(crate) fn source_ip(forwarded: Option<&str>, peer: Option<IpAddr>) -> String {
    if let Some(forwarded) = forwarded {
        if let Some(first) = forwarded.split(',').next() {
            let candidate = first.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl<S> FromRequestParts<S> for SourceIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(SourceIp(source_ip(forwarded, peer)))
    }
}

/// Admin authorization: a loopback / link-local peer, the `admin_key`
/// query parameter, or the `X-Admin-Key` header.
pub struct AdminGate;

fn is_local_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

pub(crate) fn admin_authorized(
    peer: Option<IpAddr>,
    query: Option<&str>,
    header_key: Option<&str>,
    admin_key: &str,
) -> bool {
    if peer.is_some_and(is_local_peer) {
        return true;
    }
    if header_key == Some(admin_key) {
        return true;
    }
    query
        .and_then(|q| query_param(q, "admin_key"))
        .is_some_and(|candidate| candidate == admin_key)
}

impl FromRequestParts<SharedState> for AdminGate {
    type Rejection = DeployError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let header_key = parts
            .headers
            .get("x-admin-key")
            .and_then(|v| v.to_str().ok());

        if admin_authorized(
            peer,
            parts.uri.query(),
            header_key,
            &state.config.admin.admin_key,
        ) {
            Ok(AdminGate)
        } else {
            tracing::warn!(peer = ?peer, path = %parts.uri.path(), "Admin access denied");
            state.metrics.record_error(&DeployError::AdminForbidden);
            Err(DeployError::AdminForbidden)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_parsed_when_valid_uuid() {
        let uuid = Uuid::new_v4().to_string();
        let header = format!("theme=dark; ctf_user={}; lang=en", uuid);
        let identity = identity_from_cookie_header(Some(&header));
        assert_eq!(identity.uuid, uuid);
        assert!(!identity.fresh);
    }

    #[test]
    fn test_missing_cookie_issues_fresh_uuid() {
        let identity = identity_from_cookie_header(None);
        assert!(identity.fresh);
        assert!(Uuid::parse_str(&identity.uuid).is_ok());
    }

    #[test]
    fn test_malformed_cookie_value_reissued() {
        let identity = identity_from_cookie_header(Some("ctf_user=not-a-uuid"));
        assert!(identity.fresh);
        assert_ne!(identity.uuid, "not-a-uuid");
    }

    #[test]
    fn test_cookie_value_attributes() {
        let identity = identity_from_cookie_header(None);
        let value = identity.cookie_value();
        let s = value.to_str().unwrap();
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("Path=/"));
        assert!(s.contains("Max-Age=31536000"));
    }

    #[test]
    fn test_source_ip_prefers_first_forwarded_entry() {
        let ip = source_ip(
            Some("203.0.113.9, 10.0.0.2"),
            Some("127.0.0.1".parse().unwrap()),
        );
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn test_source_ip_falls_back_to_peer() {
        let ip = source_ip(None, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(ip, "192.0.2.7");
    }

    #[test]
    fn test_source_ip_empty_forwarded_falls_back() {
        let ip = source_ip(Some("  "), Some("192.0.2.7".parse().unwrap()));
        assert_eq!(ip, "192.0.2.7");
    }

    #[test]
    fn test_admin_loopback_peer_allowed() {
        assert!(admin_authorized(
            Some("127.0.0.1".parse().unwrap()),
            None,
            None,
            "secret"
        ));
        assert!(admin_authorized(Some("::1".parse().unwrap()), None, None, "secret"));
    }

    #[test]
    fn test_admin_link_local_peer_allowed() {
        assert!(admin_authorized(
            Some("169.254.1.1".parse().unwrap()),
            None,
            None,
            "secret"
        ));
        assert!(admin_authorized(
            Some("fe80::1".parse().unwrap()),
            None,
            None,
            "secret"
        ));
    }

    #[test]
    fn test_admin_key_via_query() {
        let peer: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(admin_authorized(
            Some(peer),
            Some("format=json&admin_key=secret"),
            None,
            "secret"
        ));
        assert!(!admin_authorized(
            Some(peer),
            Some("admin_key=wrong"),
            None,
            "secret"
        ));
    }

    #[test]
    fn test_admin_key_via_header() {
        let peer: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(admin_authorized(Some(peer), None, Some("secret"), "secret"));
        assert!(!admin_authorized(Some(peer), None, Some("nope"), "secret"));
    }

    #[test]
    fn test_admin_denied_without_credentials() {
        let peer: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(!admin_authorized(Some(peer), None, None, "secret"));
        assert!(!admin_authorized(None, None, None, "secret"));
    }
}
