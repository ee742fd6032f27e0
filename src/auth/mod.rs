//! Authentication strategies.
//!
//! The client never looks inside credentials. It asks the provider to
//! decorate each request and, after a 401, to refresh. Providers that hold
//! refreshable state expose an epoch so concurrent refreshes collapse
//! into one (see [`RefreshGate`]).

mod bearer;
mod gate;
mod signed;

use async_trait::async_trait;
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::error::ClientError;
use crate::http::Request;

pub use bearer::{BearerAuth, StaticToken, TokenEndpoint, TokenSource};
pub use gate::RefreshGate;
pub use signed::{SignedRequestAuth, sign};

/// An opaque token and when it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<SystemTime>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// True once the credential is within `skew` of its expiry.
    pub fn is_expired(&self, skew: Duration) -> bool {
        match self.expires_at {
            Some(at) => SystemTime::now() + skew >= at,
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &mask(&self.token))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Keeps the first and last four characters of long secrets.
pub(crate) fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}*********{}", head, tail)
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Identifies the credential generation `apply` currently uses.
    fn epoch(&self) -> u64 {
        0
    }

    /// Whether credentials should be refreshed before the next request.
    fn needs_refresh(&self) -> bool {
        false
    }

    /// Returns a copy of `request` carrying credentials.
    fn apply(&self, request: &Request) -> Result<Request, ClientError>;

    /// Refreshes credentials that were in use at `stale_epoch`. Concurrent
    /// calls with the same epoch perform a single refresh.
    async fn refresh(&self, stale_epoch: u64) -> Result<(), ClientError>;
}

/// No credentials; a 401 cannot be recovered from.
#[derive(Debug, Default, Clone)]
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    fn apply(&self, request: &Request) -> Result<Request, ClientError> {
        Ok(request.clone())
    }

    async fn refresh(&self, _stale_epoch: u64) -> Result<(), ClientError> {
        Err(ClientError::Auth(
            "server requires authentication but none is configured".to_string(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyPlacement {
    Header(String),
    Query(String),
}

/// A static API key sent as a header or query parameter.
#[derive(Clone)]
pub struct ApiKeyAuth {
    key: String,
    placement: ApiKeyPlacement,
}

impl ApiKeyAuth {
    pub fn header(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            placement: ApiKeyPlacement::Header(name.into()),
        }
    }

    pub fn query(param: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            placement: ApiKeyPlacement::Query(param.into()),
        }
    }

    pub fn placement(&self) -> &ApiKeyPlacement {
        &self.placement
    }
}

impl fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("key", &mask(&self.key))
            .field("placement", &self.placement)
            .finish()
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    fn apply(&self, request: &Request) -> Result<Request, ClientError> {
        let request = request.clone();
        Ok(match &self.placement {
            ApiKeyPlacement::Header(name) => request.with_header(name, self.key.clone()),
            ApiKeyPlacement::Query(param) => request.with_query(param.clone(), self.key.clone()),
        })
    }

    async fn refresh(&self, _stale_epoch: u64) -> Result<(), ClientError> {
        Err(ClientError::Auth(
            "API key was rejected and cannot be refreshed".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use url::Url;

    fn request() -> Request {
        Request::new(Method::Get, Url::parse("http://api.test/items").unwrap())
    }

    #[test]
    fn test_credential_expiry() {
        let forever = Credential::new("t", None);
        assert!(!forever.is_expired(Duration::from_secs(30)));

        let soon = Credential::new("t", Some(SystemTime::now() + Duration::from_secs(10)));
        assert!(!soon.is_expired(Duration::ZERO));
        assert!(soon.is_expired(Duration::from_secs(30)));

        let past = Credential::new("t", Some(SystemTime::now() - Duration::from_secs(1)));
        assert!(past.is_expired(Duration::ZERO));
    }

    #[test]
    fn test_credential_debug_masks_token() {
        let credential = Credential::new("ghp_1234567890abcdefWXYZ", None);
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("1234567890abcdef"));
        assert!(debug.contains("ghp_"));
        assert!(debug.contains("WXYZ"));
    }

    #[test]
    fn test_mask_short_secret() {
        assert_eq!(mask("abc"), "***");
    }

    #[test]
    fn test_api_key_header() {
        let auth = ApiKeyAuth::header("X-Api-Key", "secret");
        assert_eq!(auth.placement(), &ApiKeyPlacement::Header("X-Api-Key".to_string()));
        let original = request();
        let decorated = auth.apply(&original).unwrap();
        assert_eq!(decorated.headers().get("x-api-key"), Some("secret"));
        assert!(original.headers().get("x-api-key").is_none());
    }

    #[test]
    fn test_api_key_query() {
        let auth = ApiKeyAuth::query("api_key", "secret");
        assert_eq!(auth.placement(), &ApiKeyPlacement::Query("api_key".to_string()));
        let decorated = auth.apply(&request()).unwrap();
        assert_eq!(decorated.url().as_str(), "http://api.test/items?api_key=secret");
    }

    #[tokio::test]
    async fn test_api_key_cannot_refresh() {
        let auth = ApiKeyAuth::header("X-Api-Key", "secret");
        assert!(matches!(auth.refresh(0).await, Err(ClientError::Auth(_))));
    }

    #[tokio::test]
    async fn test_no_auth_passthrough() {
        let auth = NoAuth;
        assert_eq!(auth.apply(&request()).unwrap(), request());
        assert!(auth.refresh(0).await.is_err());
    }
}
