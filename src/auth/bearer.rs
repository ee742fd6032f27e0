use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use super::{AuthProvider, Credential, RefreshGate, mask};
use crate::error::ClientError;
use crate::http::Request;

/// Credentials are refreshed this long before they expire.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Where bearer tokens come from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential, ClientError>;
}

/// A fixed token, e.g. from an environment variable.
#[derive(Debug, Clone)]
pub struct StaticToken(Credential);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Credential::new(token, None))
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn fetch(&self) -> Result<Credential, ClientError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client-credentials token endpoint: POSTs the client id and secret as
/// JSON and expects `{"access_token": ..., "expires_in": ...}` back.
pub struct TokenEndpoint {
    client: reqwest::Client,
    url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
}

impl TokenEndpoint {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

impl fmt::Debug for TokenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEndpoint")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("client_secret", &mask(&self.client_secret))
            .field("scope", &self.scope)
            .finish()
    }
}

#[async_trait]
impl TokenSource for TokenEndpoint {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Credential, ClientError> {
        debug!("Requesting access token from {}...", self.url);

        let body = TokenRequest {
            grant_type: "client_credentials",
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            scope: self.scope.as_deref(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Auth(format!("Token request failed: {}", e)))?;

        let response = response.error_for_status().map_err(|e| {
            ClientError::Auth(format!(
                "Token endpoint returned HTTP {}",
                e.status().map(|s| s.as_u16()).unwrap_or_default()
            ))
        })?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Auth(format!("Invalid token response: {}", e)))?;

        let expires_at = token
            .expires_in
            .map(|secs| SystemTime::now() + Duration::from_secs(secs));
        Ok(Credential::new(token.access_token, expires_at))
    }
}

/// `Authorization: Bearer <token>` with refresh through a [`TokenSource`].
pub struct BearerAuth<S: TokenSource> {
    source: S,
    credential: RwLock<Option<Credential>>,
    gate: RefreshGate,
    skew: Duration,
}

impl<S: TokenSource> BearerAuth<S> {
    /// Starts without a credential; the first call fetches one.
    pub fn new(source: S) -> Self {
        Self {
            source,
            credential: RwLock::new(None),
            gate: RefreshGate::new(),
            skew: DEFAULT_EXPIRY_SKEW,
        }
    }

    pub fn with_credential(source: S, credential: Credential) -> Self {
        let auth = Self::new(source);
        *auth.credential.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
        auth
    }

    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    fn current(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<S: TokenSource> AuthProvider for BearerAuth<S> {
    fn epoch(&self) -> u64 {
        self.gate.epoch()
    }

    fn needs_refresh(&self) -> bool {
        self.current()
            .is_none_or(|credential| credential.is_expired(self.skew))
    }

    fn apply(&self, request: &Request) -> Result<Request, ClientError> {
        let credential = self
            .current()
            .ok_or_else(|| ClientError::Auth("no bearer token available".to_string()))?;
        Ok(request
            .clone()
            .with_header("authorization", format!("Bearer {}", credential.token())))
    }

    async fn refresh(&self, stale_epoch: u64) -> Result<(), ClientError> {
        self.gate
            .run(stale_epoch, || async {
                let credential = self.source.fetch().await?;
                info!("Obtained new bearer token");
                *self.credential.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use url::Url;

    fn request() -> Request {
        Request::new(Method::Get, Url::parse("http://api.test/me").unwrap())
    }

    #[test]
    fn test_apply_without_credential_fails() {
        let auth = BearerAuth::new(StaticToken::new("t"));
        assert!(auth.needs_refresh());
        assert!(matches!(auth.apply(&request()), Err(ClientError::Auth(_))));
    }

    #[tokio::test]
    async fn test_refresh_then_apply() {
        let auth = BearerAuth::new(StaticToken::new("abc"));
        auth.refresh(auth.epoch()).await.unwrap();
        assert!(!auth.needs_refresh());

        let decorated = auth.apply(&request()).unwrap();
        assert_eq!(decorated.headers().get("Authorization"), Some("Bearer abc"));
    }

    #[test]
    fn test_expired_credential_needs_refresh() {
        let expired = Credential::new("old", Some(SystemTime::now() + Duration::from_secs(5)));
        let auth = BearerAuth::with_credential(StaticToken::new("new"), expired);
        assert!(auth.needs_refresh());

        let auth = auth.with_expiry_skew(Duration::ZERO);
        assert!(!auth.needs_refresh());
    }

    #[tokio::test]
    async fn test_refresh_uses_source_once_per_epoch() {
        let mut source = MockTokenSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|| Ok(Credential::new("fresh", None)));

        let auth = BearerAuth::with_credential(source, Credential::new("stale", None));
        auth.refresh(0).await.unwrap();
        auth.refresh(0).await.unwrap();

        let decorated = auth.apply(&request()).unwrap();
        assert_eq!(decorated.headers().get("authorization"), Some("Bearer fresh"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_old_credential() {
        let mut source = MockTokenSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|| Err(ClientError::Auth("denied".to_string())));

        let auth = BearerAuth::with_credential(source, Credential::new("stale", None));
        let err = auth.refresh(0).await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(ref msg) if msg == "denied"));
        assert_eq!(
            auth.apply(&request()).unwrap().headers().get("authorization"),
            Some("Bearer stale")
        );
    }

    #[tokio::test]
    async fn test_token_endpoint_fetch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"grant_type": "client_credentials", "client_id": "id", "client_secret": "secret"}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "tok-123", "expires_in": 3600}"#)
            .create_async()
            .await;

        let endpoint = TokenEndpoint::new(
            reqwest::Client::new(),
            format!("{}/oauth/token", server.url()),
            "id",
            "secret",
        );
        let credential = endpoint.fetch().await.unwrap();

        mock.assert_async().await;
        assert_eq!(credential.token(), "tok-123");
        assert!(credential.expires_at().is_some());
        assert!(!credential.is_expired(DEFAULT_EXPIRY_SKEW));
    }

    #[tokio::test]
    async fn test_token_endpoint_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .create_async()
            .await;

        let endpoint = TokenEndpoint::new(
            reqwest::Client::new(),
            format!("{}/oauth/token", server.url()),
            "id",
            "wrong",
        );
        let err = endpoint.fetch().await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(ref msg) if msg.contains("401")));
    }

    #[test]
    fn test_token_endpoint_debug_masks_secret() {
        let endpoint = TokenEndpoint::new(
            reqwest::Client::new(),
            "http://auth.test/token",
            "id",
            "super-secret-value-1234",
        );
        assert!(!format!("{:?}", endpoint).contains("super-secret-value"));
    }
}
