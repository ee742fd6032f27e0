use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{AuthProvider, RefreshGate, mask};
use crate::error::ClientError;
use crate::http::{Method, Request};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_ID_HEADER: &str = "x-key-id";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Hex HMAC-SHA256 over `METHOD\npath\ntimestamp`.
pub fn sign(secret: &str, method: Method, path: &str, timestamp: u64) -> Result<String, ClientError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ClientError::Auth(format!("Invalid signing key: {}", e)))?;
    mac.update(format!("{}\n{}\n{}", method, path, timestamp).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signs every request with a shared secret. Nothing is fetched on refresh;
/// the retry simply carries a fresh timestamp.
pub struct SignedRequestAuth {
    key_id: String,
    secret: String,
    gate: RefreshGate,
}

impl SignedRequestAuth {
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
            gate: RefreshGate::new(),
        }
    }

    pub fn sign_at(&self, request: &Request, timestamp: u64) -> Result<Request, ClientError> {
        let signature = sign(
            &self.secret,
            request.method(),
            request.base_url().path(),
            timestamp,
        )?;
        Ok(request
            .clone()
            .with_header(KEY_ID_HEADER, self.key_id.clone())
            .with_header(TIMESTAMP_HEADER, timestamp.to_string())
            .with_header(SIGNATURE_HEADER, signature))
    }
}

impl fmt::Debug for SignedRequestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedRequestAuth")
            .field("key_id", &self.key_id)
            .field("secret", &mask(&self.secret))
            .finish()
    }
}

#[async_trait]
impl AuthProvider for SignedRequestAuth {
    fn epoch(&self) -> u64 {
        self.gate.epoch()
    }

    fn apply(&self, request: &Request) -> Result<Request, ClientError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.sign_at(request, timestamp)
    }

    async fn refresh(&self, stale_epoch: u64) -> Result<(), ClientError> {
        self.gate.run(stale_epoch, || async { Ok(()) }).await
    }
}
