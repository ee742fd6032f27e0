//! The transport seam: one request/response exchange, nothing more.

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::error::Error as _;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

use super::request::{Method, Request};
use super::response::{Headers, Response};
use crate::error::{ClientError, TransportError, TransportErrorKind};

pub const USER_AGENT: &str = concat!("restwell/", env!("CARGO_PKG_VERSION"));

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a single exchange. Non-2xx statuses are returned as
    /// responses; only failures to complete the exchange are errors.
    async fn execute(&self, request: &Request, timeout: Duration)
    -> Result<Response, TransportError>;
}

/// The reqwest client every restwell component talks through.
pub fn http_client(max_connections_per_host: usize) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(max_connections_per_host.max(1))
        .build()
        .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Production transport over a pooled reqwest client.
///
/// Connections are reused by reqwest's pool. On top of that, at most
/// `max_connections_per_host` exchanges run concurrently per destination;
/// further calls wait for a slot.
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_connections_per_host: usize,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ReqwestTransport {
    pub fn new(max_connections_per_host: usize) -> Result<Self, ClientError> {
        let client = http_client(max_connections_per_host)?;
        Ok(Self::with_client(client, max_connections_per_host))
    }

    pub fn with_client(client: reqwest::Client, max_connections_per_host: usize) -> Self {
        Self {
            client,
            max_connections_per_host: max_connections_per_host.max(1),
            limits: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    fn limiter(&self, url: &Url) -> Arc<Semaphore> {
        let destination = destination(url);
        let mut limits = self.limits.lock().unwrap_or_else(PoisonError::into_inner);
        limits
            .entry(destination)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections_per_host)))
            .clone()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, request), fields(method = %request.method(), url = %request.base_url()))]
    async fn execute(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        // Held until this function returns or its future is dropped.
        let _permit = self
            .limiter(request.base_url())
            .acquire_owned()
            .await
            .map_err(|_| {
                TransportError::new(TransportErrorKind::Interrupted, "connection limiter closed")
            })?;

        let mut builder = self
            .client
            .request(reqwest_method(request.method()), request.url())
            .timeout(timeout);
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let mut headers = Headers::default();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        debug!("Received HTTP {} ({} bytes)", status, body.len());

        Ok(Response::new(status, headers, body.to_vec()))
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// `scheme://host:port`, the unit connections are limited by.
fn destination(url: &Url) -> String {
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

/// Maps a reqwest failure onto a transport error kind. reqwest does not
/// expose DNS or TLS failures as distinct kinds, so the source chain is
/// inspected for them.
fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    let lower = message.to_lowercase();

    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
            TransportErrorKind::DnsFailure
        } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake")
        {
            TransportErrorKind::TlsFailure
        } else {
            TransportErrorKind::ConnectionRefused
        }
    } else {
        TransportErrorKind::Interrupted
    };

    TransportError::new(kind, message)
}
