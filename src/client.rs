//! The REST client: cache, auth, retries and deadlines around a transport.

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::auth::AuthProvider;
use crate::cache::{CacheEntry, ResponseCache};
use crate::config::ClientConfig;
use crate::error::{CacheError, ClientError, Result};
use crate::http::{
    Method, ReqwestTransport, Request, RequestIdentity, Response, Transport, http_client, join_url,
};
use crate::retry::{RetryPolicy, RetryState, Step};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Whole-call deadline; overrides the configured default.
    pub deadline: Option<Duration>,
    pub idempotency_key: Option<String>,
    /// Skip the cache lookup. A successful GET still refreshes the cache.
    pub bypass_cache: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    auth: Option<Arc<dyn AuthProvider>>,
    cache: Option<Arc<ResponseCache>>,
}

impl ClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the provider described by the configuration's auth section.
    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate()?;
        let base_url = join_url(&config.base_url, "")?;

        let (transport, http) = match self.transport {
            Some(transport) => (transport, None),
            None => {
                let transport = ReqwestTransport::new(config.max_connections_per_host)?;
                let http = transport.inner().clone();
                (Arc::new(transport) as Arc<dyn Transport>, Some(http))
            }
        };
        let auth = match self.auth {
            Some(auth) => auth,
            None => {
                let http = match http {
                    Some(http) => http,
                    None => http_client(config.max_connections_per_host)?,
                };
                config
                    .auth
                    .build_provider(&http)
                    .map_err(|e| ClientError::Config(format!("{:#}", e)))?
            }
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResponseCache::new(&config.cache)));

        Ok(Client {
            base_url,
            timeout: config.timeout(),
            deadline: config.deadline(),
            retry: RetryPolicy::new(config.retry.clone()),
            transport,
            auth,
            cache,
        })
    }
}

/// A shareable REST client. Clones share the transport, credentials and cache.
#[derive(Clone)]
pub struct Client {
    base_url: Url,
    timeout: Duration,
    deadline: Option<Duration>,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<ResponseCache>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            auth: None,
            cache: None,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    #[tracing::instrument(skip(self, options))]
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str, options: &RequestOptions) -> Result<T> {
        self.send(Method::Get, endpoint, None, options).await?.decode()
    }

    #[tracing::instrument(skip(self, body, options))]
    pub async fn post<B, T>(&self, endpoint: &str, body: &B, options: &RequestOptions) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body)?;
        self.send(Method::Post, endpoint, Some(body), options)
            .await?
            .decode()
    }

    #[tracing::instrument(skip(self, body, options))]
    pub async fn put<B, T>(&self, endpoint: &str, body: &B, options: &RequestOptions) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body)?;
        self.send(Method::Put, endpoint, Some(body), options)
            .await?
            .decode()
    }

    #[tracing::instrument(skip(self, body, options))]
    pub async fn patch<B, T>(&self, endpoint: &str, body: &B, options: &RequestOptions) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body)?;
        self.send(Method::Patch, endpoint, Some(body), options)
            .await?
            .decode()
    }

    #[tracing::instrument(skip(self, options))]
    pub async fn delete<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<T> {
        self.send(Method::Delete, endpoint, None, options)
            .await?
            .decode()
    }

    /// Builds the request for `endpoint` relative to the base URL.
    pub fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
        options: &RequestOptions,
    ) -> Result<Request> {
        let url = join_url(self.base_url.as_str(), endpoint)?;
        let mut request = Request::new(method, url);
        for (key, value) in &options.query {
            request = request.with_query(key.clone(), value.clone());
        }
        for (name, value) in &options.headers {
            request = request.with_header(name, value.clone());
        }
        if let Some(key) = &options.idempotency_key {
            request = request.with_idempotency_key(key.clone());
        }
        if let Some(body) = body {
            request = request.with_body(body, "application/json");
        }
        Ok(request)
    }

    /// Sends a request and returns the raw response.
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
        options: &RequestOptions,
    ) -> Result<Response> {
        let request = self.request(method, endpoint, body, options)?;
        self.execute(request, options.deadline, options.bypass_cache)
            .await
    }

    /// Runs `request` under `deadline` (or the configured default). When the
    /// deadline passes the call is dropped wherever it is, including in the
    /// middle of a backoff sleep, and nothing is cached.
    pub async fn execute(
        &self,
        request: Request,
        deadline: Option<Duration>,
        bypass_cache: bool,
    ) -> Result<Response> {
        match deadline.or(self.deadline) {
            Some(limit) => {
                let expires = Instant::now() + limit;
                let call = self.execute_cached(request, Some(expires), bypass_cache);
                match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Call exceeded its deadline of {:?}", limit);
                        Err(ClientError::DeadlineExceeded(limit))
                    }
                }
            }
            None => self.execute_cached(request, None, bypass_cache).await,
        }
    }

    async fn execute_cached(
        &self,
        request: Request,
        expires: Option<Instant>,
        bypass_cache: bool,
    ) -> Result<Response> {
        let identity = request.identity();
        let method = request.method();

        let cached = if method.is_safe() && !bypass_cache {
            self.lookup(&identity)
        } else {
            None
        };
        if let Some(entry) = &cached {
            if entry.is_fresh() {
                debug!("Cache hit for {}", identity);
                return Ok(entry.response().clone());
            }
        }

        let outgoing = match cached.as_ref().and_then(CacheEntry::validator) {
            Some(validator) => {
                debug!("Revalidating {} with validator {}", identity, validator);
                request.clone().with_header("if-none-match", validator)
            }
            None => request.clone(),
        };

        let response = self.execute_authorized(&outgoing, expires).await?;

        if response.is_not_modified() {
            let Some(entry) = cached else {
                return Err(ClientError::http(
                    304,
                    "Not Modified received without a cached entry",
                ));
            };
            return Ok(match self.cache.refresh(&identity, &response) {
                Ok(Some(updated)) => updated.into_response(),
                Ok(None) => entry.into_response(),
                Err(e) => {
                    cache_degraded(&e);
                    entry.into_response()
                }
            });
        }

        if method.is_safe() {
            // Undecodable bodies are never cached.
            match response.json() {
                Ok(_) => {
                    if let Err(e) = self.cache.store(identity, response.clone()) {
                        cache_degraded(&e);
                    }
                }
                Err(e) => debug!("Not caching {}: {}", identity, e),
            }
        } else {
            self.invalidate_after_write(&request);
        }
        Ok(response)
    }

    fn lookup(&self, identity: &RequestIdentity) -> Option<CacheEntry> {
        match self.cache.lookup(identity) {
            Ok(entry) => entry,
            Err(e) => {
                cache_degraded(&e);
                None
            }
        }
    }

    /// A successful write makes cached reads of the same resource, anything
    /// beneath it, and its parent collection stale.
    fn invalidate_after_write(&self, request: &Request) {
        let target = request.base_url();
        match self.cache.invalidate_prefix(target.as_str()) {
            Ok(0) => {}
            Ok(n) => debug!("Invalidated {} cache entries under {}", n, target),
            Err(e) => cache_degraded(&e),
        }

        if let Some(parent) = parent_collection(target) {
            match self.cache.invalidate_url(parent.as_str()) {
                Ok(0) => {}
                Ok(n) => debug!("Invalidated {} cache entries for {}", n, parent),
                Err(e) => cache_degraded(&e),
            }
        }
    }

    /// Applies credentials and runs the retry loop. A 401 triggers exactly
    /// one credential refresh and one more run; a second 401 is returned.
    async fn execute_authorized(&self, request: &Request, expires: Option<Instant>) -> Result<Response> {
        if self.auth.needs_refresh() {
            debug!("Credentials missing or about to expire, refreshing");
            self.auth.refresh(self.auth.epoch()).await?;
        }

        let epoch = self.auth.epoch();
        let authorized = self.auth.apply(request)?;
        match self.execute_with_retry(&authorized, expires).await {
            Err(e) if e.is_auth_rejection() => {
                info!(
                    "{} {} was rejected as unauthorized, refreshing credentials",
                    request.method(),
                    request.base_url()
                );
                self.auth.refresh(epoch).await?;
                let authorized = self.auth.apply(request)?;
                self.execute_with_retry(&authorized, expires).await
            }
            other => other,
        }
    }

    async fn execute_with_retry(&self, request: &Request, expires: Option<Instant>) -> Result<Response> {
        let mut state = RetryState::new();
        loop {
            let attempt = state.begin_attempt();
            let outcome = self.attempt(request, self.attempt_timeout(expires)).await;

            match self.retry.next(&mut state, outcome, request.is_retry_safe()) {
                Step::Success(response) => return Ok(response),
                Step::RetryAfter(delay) => {
                    warn!(
                        "{} {}: attempt {}/{} failed ({}), retrying in {}ms...",
                        request.method(),
                        request.base_url(),
                        attempt,
                        self.retry.max_attempts(),
                        state
                            .last_error()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Step::Terminal(error) => return Err(error),
            }
        }
    }

    /// A single transport exchange. 2xx and 304 are successes; any other
    /// status becomes [`ClientError::Http`].
    async fn attempt(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let response = self.transport.execute(request, timeout).await?;
        if response.is_success() || response.is_not_modified() {
            return Ok(response);
        }
        Err(ClientError::Http {
            status: response.status(),
            body: body_excerpt(response.body()),
            retry_after: response.retry_after(),
        })
    }

    fn attempt_timeout(&self, expires: Option<Instant>) -> Duration {
        match expires {
            Some(expires) => self
                .timeout
                .min(expires.saturating_duration_since(Instant::now())),
            None => self.timeout,
        }
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| ClientError::Encode(e.to_string()))
}

fn cache_degraded(error: &CacheError) {
    warn!("Response cache unavailable ({}), continuing without it", error);
}

fn body_excerpt(body: &[u8]) -> String {
    const LIMIT: usize = 512;
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

/// `http://x/items/42` -> `http://x/items`. None for the root.
fn parent_collection(url: &Url) -> Option<Url> {
    let (parent, _) = url.path().trim_end_matches('/').rsplit_once('/')?;
    let mut parent_url = url.clone();
    parent_url.set_path(if parent.is_empty() { "/" } else { parent });
    Some(parent_url)
}
