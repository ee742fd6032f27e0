use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use super::response::Headers;
use crate::error::{ClientError, Result};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Safe methods are served from and stored into the response cache.
    pub fn is_safe(self) -> bool {
        matches!(self, Method::Get)
    }

    pub fn is_idempotent(self) -> bool {
        matches!(self, Method::Get | Method::Put | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(ClientError::Config(format!(
                "Unsupported method: {}. Expected GET, POST, PUT, PATCH or DELETE.",
                other
            ))),
        }
    }
}

/// Joins `endpoint` onto `base`. Slashes on either side are normalized, so
/// `http://x/` + `/y`, `http://x` + `y` and `http://x/` + `y` all give `http://x/y`.
/// An endpoint that is already an absolute http(s) URL is used as-is.
pub fn join_url(base: &str, endpoint: &str) -> Result<Url> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return parse_http_url(endpoint);
    }

    let base = parse_http_url(base)?;
    let mut prefix = base.as_str().to_string();
    if base.query().is_some() || base.fragment().is_some() {
        let mut stripped = base.clone();
        stripped.set_query(None);
        stripped.set_fragment(None);
        prefix = stripped.to_string();
    }

    let joined = format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    );
    parse_http_url(&joined)
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ClientError::InvalidUrl(format!(
            "{}: expected an absolute http(s) URL",
            raw
        )));
    }
    Ok(url)
}

/// Cache identity of a request: method, absolute URL without query, and the
/// query parameters in canonical (sorted) order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl RequestIdentity {
    pub fn new(method: Method, url: impl Into<String>, mut query: Vec<(String, String)>) -> Self {
        query.sort();
        Self {
            method,
            url: url.into(),
            query,
        }
    }

    /// Whether this identity's URL is `prefix` itself or lies beneath it.
    pub fn is_under(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        let url = self.url.trim_end_matches('/');
        url == prefix
            || url
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)?;
        for (i, (key, value)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, key, value)?;
        }
        Ok(())
    }
}

/// An outgoing request. Never mutated once built: every `with_*` call
/// consumes the request and returns a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    url: Url,
    query: Vec<(String, String)>,
    headers: Headers,
    body: Option<Vec<u8>>,
    idempotency_key: Option<String>,
}

impl Request {
    /// Query parameters already present on `url` are moved into the
    /// request's ordered parameter list.
    pub fn new(method: Method, mut url: Url) -> Self {
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.set_query(None);
        url.set_fragment(None);

        Self {
            method,
            url,
            query,
            headers: Headers::default(),
            body: None,
            idempotency_key: None,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.body = Some(body);
        self.with_header("content-type", content_type)
    }

    pub fn with_json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body).map_err(|e| ClientError::Encode(e.to_string()))?;
        Ok(self.with_body(bytes, "application/json"))
    }

    /// Lets the server deduplicate retried writes, which makes POST and
    /// PATCH safe to retry after ambiguous failures.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.headers.insert(IDEMPOTENCY_KEY_HEADER, key.clone());
        self.idempotency_key = Some(key);
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// URL without the query string.
    pub fn base_url(&self) -> &Url {
        &self.url
    }

    /// Full URL including query parameters, in insertion order.
    pub fn url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        url
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn is_retry_safe(&self) -> bool {
        self.method.is_idempotent() || self.idempotency_key.is_some()
    }

    pub fn identity(&self) -> RequestIdentity {
        RequestIdentity::new(self.method, self.url.as_str(), self.query.clone())
    }
}
