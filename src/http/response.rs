use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use crate::error::{ClientError, Result};

/// Header list with case-insensitive names. Names are stored lower-cased;
/// insertion order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets `name`, replacing any existing value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Adds `value` to `name`. A repeated header is folded into a single
    /// comma-separated list.
    pub fn append(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => {
                entry.1.push_str(", ");
                entry.1.push_str(value);
            }
            None => self.0.push((name, value.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::default();
        for (name, value) in iter {
            headers.insert(name.as_ref(), value);
        }
        headers
    }
}

/// A received response. The body is kept as raw bytes; the JSON form is
/// decoded on first access and reused afterwards.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Headers,
    body: Vec<u8>,
    received_at: SystemTime,
    decoded: OnceLock<Result<serde_json::Value, String>>,
}

impl Response {
    pub fn new(status: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            received_at: SystemTime::now(),
            decoded: OnceLock::new(),
        }
    }

    pub fn with_received_at(mut self, received_at: SystemTime) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.headers.get("cache-control")
    }

    /// `Retry-After` in its delta-seconds form.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Structured view of the body, decoded once.
    pub fn json(&self) -> Result<&serde_json::Value> {
        match self.decoded.get_or_init(|| decode_value(&self.body)) {
            Ok(value) => Ok(value),
            Err(msg) => Err(ClientError::Decode(msg.clone())),
        }
    }

    /// Deserializes the body into `T`. An empty body decodes as JSON `null`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| ClientError::Decode(e.to_string()));
        }
        serde_json::from_slice(&self.body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

fn decode_value(body: &[u8]) -> Result<serde_json::Value, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> Response {
        Response::new(200, Headers::default(), body.as_bytes().to_vec())
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let headers: Headers = [("ETag", "\"v1\""), ("Cache-Control", "max-age=10")]
            .into_iter()
            .collect();
        assert_eq!(headers.get("etag"), Some("\"v1\""));
        assert_eq!(headers.get("CACHE-CONTROL"), Some("max-age=10"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_headers_insert_replaces() {
        let mut headers = Headers::default();
        headers.insert("X-Token", "a");
        headers.insert("x-token", "b");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-TOKEN"), Some("b"));
    }

    #[test]
    fn test_headers_append_folds_repeats() {
        let mut headers = Headers::default();
        headers.append("Cache-Control", "no-store");
        headers.append("cache-control", "max-age=60");
        headers.append("ETag", "\"v1\"");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("cache-control"), Some("no-store, max-age=60"));
        assert_eq!(headers.get("etag"), Some("\"v1\""));
    }

    #[test]
    fn test_json_decodes_lazily_and_caches() {
        let response = response(r#"{"id": 7}"#);
        let first = response.json().unwrap() as *const serde_json::Value;
        let second = response.json().unwrap() as *const serde_json::Value;
        assert_eq!(first, second);
        assert_eq!(response.json().unwrap()["id"], 7);
    }

    #[test]
    fn test_decode_typed() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Item {
            id: u32,
            name: String,
        }

        let item: Item = response(r#"{"id": 1, "name": "widget"}"#).decode().unwrap();
        assert_eq!(
            item,
            Item {
                id: 1,
                name: "widget".to_string()
            }
        );
    }

    #[test]
    fn test_decode_mismatch_is_decode_error() {
        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct Item {
            id: u32,
        }

        let result: Result<Item> = response(r#"{"name": "widget"}"#).decode();
        assert!(matches!(result, Err(ClientError::Decode(_))));

        let invalid = response("<html>");
        assert!(matches!(invalid.json(), Err(ClientError::Decode(_))));
    }

    #[test]
    fn test_empty_body_decodes_as_null() {
        let value: serde_json::Value = response("").decode().unwrap();
        assert!(value.is_null());
        let unit: Option<u32> = response("  ").decode().unwrap();
        assert_eq!(unit, None);
    }

    #[test]
    fn test_retry_after_seconds() {
        let headers: Headers = [("Retry-After", "3")].into_iter().collect();
        let response = Response::new(429, headers, Vec::new());
        assert_eq!(response.retry_after(), Some(Duration::from_secs(3)));

        let headers: Headers = [("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT")]
            .into_iter()
            .collect();
        let response = Response::new(429, headers, Vec::new());
        assert_eq!(response.retry_after(), None);
    }
}
