//! Optional on-disk snapshot of the response cache.
//!
//! Format (JSON): `{ "version": 1, "entries": [...] }`, entries ordered from
//! least to most recently used so loading restores recency.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{CacheConfig, CacheEntry, ResponseCache};
use crate::error::CacheError;
use crate::http::{Headers, Method, RequestIdentity, Response};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    received_at_ms: u64,
    fresh_until_ms: u64,
    validator: Option<String>,
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl PersistedEntry {
    fn from_entry(identity: &RequestIdentity, entry: &CacheEntry) -> Self {
        let remaining = entry.fresh_until().saturating_duration_since(Instant::now());
        let response = &entry.response;
        Self {
            method: identity.method,
            url: identity.url.clone(),
            query: identity.query.clone(),
            status: response.status(),
            headers: response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: response.body().to_vec(),
            received_at_ms: unix_millis(response.received_at()),
            fresh_until_ms: unix_millis(SystemTime::now() + remaining),
            validator: entry.validator.clone(),
        }
    }

    fn into_entry(self) -> (RequestIdentity, CacheEntry) {
        let now = unix_millis(SystemTime::now());
        let remaining = Duration::from_millis(self.fresh_until_ms.saturating_sub(now));
        let response = Response::new(
            self.status,
            self.headers.into_iter().collect::<Headers>(),
            self.body,
        )
        .with_received_at(UNIX_EPOCH + Duration::from_millis(self.received_at_ms));

        let identity = RequestIdentity::new(self.method, self.url, self.query);
        let entry = CacheEntry {
            response,
            fresh_until: Instant::now() + remaining,
            validator: self.validator,
        };
        (identity, entry)
    }
}

impl ResponseCache {
    /// Writes all entries to `path`, replacing it atomically. Returns the
    /// number of entries written.
    pub fn save(&self, path: &Path) -> Result<usize, CacheError> {
        let entries: Vec<PersistedEntry> = {
            let entries = self.entries()?;
            entries
                .iter()
                .rev()
                .map(|(identity, entry)| PersistedEntry::from_entry(identity, entry))
                .collect()
        };
        let count = entries.len();
        let snapshot = Snapshot {
            version: FORMAT_VERSION,
            entries,
        };

        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| CacheError::Persistence(format!("Failed to serialize cache: {}", e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                CacheError::Persistence(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| {
            CacheError::Persistence(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, path).map_err(|e| {
            CacheError::Persistence(format!("Failed to replace {}: {}", path.display(), e))
        })?;

        debug!("Saved {} cache entries to {}", count, path.display());
        Ok(count)
    }

    /// Builds a cache from a snapshot written by [`ResponseCache::save`].
    /// Expired entries without a validator are dropped.
    pub fn load(path: &Path, config: &CacheConfig) -> Result<Self, CacheError> {
        let raw = fs::read(path).map_err(|e| {
            CacheError::Persistence(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&raw).map_err(|e| {
            CacheError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        if snapshot.version != FORMAT_VERSION {
            return Err(CacheError::Persistence(format!(
                "Unsupported cache format version {} in {}",
                snapshot.version,
                path.display()
            )));
        }

        let cache = ResponseCache::new(config);
        {
            let mut entries = cache.entries()?;
            for persisted in snapshot.entries {
                let (identity, entry) = persisted.into_entry();
                if entry.is_fresh() || entry.is_revalidatable() {
                    entries.put(identity, entry);
                }
            }
        }
        debug!("Loaded {} cache entries from {}", cache.len(), path.display());
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity(path: &str) -> RequestIdentity {
        RequestIdentity::new(Method::Get, format!("http://api.test{}", path), vec![])
    }

    fn response(body: &str, headers: &[(&str, &str)]) -> Response {
        Response::new(
            200,
            headers.iter().copied().collect::<Headers>(),
            body.as_bytes().to_vec(),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let config = CacheConfig::default();

        let cache = ResponseCache::new(&config);
        cache
            .store(identity("/a"), response(r#"{"a":1}"#, &[("ETag", "\"v1\"")]))
            .unwrap();
        cache.store(identity("/b"), response("[]", &[])).unwrap();
        assert_eq!(cache.save(&path).unwrap(), 2);

        let restored = ResponseCache::load(&path, &config).unwrap();
        assert_eq!(restored.len(), 2);
        let entry = restored.lookup(&identity("/a")).unwrap().unwrap();
        assert!(entry.is_fresh());
        assert_eq!(entry.validator(), Some("\"v1\""));
        assert_eq!(entry.response().body(), br#"{"a":1}"#);
        assert_eq!(entry.response().headers().get("etag"), Some("\"v1\""));
    }

    #[test]
    fn test_load_skips_expired_entries_without_validator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let config = CacheConfig::default();

        let cache = ResponseCache::new(&config);
        cache
            .entries()
            .unwrap()
            .put(identity("/stale"), CacheEntry::new(response("x", &[]), Instant::now()));
        cache
            .entries()
            .unwrap()
            .put(
                identity("/etag"),
                CacheEntry::new(response("y", &[("ETag", "\"e\"")]), Instant::now()),
            );
        cache.save(&path).unwrap();

        let restored = ResponseCache::load(&path, &config).unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored.lookup(&identity("/etag")).unwrap().is_some());
    }

    #[test]
    fn test_load_preserves_recency_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = ResponseCache::new(&CacheConfig::default());
        cache.store(identity("/old"), response("1", &[])).unwrap();
        cache.store(identity("/new"), response("2", &[])).unwrap();
        cache.save(&path).unwrap();

        // Room for one: the most recently used entry must survive.
        let small = CacheConfig {
            capacity: 1,
            ..CacheConfig::default()
        };
        let restored = ResponseCache::load(&path, &small).unwrap();
        assert!(restored.lookup(&identity("/new")).unwrap().is_some());
        assert!(restored.lookup(&identity("/old")).unwrap().is_none());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "not json").unwrap();

        let result = ResponseCache::load(&path, &CacheConfig::default());
        assert!(matches!(result, Err(CacheError::Persistence(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = ResponseCache::load(&dir.path().join("absent.json"), &CacheConfig::default());
        assert!(matches!(result, Err(CacheError::Persistence(_))));
    }
}
