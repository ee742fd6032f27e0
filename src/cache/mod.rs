//! In-memory response cache.
//!
//! Entries are keyed by [`RequestIdentity`] and evicted least-recently-used
//! once `capacity` is reached. All access goes through one mutex; every
//! operation holds it only for a map lookup or insert, so a lookup can never
//! observe a partially written entry.

mod freshness;
mod persist;

use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::http::{RequestIdentity, Response};

pub use freshness::FreshnessPolicy;

/// Default number of cached responses.
pub const DEFAULT_CAPACITY: usize = 256;

/// Default freshness ceiling in seconds, used when a response carries no
/// caching directive and as the upper bound for `max-age`.
pub const DEFAULT_FRESHNESS_CEILING_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub freshness_ceiling_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            freshness_ceiling_secs: DEFAULT_FRESHNESS_CEILING_SECS,
        }
    }
}

/// A cached response with its freshness deadline and entity validator.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    response: Response,
    fresh_until: Instant,
    validator: Option<String>,
}

impl CacheEntry {
    pub fn new(response: Response, fresh_until: Instant) -> Self {
        let validator = response.etag().map(str::to_string);
        Self {
            response,
            fresh_until,
            validator,
        }
    }

    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.fresh_until
    }

    /// Stale entries can still be used after a conditional request.
    pub fn is_revalidatable(&self) -> bool {
        self.validator.is_some()
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn into_response(self) -> Response {
        self.response
    }

    pub fn fresh_until(&self) -> Instant {
        self.fresh_until
    }

    pub fn validator(&self) -> Option<&str> {
        self.validator.as_deref()
    }
}

pub struct ResponseCache {
    entries: Option<Mutex<LruCache<RequestIdentity, CacheEntry>>>,
    ceiling: Duration,
}

impl ResponseCache {
    /// A capacity of 0 disables the cache; every operation then reports
    /// [`CacheError::Disabled`].
    pub fn new(config: &CacheConfig) -> Self {
        let entries = NonZeroUsize::new(config.capacity).map(|c| Mutex::new(LruCache::new(c)));
        if entries.is_none() {
            warn!("Response cache capacity is 0, caching is disabled");
        }
        Self {
            entries,
            ceiling: Duration::from_secs(config.freshness_ceiling_secs),
        }
    }

    pub fn freshness_ceiling(&self) -> Duration {
        self.ceiling
    }

    fn entries(&self) -> Result<MutexGuard<'_, LruCache<RequestIdentity, CacheEntry>>, CacheError> {
        self.entries
            .as_ref()
            .ok_or(CacheError::Disabled)?
            .lock()
            .map_err(|_| CacheError::Poisoned)
    }

    /// Returns a fresh entry, or a stale one that carries a validator.
    /// Stale entries without a validator are evicted.
    pub fn lookup(&self, identity: &RequestIdentity) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries()?;
        let Some(entry) = entries.get(identity) else {
            return Ok(None);
        };
        if entry.is_fresh() || entry.is_revalidatable() {
            return Ok(Some(entry.clone()));
        }
        entries.pop(identity);
        debug!("Evicted expired cache entry for {}", identity);
        Ok(None)
    }

    /// Stores a 200 response unless its directives forbid it. Returns
    /// whether the response was stored.
    pub fn store(&self, identity: RequestIdentity, response: Response) -> Result<bool, CacheError> {
        if response.status() != 200 {
            return Ok(false);
        }
        let policy = FreshnessPolicy::from_headers(response.headers(), self.freshness_ceiling());
        let fresh_until = match policy {
            FreshnessPolicy::NoStore => {
                self.entries()?.pop(&identity);
                return Ok(false);
            }
            // Without a validator such an entry could never be served.
            FreshnessPolicy::Revalidate if response.etag().is_none() => {
                self.entries()?.pop(&identity);
                return Ok(false);
            }
            FreshnessPolicy::Revalidate => Instant::now(),
            FreshnessPolicy::FreshFor(ttl) => Instant::now() + ttl,
        };

        let entry = CacheEntry::new(response, fresh_until);
        let mut entries = self.entries()?;
        if let Some((evicted, _)) = entries.push(identity.clone(), entry) {
            if evicted != identity {
                debug!("Evicted least recently used cache entry for {}", evicted);
            }
        }
        debug!("Cached response for {}", identity);
        Ok(true)
    }

    /// Extends an entry's deadline after a successful revalidation. A new
    /// validator on the 304 replaces the stored one.
    pub fn refresh(
        &self,
        identity: &RequestIdentity,
        revalidation: &Response,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let policy = FreshnessPolicy::from_headers(revalidation.headers(), self.freshness_ceiling());
        let fresh_until = match policy {
            FreshnessPolicy::FreshFor(ttl) => Instant::now() + ttl,
            FreshnessPolicy::Revalidate | FreshnessPolicy::NoStore => Instant::now(),
        };

        let mut entries = self.entries()?;
        let Some(entry) = entries.get_mut(identity) else {
            return Ok(None);
        };
        entry.fresh_until = fresh_until;
        if let Some(etag) = revalidation.etag() {
            entry.validator = Some(etag.to_string());
        }
        debug!("Revalidated cache entry for {}", identity);
        Ok(Some(entry.clone()))
    }

    pub fn invalidate(&self, identity: &RequestIdentity) -> Result<bool, CacheError> {
        Ok(self.entries()?.pop(identity).is_some())
    }

    /// Removes every entry, whatever its method or query, whose URL is
    /// exactly `url`.
    pub fn invalidate_url(&self, url: &str) -> Result<usize, CacheError> {
        self.remove_where(|identity| identity.url == url)
    }

    /// Removes every entry whose URL equals `prefix` or lies beneath it on a
    /// path segment boundary.
    pub fn invalidate_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        self.remove_where(|identity| identity.is_under(prefix))
    }

    fn remove_where(&self, matches: impl Fn(&RequestIdentity) -> bool) -> Result<usize, CacheError> {
        let mut entries = self.entries()?;
        let doomed: Vec<RequestIdentity> = entries
            .iter()
            .filter(|(identity, _)| matches(identity))
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &doomed {
            entries.pop(identity);
        }
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.entries()?.clear();
        Ok(())
    }
}
