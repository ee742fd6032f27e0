use std::time::Duration;

use crate::http::Headers;

/// How long a response may be served without revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessPolicy {
    /// `no-store`: never cached.
    NoStore,
    /// `no-cache`: cached, but must be revalidated before every use.
    Revalidate,
    FreshFor(Duration),
}

impl FreshnessPolicy {
    /// Derives freshness from `Cache-Control`. `no-store` overrides every
    /// other directive. `max-age` is honoured up to `ceiling`; without any
    /// directive the ceiling itself applies.
    pub fn from_headers(headers: &Headers, ceiling: Duration) -> Self {
        let Some(cache_control) = headers.get("cache-control") else {
            return FreshnessPolicy::FreshFor(ceiling);
        };

        let mut no_store = false;
        let mut no_cache = false;
        let mut max_age = None;
        for directive in cache_control.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            match directive.as_str() {
                "no-store" => no_store = true,
                "no-cache" => no_cache = true,
                _ => {
                    if let Some(value) = directive.strip_prefix("max-age=") {
                        max_age = value.trim_matches('"').parse::<u64>().ok();
                    }
                }
            }
        }

        if no_store {
            return FreshnessPolicy::NoStore;
        }
        if no_cache {
            return FreshnessPolicy::Revalidate;
        }
        match max_age {
            Some(0) => FreshnessPolicy::Revalidate,
            Some(secs) => FreshnessPolicy::FreshFor(Duration::from_secs(secs).min(ceiling)),
            None => FreshnessPolicy::FreshFor(ceiling),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: Duration = Duration::from_secs(60);

    fn headers(cache_control: &str) -> Headers {
        [("Cache-Control", cache_control)].into_iter().collect()
    }

    fn policy(cache_control: &str) -> FreshnessPolicy {
        FreshnessPolicy::from_headers(&headers(cache_control), CEILING)
    }

    #[test]
    fn test_no_directive_uses_ceiling() {
        assert_eq!(
            FreshnessPolicy::from_headers(&Headers::default(), CEILING),
            FreshnessPolicy::FreshFor(CEILING)
        );
    }

    #[test]
    fn test_max_age_is_capped_by_ceiling() {
        assert_eq!(
            policy("public, max-age=30"),
            FreshnessPolicy::FreshFor(Duration::from_secs(30))
        );
        assert_eq!(policy("max-age=3600"), FreshnessPolicy::FreshFor(CEILING));
    }

    #[test]
    fn test_no_store_wins() {
        assert_eq!(policy("max-age=30, no-store"), FreshnessPolicy::NoStore);
    }

    #[test]
    fn test_no_store_wins_regardless_of_order() {
        assert_eq!(policy("no-cache, no-store"), FreshnessPolicy::NoStore);
        assert_eq!(policy("no-store, no-cache"), FreshnessPolicy::NoStore);
        assert_eq!(policy("max-age=0, no-store"), FreshnessPolicy::NoStore);
        assert_eq!(policy("NO-CACHE, No-Store"), FreshnessPolicy::NoStore);
    }

    #[test]
    fn test_no_cache_and_zero_max_age_require_revalidation() {
        assert_eq!(policy("no-cache"), FreshnessPolicy::Revalidate);
        assert_eq!(policy("max-age=0"), FreshnessPolicy::Revalidate);
        assert_eq!(policy("max-age=30, no-cache"), FreshnessPolicy::Revalidate);
    }

    #[test]
    fn test_unparseable_max_age_falls_back_to_ceiling() {
        assert_eq!(policy("max-age=soon"), FreshnessPolicy::FreshFor(CEILING));
    }
}
