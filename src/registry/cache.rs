//! In-memory digest cache: many-reader / single-writer map, TTL based,
//! jittered to avoid a thundering herd across containers that share an
//! image (spec §4.1).

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;

use crate::model::DigestCacheEntry;

fn key(registry: &str, repository: &str, tag: &str) -> String {
    format!("{}/{}:{}", registry, repository, tag)
}

/// Negative results (auth/not-found) are cached for at most this long so a
/// transient misconfiguration doesn't stick around (spec §4.1).
pub const NEGATIVE_CACHE_TTL_SEC: i64 = 60;

pub struct DigestCache {
    entries: DashMap<String, DigestCacheEntry>,
    default_ttl_sec: i64,
}

impl DigestCache {
    pub fn new(default_ttl_sec: i64) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl_sec,
        }
    }

    /// TTL jittered ±20%, recomputed per lookup so repeated misses on the
    /// same key don't synchronize their next resolve.
    pub fn jittered_ttl(&self) -> i64 {
        let jitter_pct = rand::thread_rng().gen_range(-20i64..=20);
        let delta = self.default_ttl_sec * jitter_pct / 100;
        (self.default_ttl_sec + delta).max(1)
    }

    pub fn get(&self, registry: &str, repository: &str, tag: &str) -> Option<DigestCacheEntry> {
        let k = key(registry, repository, tag);
        let entry = self.entries.get(&k)?;
        let ttl = if entry.is_negative {
            NEGATIVE_CACHE_TTL_SEC
        } else {
            self.jittered_ttl()
        };
        if entry.is_fresh(ttl, Utc::now()) {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn put(&self, entry: DigestCacheEntry) {
        let k = key(&entry.registry, &entry.repository, &entry.tag);
        self.entries.insert(k, entry);
    }

    pub fn invalidate(&self, registry: &str, repository: &str, tag: &str) {
        self.entries.remove(&key(registry, repository, tag));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(fetched_secs_ago: i64, negative: bool) -> DigestCacheEntry {
        DigestCacheEntry {
            registry: "docker.io".into(),
            repository: "library/nginx".into(),
            tag: "1.24.0".into(),
            digest: "sha256:aaa".into(),
            size_bytes: 100,
            published_at: None,
            fetched_at: Utc::now() - Duration::seconds(fetched_secs_ago),
            is_negative: negative,
        }
    }

    #[test]
    fn fresh_entry_is_returned() {
        let cache = DigestCache::new(600);
        cache.put(entry(10, false));
        assert!(cache.get("docker.io", "library/nginx", "1.24.0").is_some());
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = DigestCache::new(600);
        cache.put(entry(601, false));
        assert!(cache.get("docker.io", "library/nginx", "1.24.0").is_none());
    }

    #[test]
    fn negative_entries_use_short_ttl() {
        let cache = DigestCache::new(600);
        cache.put(entry(61, true));
        assert!(cache.get("docker.io", "library/nginx", "1.24.0").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = DigestCache::new(600);
        cache.put(entry(0, false));
        cache.invalidate("docker.io", "library/nginx", "1.24.0");
        assert!(cache.get("docker.io", "library/nginx", "1.24.0").is_none());
    }
}
