//! Username to DN cache with TTL.
//!
//! Scoped to one tenant. Expiry is lazy: an expired entry is dropped when
//! it is read. A disabled (or closed) cache answers every `get` with `None`
//! and accepts every `put` and `invalidate` without storing anything.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct CachedDn {
    dn: String,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits as f64;
        let total = hits + self.misses as f64;
        if total > 0.0 { hits / total } else { 0.0 }
    }
}

pub struct NameCache {
    entries: DashMap<String, CachedDn>,
    /// `None` = entries never expire
    ttl: Option<Duration>,
    tenant: String,
    enabled: AtomicBool,
    counters: Counters,
}

impl NameCache {
    pub fn new(enabled: bool, ttl: Option<Duration>, tenant: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            tenant: tenant.into(),
            enabled: AtomicBool::new(enabled),
            counters: Counters::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None, "")
    }

    fn key(&self, username: &str) -> String {
        format!("{}/{}", self.tenant, username)
    }

    fn is_expired(&self, entry: &CachedDn) -> bool {
        self.ttl
            .map(|ttl| entry.cached_at.elapsed() > ttl)
            .unwrap_or(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn get(&self, username: &str) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        let key = self.key(username);
        if let Some(entry) = self.entries.get(&key) {
            if !self.is_expired(&entry) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.dn.clone());
            }
            drop(entry);
            self.entries.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Cached DN for {} expired", username);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, username: &str, dn: &str) {
        if !self.is_enabled() {
            return;
        }
        self.entries.insert(
            self.key(username),
            CachedDn {
                dn: dn.to_string(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Removes the entry for `username`.
    ///
    /// Returns `true` when an entry was removed, and also when the cache is
    /// disabled (there is nothing stale to worry about).
    pub fn invalidate(&self, username: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let removed = self.entries.remove(&self.key(username)).is_some();
        if removed {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Invalidated cached DN for {}", username);
        }
        removed
    }

    pub fn cleanup_expired(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, v| {
            self.ttl
                .map(|ttl| v.cached_at.elapsed() <= ttl)
                .unwrap_or(true)
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.counters
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Name cache cleanup: {} expired entries removed", removed);
        }
    }

    /// Disables the cache and drops every entry.
    pub fn close(&self) {
        self.enabled.store(false, Ordering::Release);
        let count = self.entries.len();
        self.entries.clear();
        info!("Name cache for tenant {} closed: {} entries removed", self.tenant, count);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_get_invalidate() {
        let cache = NameCache::new(true, None, "carbon.super");
        for user in ["alice", "bob", "Carol", "d ave"] {
            let dn = format!("uid={},ou=users", user);
            cache.put(user, &dn);
            assert_eq!(cache.get(user), Some(dn));
            assert!(cache.invalidate(user));
            assert_eq!(cache.get(user), None);
        }
        assert!(!cache.invalidate("never-cached"));
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache = NameCache::disabled();
        cache.put("alice", "uid=alice");
        assert_eq!(cache.get("alice"), None);
        assert!(cache.invalidate("alice"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let cache = NameCache::new(true, Some(Duration::from_millis(10)), "t");
        cache.put("alice", "uid=alice");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("alice"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = NameCache::new(true, Some(Duration::from_millis(5)), "t");
        cache.put("a", "uid=a");
        cache.put("b", "uid=b");
        std::thread::sleep(Duration::from_millis(20));
        cache.cleanup_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_tenants_do_not_collide() {
        let shared = NameCache::new(true, None, "tenant-a");
        shared.put("alice", "uid=alice,o=a");
        assert_eq!(shared.key("alice"), "tenant-a/alice");
    }

    #[test]
    fn test_close_disables() {
        let cache = NameCache::new(true, None, "t");
        cache.put("alice", "uid=alice");
        cache.close();
        assert!(!cache.is_enabled());
        assert_eq!(cache.get("alice"), None);
        cache.put("bob", "uid=bob");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(NameCache::new(true, None, "t"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..200 {
                        let user = format!("u{}", j % 20);
                        cache.put(&user, &format!("uid={},w={}", user, i));
                        let _ = cache.get(&user);
                        if j % 7 == 0 {
                            cache.invalidate(&user);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 20);
        let stats = cache.stats();
        assert!(stats.hits + stats.misses >= 8 * 200);
        assert!(stats.hit_rate() > 0.0);
    }
}
