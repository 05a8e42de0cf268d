//! TTL cache of loaded skill handles.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Default time a loaded skill stays reusable.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

struct CacheEntry<H> {
    handle: H,
    loaded_at: Instant,
}

/// Skill name → loaded handle, with a load timestamp per entry.
///
/// An entry is live while its age is below the TTL. Callers pass `now` so
/// one purge-then-lookup sequence sees a single instant.
pub struct SkillCache<H> {
    entries: HashMap<String, CacheEntry<H>>,
    ttl: Duration,
}

impl<H: Clone> SkillCache<H> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A live entry, never a stale one.
    pub fn get(&self, name: &str, now: Instant) -> Option<H> {
        self.entries
            .get(name)
            .filter(|entry| now.saturating_duration_since(entry.loaded_at) < self.ttl)
            .map(|entry| entry.handle.clone())
    }

    pub fn insert(&mut self, name: impl Into<String>, handle: H, now: Instant) {
        self.entries.insert(
            name.into(),
            CacheEntry {
                handle,
                loaded_at: now,
            },
        );
    }

    /// Drop every entry whose age has reached the TTL. Returns how many went.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.loaded_at) < ttl);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_at_ttl() {
        let mut cache = SkillCache::new(Duration::from_secs(10));
        cache.insert("greet", "v1", Instant::now());
        assert_eq!(cache.get("greet", Instant::now()), Some("v1"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("greet", Instant::now()), Some("v1"));
        assert_eq!(cache.purge_expired(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("greet", Instant::now()), None);
        assert_eq!(cache.purge_expired(Instant::now()), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_keeps_fresh_entries() {
        let mut cache = SkillCache::new(Duration::from_secs(10));
        cache.insert("old", 1, Instant::now());
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert("new", 2, Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(Instant::now()), 1);
        assert!(!cache.contains("old"));
        assert_eq!(cache.get("new", Instant::now()), Some(2));
    }

    #[test]
    fn test_clear() {
        let mut cache = SkillCache::new(DEFAULT_CACHE_TTL);
        cache.insert("a", 1, Instant::now());
        cache.insert("b", 2, Instant::now());
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
