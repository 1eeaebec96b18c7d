use crate::model::{Document, Id};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache entry for a primary document
#[derive(Clone, Debug)]
struct CacheEntry {
    document: Document,
    last_accessed: Instant,
}

/// In-memory cache of primary documents keyed by (collection, id), with TTL
#[derive(Debug, Clone)]
pub struct EntityCache {
    entries: Arc<RwLock<HashMap<(String, Id), CacheEntry>>>,
    /// Time-to-live for cache entries; zero disables caching
    ttl: Duration,
}

impl EntityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Get a document from cache if present and not expired
    pub async fn get(&self, collection: &str, id: &str) -> Option<Document> {
        if !self.is_enabled() {
            return None;
        }
        let mut entries = self.entries.write().await;
        let key = (collection.to_string(), id.to_string());

        if let Some(entry) = entries.get_mut(&key) {
            if entry.last_accessed.elapsed() > self.ttl {
                entries.remove(&key);
                return None;
            }

            entry.last_accessed = Instant::now();
            Some(entry.document.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, collection: &str, document: Document) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.insert(
            (collection.to_string(), document.id.clone()),
            CacheEntry {
                document,
                last_accessed: Instant::now(),
            },
        );
    }

    pub async fn remove(&self, collection: &str, id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(&(collection.to_string(), id.to_string()));
    }

    /// Clear all expired entries from cache
    pub async fn clear_expired(&self) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.last_accessed.elapsed() <= ttl);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = EntityCache::default();
        let doc = Document::from_json("c-1", json!({"titre": "Concert"}));

        cache.put("concerts", doc.clone()).await;
        assert_eq!(cache.get("concerts", "c-1").await, Some(doc));
        // keyed by collection as well as id
        assert!(cache.get("lieux", "c-1").await.is_none());

        cache.remove("concerts", "c-1").await;
        assert!(cache.get("concerts", "c-1").await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let cache = EntityCache::new(Duration::ZERO);
        cache.put("concerts", Document::from_json("c-1", json!({}))).await;
        assert!(cache.get("concerts", "c-1").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let cache = EntityCache::new(Duration::from_millis(5));
        cache.put("concerts", Document::from_json("c-1", json!({}))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.clear_expired().await;
        assert_eq!(cache.len().await, 0);
    }
}
