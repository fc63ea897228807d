use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::DbError;

/// Cached value marking a key as confirmed absent.
pub const TOMBSTONE: &str = "__ormsync_tombstone__";

/// TTL for entity and lookup entries.
pub const ENTITY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub fn tombstone() -> serde_json::Value {
    serde_json::Value::String(TOMBSTONE.to_string())
}

pub fn is_tombstone(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::String(s) if s == TOMBSTONE)
}

/// External key/value cache.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, DbError>;

    /// Look up several keys in one round-trip. Every requested key is present
    /// in the result, mapped to `None` on a miss.
    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Option<serde_json::Value>>, DbError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            found.insert(key.clone(), self.get(key)?);
        }
        Ok(found)
    }

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<(), DbError>;

    fn delete(&self, key: &str) -> Result<(), DbError>;
}

/// Process-local cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (serde_json::Value, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .values()
                    .filter(|(_, expires)| expires.map_or(true, |at| at > now))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (serde_json::Value, Option<Instant>)>>, DbError>
    {
        self.entries
            .lock()
            .map_err(|e| DbError::Cache(format!("cache lock poisoned: {}", e)))
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, DbError> {
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some((_, Some(at))) => *at <= Instant::now(),
            Some((_, None)) => false,
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<(), DbError> {
        // A zero TTL never expires.
        let expires = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.lock()?.insert(key.to_string(), (value, expires));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DbError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Cache used when caching is turned off: every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

impl Cache for NullCache {
    fn get(&self, _key: &str) -> Result<Option<serde_json::Value>, DbError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: serde_json::Value, _ttl: Duration) -> Result<(), DbError> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<(), DbError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        cache.set("users_id:1", json!({"id": 1}), ENTITY_TTL).unwrap();
        assert_eq!(cache.get("users_id:1").unwrap(), Some(json!({"id": 1})));

        cache.delete("users_id:1").unwrap();
        assert_eq!(cache.get("users_id:1").unwrap(), None);
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_multi_reports_every_key() {
        let cache = MemoryCache::new();
        cache.set("a", json!("x"), ENTITY_TTL).unwrap();
        let found = cache.get_multi(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], Some(json!("x")));
        assert_eq!(found["b"], None);
    }

    #[test]
    fn test_null_cache_always_misses() {
        let cache = NullCache;
        cache.set("a", json!(1), ENTITY_TTL).unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
        assert!(cache.get_multi(&["a".to_string()]).unwrap()["a"].is_none());
    }

    #[test]
    fn test_tombstone_marker() {
        assert!(is_tombstone(&tombstone()));
        assert!(!is_tombstone(&json!("row")));
        assert!(!is_tombstone(&json!(null)));
    }
}
