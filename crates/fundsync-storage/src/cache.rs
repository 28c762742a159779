use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use fundsync_core::Clock;
use tracing::debug;

use crate::{ConfigStore, StoreError};

/// Keyed cache whose entries expire `ttl` after they were stored.
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, (V, DateTime<Utc>)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, (V, DateTime<Utc>)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some((value, stored_at)) if now - *stored_at < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        self.entries().insert(key, (value, now));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries().remove(key);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

/// TTL-bounded view over `provider_config` rows.
pub struct ConfigCache {
    cache: TtlCache<String, Option<String>>,
}

impl ConfigCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: TtlCache::new(ttl, clock),
        }
    }

    /// Warms the cache for `keys`.
    pub async fn init<S>(&self, store: &S, keys: &[&str]) -> Result<(), StoreError>
    where
        S: ConfigStore + ?Sized,
    {
        for key in keys {
            let value = store.config_value(key).await?;
            self.cache.insert((*key).to_string(), value);
        }
        Ok(())
    }

    pub async fn get_or_load<S>(&self, store: &S, key: &str) -> Result<Option<String>, StoreError>
    where
        S: ConfigStore + ?Sized,
    {
        if let Some(value) = self.cache.get(&key.to_string()) {
            return Ok(value);
        }
        debug!(key, "config cache miss");
        let value = store.config_value(key).await?;
        self.cache.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// First non-blank value among `keys`, in order.
    pub async fn first_present<S>(
        &self,
        store: &S,
        keys: &[&str],
    ) -> Result<Option<String>, StoreError>
    where
        S: ConfigStore + ?Sized,
    {
        for key in keys {
            if let Some(value) = self.get_or_load(store, key).await? {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(&key.to_string());
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::TimeZone;
    use fundsync_core::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
        ))
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = clock();
        let cache: TtlCache<&str, i32> = TtlCache::new(Duration::minutes(5), clock.clone());
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        clock.advance(Duration::minutes(4));
        assert_eq!(cache.get(&"a"), Some(1));
        clock.advance(Duration::minutes(1));
        assert_eq!(cache.get(&"a"), None);
    }

    #[tokio::test]
    async fn config_values_are_cached_until_invalidated() {
        let clock = clock();
        let store = MemoryStore::new();
        store.set_config("X-ELS-APIKey", "first");
        let cache = ConfigCache::new(Duration::minutes(5), clock.clone());

        assert_eq!(
            cache.get_or_load(&store, "X-ELS-APIKey").await.unwrap().as_deref(),
            Some("first")
        );
        store.set_config("X-ELS-APIKey", "second");
        assert_eq!(
            cache.get_or_load(&store, "X-ELS-APIKey").await.unwrap().as_deref(),
            Some("first")
        );

        cache.invalidate("X-ELS-APIKey");
        assert_eq!(
            cache.get_or_load(&store, "X-ELS-APIKey").await.unwrap().as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn first_present_skips_blank_values() {
        let store = MemoryStore::new();
        store.set_config("X-ELS-APIKey", "   ");
        store.set_config("api_key", " legacy ");
        let cache = ConfigCache::new(Duration::minutes(5), clock());
        let value = cache
            .first_present(&store, &["X-ELS-APIKey", "api_key"])
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("legacy"));

        let empty = MemoryStore::new();
        cache.invalidate_all();
        assert_eq!(
            cache.first_present(&empty, &["X-ELS-APIKey", "api_key"]).await.unwrap(),
            None
        );
    }
}
