use std::sync::Arc;

use fundsync_adapters::scopus::API_KEY_CONFIG_KEYS;
use fundsync_core::Clock;
use fundsync_storage::{ConfigCache, ConfigStore};

use crate::JobError;

/// Provider API key read from `provider_config` through a TTL cache.
pub struct ApiKeyProvider {
    cache: ConfigCache,
}

impl ApiKeyProvider {
    pub fn new(ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: ConfigCache::new(ttl, clock),
        }
    }

    pub async fn init<S>(&self, store: &S) -> Result<(), JobError>
    where
        S: ConfigStore + ?Sized,
    {
        Ok(self.cache.init(store, &API_KEY_CONFIG_KEYS).await?)
    }

    /// First non-empty of `X-ELS-APIKey` and `api_key`.
    pub async fn get<S>(&self, store: &S) -> Result<String, JobError>
    where
        S: ConfigStore + ?Sized,
    {
        self.cache
            .first_present(store, &API_KEY_CONFIG_KEYS)
            .await?
            .ok_or_else(|| {
                JobError::Config(format!(
                    "no provider api key configured (looked for {})",
                    API_KEY_CONFIG_KEYS.join(", ")
                ))
            })
    }

    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fundsync_core::ManualClock;
    use fundsync_storage::MemoryStore;

    #[tokio::test]
    async fn falls_back_to_legacy_key_and_reports_absence() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = MemoryStore::new();
        let keys = ApiKeyProvider::new(chrono::Duration::minutes(5), clock.clone());

        assert!(matches!(keys.get(&store).await, Err(JobError::Config(_))));

        store.set_config("api_key", "legacy");
        // A cached miss stays a miss until the entry expires.
        assert!(keys.get(&store).await.is_err());
        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(keys.get(&store).await.unwrap(), "legacy");

        store.set_config("X-ELS-APIKey", "primary");
        keys.invalidate();
        assert_eq!(keys.get(&store).await.unwrap(), "primary");
    }
}
