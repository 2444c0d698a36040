//! Preference resolution with a time-bounded cache.
//!
//! Reads go through an in-memory cache keyed by (user, notification type);
//! entries older than the TTL are reloaded from the backing store. Users
//! without a stored preference get the built-in default for the type. All
//! writes go through to the backing store and invalidate the cache entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use courier_common::error::EngineError;
use courier_common::store::PreferenceBacking;
use courier_common::types::{NotificationType, Preference};

struct CacheEntry {
    preference: Preference,
    cached_at: Instant,
}

pub struct PreferenceStore {
    backing: Arc<dyn PreferenceBacking>,
    cache: Mutex<HashMap<(String, NotificationType), CacheEntry>>,
    ttl: Duration,
}

impl PreferenceStore {
    pub fn new(backing: Arc<dyn PreferenceBacking>, ttl: Duration) -> Self {
        Self {
            backing,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve the preference for (user, type): cache if fresh, else the
    /// backing store, else the built-in default for the type.
    pub async fn get(
        &self,
        user_id: &str,
        kind: NotificationType,
    ) -> Result<Preference, EngineError> {
        let key = (user_id.to_string(), kind);

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&key)
                && entry.cached_at.elapsed() < self.ttl
            {
                tracing::debug!(user_id, kind = %kind, "Preference cache hit");
                return Ok(entry.preference.clone());
            }
        }

        let preference = match self.backing.load(user_id, kind).await? {
            Some(stored) => stored,
            None => Preference::default_for(user_id, kind),
        };

        self.cache.lock().insert(
            key,
            CacheEntry {
                preference: preference.clone(),
                cached_at: Instant::now(),
            },
        );

        Ok(preference)
    }

    /// Store a preference, invalidating the cache entry for its key.
    pub async fn set(&self, preference: Preference) -> Result<(), EngineError> {
        self.backing.save(&preference).await?;
        self.invalidate(&preference.user_id, preference.kind);
        tracing::info!(
            user_id = %preference.user_id,
            kind = %preference.kind,
            "Preference updated"
        );
        Ok(())
    }

    /// Load (or default), apply `apply`, and store the result.
    pub async fn update<F>(
        &self,
        user_id: &str,
        kind: NotificationType,
        apply: F,
    ) -> Result<Preference, EngineError>
    where
        F: FnOnce(&mut Preference),
    {
        let mut preference = match self.backing.load(user_id, kind).await? {
            Some(stored) => stored,
            None => Preference::default_for(user_id, kind),
        };
        apply(&mut preference);
        self.backing.save(&preference).await?;
        self.invalidate(user_id, kind);
        Ok(preference)
    }

    /// Remove a stored preference. Subsequent reads fall back to the
    /// built-in default.
    pub async fn delete(&self, user_id: &str, kind: NotificationType) -> Result<bool, EngineError> {
        let removed = self.backing.delete(user_id, kind).await?;
        self.invalidate(user_id, kind);
        Ok(removed)
    }

    /// Reset (user, type) to the built-in default, persisting it.
    pub async fn reset(
        &self,
        user_id: &str,
        kind: NotificationType,
    ) -> Result<Preference, EngineError> {
        let preference = Preference::default_for(user_id, kind);
        self.backing.save(&preference).await?;
        self.invalidate(user_id, kind);
        Ok(preference)
    }

    fn invalidate(&self, user_id: &str, kind: NotificationType) {
        self.cache.lock().remove(&(user_id.to_string(), kind));
    }
}
