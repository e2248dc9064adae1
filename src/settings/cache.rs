use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sqlx::SqlitePool;
use tracing::warn;

use crate::config::{SETTINGS_CACHE_CAPACITY, SETTINGS_CACHE_TTL_SECS};
use crate::db;
use crate::error::Result;
use crate::settings::resolver::{resolve, EffectiveSettings, UserPreferences};

/// Resolved settings per user, kept for a few minutes so the API and the
/// cycle don't re-read plans for every lookup. Admin writes invalidate.
#[derive(Clone)]
pub struct SettingsCache {
    cache: Cache<String, Arc<EffectiveSettings>>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(SETTINGS_CACHE_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(SETTINGS_CACHE_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    fn key(user_id: &str) -> String {
        format!("user:effective_settings:{user_id}")
    }

    /// Resolve settings for an already-loaded user.
    pub async fn resolve_for(&self, pool: &SqlitePool, user: &UserPreferences) -> Result<Arc<EffectiveSettings>> {
        let key = Self::key(&user.user_id);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }

        let plan = match user.plan_name.as_deref() {
            Some(name) => db::users::get_plan(pool, name).await?,
            None => None,
        };
        let settings = Arc::new(resolve(user, plan.as_ref()));
        if !settings.anomalies.is_empty() {
            warn!(
                event = "SETTINGS_ANOMALY",
                user_id = %user.user_id,
                anomalies = ?settings.anomalies,
                "settings fell back to defaults"
            );
        }
        self.cache.insert(key, settings.clone()).await;
        Ok(settings)
    }

    /// Load the user then resolve. `None` when the user does not exist.
    pub async fn get(&self, pool: &SqlitePool, user_id: &str) -> Result<Option<Arc<EffectiveSettings>>> {
        if let Some(hit) = self.cache.get(&Self::key(user_id)).await {
            return Ok(Some(hit));
        }
        match db::users::get_user(pool, user_id).await? {
            Some(user) => self.resolve_for(pool, &user).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn invalidate(&self, user_id: &str) {
        self.cache.invalidate(&Self::key(user_id)).await;
    }

    /// Plan edits can touch any user on that plan.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for SettingsCache {
    fn default() -> Self {
        Self::new()
    }
}
