//! Redis-backed notification cache.
//!
//! Entries are the JSON [`NotificationEnvelope`] under namespaced keys
//! (`notification:v1:<uuid>`) so a future record layout can coexist with the
//! current one. Each write applies the configured TTL plus up to 10% random
//! jitter, spreading expiry of entries written in the same burst.

use std::time::Duration;

use async_trait::async_trait;
use bb8_redis::RedisConnectionManager;
use bb8_redis::bb8::Pool;
use bb8_redis::redis::AsyncCommands;
use rand::Rng;

use crate::domain::ports::{NotificationCache, NotificationCacheError};
use crate::domain::{Notification, NotificationEnvelope, NotificationId};

const KEY_PREFIX: &str = "notification:v1:";
const JITTER_DIVISOR: u64 = 10;

/// Namespaced Redis key for `id`.
pub fn cache_key(id: &NotificationId) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// TTL in whole seconds with up to 10% added jitter, never below one second.
fn jittered_ttl_secs<R: Rng + ?Sized>(ttl: Duration, rng: &mut R) -> u64 {
    let base = ttl.as_secs().max(1);
    let spread = base / JITTER_DIVISOR;
    if spread == 0 {
        return base;
    }
    base.saturating_add(rng.gen_range(0..=spread))
}

fn backend_error(err: impl std::fmt::Display) -> NotificationCacheError {
    NotificationCacheError::backend(err.to_string())
}

/// Notification cache stored in Redis through a `bb8` pool.
#[derive(Clone)]
pub struct RedisNotificationCache {
    pool: Pool<RedisConnectionManager>,
    ttl: Duration,
}

impl RedisNotificationCache {
    /// Build a pool for `redis_url` and wrap it.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationCacheError::Backend`] when the URL is invalid or
    /// the pool cannot be built.
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, NotificationCacheError> {
        let manager = RedisConnectionManager::new(redis_url).map_err(backend_error)?;
        let pool = Pool::builder()
            .build(manager)
            .await
            .map_err(backend_error)?;
        Ok(Self::new(pool, ttl))
    }

    /// Wrap an existing pool.
    pub fn new(pool: Pool<RedisConnectionManager>, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

impl std::fmt::Debug for RedisNotificationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNotificationCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationCache for RedisNotificationCache {
    async fn get(&self, id: &NotificationId) -> Result<Option<Notification>, NotificationCacheError> {
        let mut conn = self.pool.get().await.map_err(backend_error)?;
        let raw: Option<Vec<u8>> = conn.get(cache_key(id)).await.map_err(backend_error)?;
        raw.map(|bytes| {
            NotificationEnvelope::decode(&bytes)
                .map(Notification::from)
                .map_err(|err| NotificationCacheError::serialization(err.to_string()))
        })
        .transpose()
    }

    async fn put(&self, notification: &Notification) -> Result<(), NotificationCacheError> {
        let bytes = NotificationEnvelope::encode(notification)
            .map_err(|err| NotificationCacheError::serialization(err.to_string()))?;
        let ttl = jittered_ttl_secs(self.ttl, &mut rand::thread_rng());
        let mut conn = self.pool.get().await.map_err(backend_error)?;
        conn.set_ex::<_, _, ()>(cache_key(&notification.id), bytes, ttl)
            .await
            .map_err(backend_error)
    }

    async fn invalidate(&self, id: &NotificationId) -> Result<(), NotificationCacheError> {
        let mut conn = self.pool.get().await.map_err(backend_error)?;
        conn.del::<_, ()>(cache_key(id)).await.map_err(backend_error)
    }
}
