//! Replay of stored responses for requests carrying an `Idempotency-Key`.
//! Keys are scoped per user. Redis is used when `REDIS_URL` is set; otherwise
//! responses are kept in process memory.

use axum::http::HeaderMap;
use redis::AsyncCommands;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::warn;

pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s.len() <= 128)
}

#[derive(Clone)]
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (Instant, Value)>>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::default(),
            ttl,
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(target = "adstudio.api", error = %err, "invalid REDIS_URL; using in-memory idempotency");
                    None
                }
            });
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(3600);
        Self::new(redis, Duration::from_secs(ttl))
    }

    fn scoped(user_id: &str, key: &str) -> String {
        format!("idem:{user_id}:{key}")
    }

    pub async fn get(&self, user_id: &str, key: &str) -> Option<Value> {
        let key = Self::scoped(user_id, key);
        if let Some(client) = &self.redis {
            return redis_get(client, &key).await;
        }
        let mut local = self.local.lock().await;
        match local.get(&key) {
            Some((stored, value)) if stored.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                local.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, user_id: &str, key: &str, value: &Value) {
        let key = Self::scoped(user_id, key);
        if let Some(client) = &self.redis {
            redis_set(client, &key, value, self.ttl.as_secs()).await;
            return;
        }
        let mut local = self.local.lock().await;
        local.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        local.insert(key, (Instant::now(), value.clone()));
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<Value> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "adstudio.api", error = %err, "redis unavailable for idempotency lookup");
            return None;
        }
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &Value, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
