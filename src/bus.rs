//! Queue & notification bus.
//!
//! The pipeline needs exactly one FIFO queue, a handful of short-lived keys
//! and two pub/sub channel families, so the [`Bus`] trait is deliberately
//! narrow: `push` / `pop_with_timeout` / `publish` / `set_with_ttl` / `get`
//! plus hash and counter helpers. Nothing above this module knows it is
//! talking to Redis, which keeps the backing store swappable and makes the
//! end-to-end scenarios runnable against [`MemoryBus`].
//!
//! Delivery contracts:
//!
//! * Queue: at-least-once, at-most-one-consumer-per-message (blocking-pop
//!   semantics). Workers are idempotent against re-delivery.
//! * Pub/sub: best-effort. Subscribers may miss messages during reconnect;
//!   durable progress is always re-readable from the ledger.

use crate::config::{Config, TASK_UPDATES_CHANNEL, USER_CHANNEL_PREFIX};
use crate::error::BusError;
use crate::types::TaskUpdate;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ── Trait ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Bus: Send + Sync {
    /// Append to the tail of a FIFO queue.
    async fn push(&self, queue: &str, payload: &str) -> Result<(), BusError>;

    /// Blocking pop from the head of a FIFO queue. `None` on timeout.
    async fn pop_with_timeout(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BusError>;

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError>;

    /// Fire-and-forget publish to a pub/sub channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BusError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;

    /// Merge fields into a hash key.
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), BusError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BusError>;

    async fn incr(&self, key: &str) -> Result<i64, BusError>;
}

// ── Typed helpers ────────────────────────────────────────────────────────

/// Publish a status update on the shared `task_updates` channel.
/// Best-effort by contract: failures are logged, never propagated.
pub async fn publish_task_update(bus: &dyn Bus, update: &TaskUpdate) {
    match serde_json::to_string(update) {
        Ok(payload) => {
            if let Err(e) = bus.publish(TASK_UPDATES_CHANNEL, &payload).await {
                warn!(
                    "Failed to publish task update for {}: {e}",
                    update.task_id
                );
            }
        }
        Err(e) => warn!("Unserialisable task update: {e}"),
    }
}

/// Publish a terminal event on the per-user channel.
pub async fn publish_user_event(bus: &dyn Bus, user_id: &str, update: &TaskUpdate) {
    let channel = format!("{USER_CHANNEL_PREFIX}{user_id}");
    match serde_json::to_string(update) {
        Ok(payload) => {
            if let Err(e) = bus.publish(&channel, &payload).await {
                warn!("Failed to publish user event on {channel}: {e}");
            }
        }
        Err(e) => warn!("Unserialisable user event: {e}"),
    }
}

/// Merge transient task metadata (status, worker, timestamps, short error)
/// into the per-task hash. Best-effort like the pub/sub path.
pub async fn update_task_meta(bus: &dyn Bus, cfg: &Config, task_id: &str, fields: &[(String, String)]) {
    let key = cfg.task_data_key(task_id);
    if let Err(e) = bus.hset_all(&key, fields).await {
        warn!("Failed to update task metadata for {task_id}: {e}");
    }
}

// ── Redis backend ────────────────────────────────────────────────────────

/// Production bus over Redis. One multiplexed connection, auto-reconnecting.
pub struct RedisBus {
    conn: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub async fn connect(cfg: &Config) -> Result<RedisBus, BusError> {
        let client = match (&cfg.redis_tls_ca_cert, &cfg.redis_tls_cert, &cfg.redis_tls_key) {
            (None, None, None) => redis::Client::open(cfg.redis_url.as_str())?,
            (ca, cert, key) => {
                let read = |path: &std::path::PathBuf| -> Result<Vec<u8>, BusError> {
                    std::fs::read(path).map_err(|e| BusError::Tls {
                        path: path.clone(),
                        detail: e.to_string(),
                    })
                };
                let client_tls = match (cert, key) {
                    (Some(cert), Some(key)) => Some(redis::ClientTlsConfig {
                        client_cert: read(cert)?,
                        client_key: read(key)?,
                    }),
                    _ => None,
                };
                let root_cert = match ca {
                    Some(ca) => Some(read(ca)?),
                    None => None,
                };
                redis::Client::build_with_tls(
                    cfg.redis_url.as_str(),
                    redis::TlsCertificates {
                        client_tls,
                        root_cert,
                    },
                )?
            }
        };

        let conn = client.get_connection_manager().await?;
        debug!("Connected to bus at {}", cfg.redis_url);
        Ok(RedisBus { conn })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(queue, payload).await?;
        Ok(())
    }

    async fn pop_with_timeout(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.brpop(queue, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(queue).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), BusError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1i64).await?)
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

/// In-process bus for tests and local development.
///
/// Published messages are retained so tests can assert on them; TTLs are
/// recorded but only enforced on read for keys whose deadline passed.
#[derive(Default)]
pub struct MemoryBus {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    kv: Mutex<HashMap<String, (String, Option<Instant>)>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    counters: Mutex<HashMap<String, i64>>,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }

    /// All payloads published on `channel`, in order.
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Hash contents for a key (task metadata assertions).
    pub fn hash_of(&self, key: &str) -> HashMap<String, String> {
        self.hashes
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn counter(&self, key: &str) -> i64 {
        *self.counters.lock().unwrap().get(key).unwrap_or(&0)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), BusError> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop_with_timeout(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self
                .queues
                .lock()
                .unwrap()
                .get_mut(queue)
                .and_then(|q| q.pop_front())
            {
                return Ok(Some(payload));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BusError> {
        self.kv.lock().unwrap().insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut kv = self.kv.lock().unwrap();
        match kv.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                kv.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), BusError> {
        let mut hashes = self.hashes.lock().unwrap();
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), BusError> {
        // TTLs on hashes are advisory in the in-memory backend.
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        let mut counters = self.counters.lock().unwrap();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnitStatus;

    #[tokio::test]
    async fn queue_is_fifo() {
        let bus = MemoryBus::new();
        bus.push("q", "a").await.unwrap();
        bus.push("q", "b").await.unwrap();
        assert_eq!(bus.queue_len("q").await.unwrap(), 2);

        let first = bus
            .pop_with_timeout("q", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        let second = bus
            .pop_with_timeout("q", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let bus = MemoryBus::new();
        let popped = bus
            .pop_with_timeout("empty", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn ttl_expires_on_read() {
        let bus = MemoryBus::new();
        bus.set_with_ttl("k", "v", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn task_update_lands_on_shared_channel() {
        let bus = MemoryBus::new();
        let update = TaskUpdate::new("t-1", "u-1", UnitStatus::Completed)
            .with_message("Page 1 processed successfully");
        publish_task_update(&bus, &update).await;

        let seen = bus.published_on(TASK_UPDATES_CHANNEL);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("\"taskId\":\"t-1\""));
        assert!(seen[0].contains("\"status\":\"completed\""));
    }

    #[tokio::test]
    async fn counters_increment() {
        let bus = MemoryBus::new();
        assert_eq!(bus.incr("stat").await.unwrap(), 1);
        assert_eq!(bus.incr("stat").await.unwrap(), 2);
        assert_eq!(bus.counter("stat"), 2);
    }
}
