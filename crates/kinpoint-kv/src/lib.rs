//! Typed client over the KV/stream/bus backend.
//!
//! Pub/sub connections cannot interleave with regular commands, so the
//! client holds three independent connections: one for general commands,
//! one dedicated to publishing, and one owned by the subscriber task.

pub mod pubsub;

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use pubsub::{BusMessage, HandlerId, MessageHandler};

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("kv value encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("kv subscriber unavailable")]
    SubscriberUnavailable,
}

/// One entry read back from a named log: the server-assigned monotonic ID
/// plus the record's field map.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[derive(Clone)]
pub struct KvClient {
    commands: ConnectionManager,
    publisher: ConnectionManager,
    subscriber: pubsub::Subscriber,
}

impl KvClient {
    /// Open the three backend connections and ping each. Failure here must
    /// block service readiness.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let mut commands =
            ConnectionManager::new_with_config(client.clone(), manager_config()).await?;
        let mut publisher =
            ConnectionManager::new_with_config(client.clone(), manager_config()).await?;
        let _: String = redis::cmd("PING").query_async(&mut commands).await?;
        let _: String = redis::cmd("PING").query_async(&mut publisher).await?;
        let subscriber = pubsub::Subscriber::start(client).await?;
        tracing::info!("kv backend connected (commands, publisher, subscriber)");
        Ok(Self {
            commands,
            publisher,
            subscriber,
        })
    }

    /// Liveness probe on the command connection.
    pub async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.commands.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    // ── Plain KV ─────────────────────────────────────────────────────────

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.commands.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// JSON-decoding read. An undecodable value is treated as a miss so a
    /// stale or foreign write can never poison a read-through cache.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KvError> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(key, %err, "discarding undecodable kv value");
                Ok(None)
            }
        }
    }

    pub async fn set_raw(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut conn = self.commands.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let encoded = serde_json::to_string(value)?;
        self.set_raw(key, &encoded, ttl).await
    }

    pub async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.commands.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    pub async fn del_all(&self, keys: &[String]) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.commands.clone();
        let _: i64 = conn.del(keys).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.commands.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    pub async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.commands.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.commands.clone();
        let values: Vec<Option<String>> = conn.mget(keys).await?;
        Ok(values)
    }

    pub async fn mset(&self, items: &[(String, String)]) -> Result<(), KvError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.commands.clone();
        let _: () = conn.mset(items).await?;
        Ok(())
    }

    // ── Append-only logs ─────────────────────────────────────────────────

    /// Append a record to a named log, returning the server-generated
    /// monotonic ID.
    pub async fn append(
        &self,
        log_key: &str,
        fields: &[(&str, String)],
    ) -> Result<String, KvError> {
        let mut conn = self.commands.clone();
        let id: String = conn.xadd(log_key, "*", fields).await?;
        Ok(id)
    }

    /// Append and soft-cap the log length in one round trip.
    pub async fn append_capped(
        &self,
        log_key: &str,
        fields: &[(&str, String)],
        max_len: usize,
    ) -> Result<String, KvError> {
        let mut conn = self.commands.clone();
        let id: String = conn
            .xadd_maxlen(log_key, StreamMaxlen::Approx(max_len), "*", fields)
            .await?;
        Ok(id)
    }

    /// Range-read starting strictly after `after_id`, oldest first. Pass
    /// `"-"` to read from the beginning.
    pub async fn read_log(
        &self,
        log_key: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, KvError> {
        let start = if after_id == "-" {
            "-".to_string()
        } else {
            format!("({after_id}")
        };
        let mut conn = self.commands.clone();
        let reply: StreamRangeReply = conn.xrange_count(log_key, &start, "+", count).await?;
        Ok(reply.ids.into_iter().map(decode_stream_id).collect())
    }

    /// Newest-first range read of the log tail. Used to recover a missing
    /// latest-location entry without walking the whole log.
    pub async fn read_log_rev(&self, log_key: &str, count: usize) -> Result<Vec<LogEntry>, KvError> {
        let mut conn = self.commands.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(log_key, "+", "-", count).await?;
        Ok(reply.ids.into_iter().map(decode_stream_id).collect())
    }

    pub async fn trim(&self, log_key: &str, max_len: usize) -> Result<(), KvError> {
        let mut conn = self.commands.clone();
        let _: i64 = conn.xtrim(log_key, StreamMaxlen::Approx(max_len)).await?;
        Ok(())
    }

    // ── Competing-consumer groups ────────────────────────────────────────

    /// Create a consumer group on a log, creating the log if needed. A group
    /// that already exists is a silent success.
    pub async fn create_group(
        &self,
        log_key: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), KvError> {
        let mut conn = self.commands.clone();
        let created: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(log_key, group, start_id).await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Read new entries on behalf of a consumer in a group, blocking up to
    /// `block_ms` when the log is drained.
    pub async fn read_group(
        &self,
        log_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<LogEntry>, KvError> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let mut conn = self.commands.clone();
        let reply: StreamReadReply = conn.xread_options(&[log_key], &[">"], &options).await?;
        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(decode_stream_id)
            .collect())
    }

    pub async fn ack(&self, log_key: &str, group: &str, id: &str) -> Result<(), KvError> {
        let mut conn = self.commands.clone();
        let _: i64 = conn.xack(log_key, group, &[id]).await?;
        Ok(())
    }

    // ── Pub/sub ──────────────────────────────────────────────────────────

    /// Fire-and-forget publish on the dedicated publisher connection.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let mut conn = self.publisher.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    pub async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<HandlerId, KvError> {
        self.subscriber.subscribe(channel, handler).await
    }

    /// Remove one handler (by ID) or every handler for the channel.
    pub async fn unsubscribe(
        &self,
        channel: &str,
        handler: Option<HandlerId>,
    ) -> Result<(), KvError> {
        self.subscriber.unsubscribe(channel, handler).await
    }

    /// Pattern subscription with a single `*` wildcard segment.
    pub async fn psubscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<HandlerId, KvError> {
        self.subscriber.psubscribe(pattern, handler).await
    }
}

/// Bounded command-connection behavior: 30 s connect timeout, 3 attempts
/// per request before the error surfaces to the caller.
fn manager_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_connection_timeout(Duration::from_secs(30))
        .set_number_of_retries(3)
}

fn decode_stream_id(entry: redis::streams::StreamId) -> LogEntry {
    let fields = entry
        .map
        .iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|decoded| (key.clone(), decoded))
        })
        .collect();
    LogEntry {
        id: entry.id,
        fields,
    }
}
