//! Redis Streams transport: publish, consumer groups, ack, and reclamation
//! of deliveries abandoned by dead consumers.

use redis::aio::MultiplexedConnection;
use redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BusError, Result};

/// Field under which the JSON payload travels in a stream entry.
const PAYLOAD_FIELD: &str = "data";

/// One message taken off a stream. The id doubles as the ack token.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Thin client over Redis Streams. Cloning shares the underlying
/// multiplexed connection.
#[derive(Clone)]
pub struct MessageBus {
    conn: MultiplexedConnection,
}

impl MessageBus {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!(redis_url, "connecting to message bus");
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    /// Append a message to a stream. Returns the entry id.
    pub async fn publish<T: Serialize>(&self, stream: &str, payload: &T) -> Result<String> {
        let body = serde_json::to_vec(payload)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, body.as_slice())])
            .await?;
        debug!(stream, entry_id = %id, "message published");
        Ok(id)
    }

    /// Create the consumer group if it does not exist yet, creating the
    /// stream alongside it. Existing groups are left untouched.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;

        match created {
            Ok(()) => {
                info!(stream, group, "consumer group created");
                Ok(())
            }
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Read up to `count` fresh messages for this consumer, blocking up to
    /// `block_ms`. Entries stay in the group's pending list until acked.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<Delivery>> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;

        let mut deliveries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                if let Some(value) = entry.map.get(PAYLOAD_FIELD) {
                    let payload: Vec<u8> = redis::from_redis_value(value)?;
                    deliveries.push(Delivery {
                        id: entry.id.clone(),
                        payload,
                    });
                }
            }
        }
        Ok(deliveries)
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    /// Steal deliveries that have sat unacked beyond `min_idle_ms` — the
    /// at-least-once leg. Works across consumers, so a crashed worker's
    /// backlog migrates to whoever claims first.
    pub async fn claim_abandoned(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // Redis 7 returns [cursor, entries, deleted]; 6.2 omits the third.
        let entries: StreamRangeReply =
            match redis::from_redis_value::<(String, StreamRangeReply, Vec<String>)>(&value) {
                Ok((_, entries, _)) => entries,
                Err(_) => {
                    let (_, entries): (String, StreamRangeReply) =
                        redis::from_redis_value(&value)?;
                    entries
                }
            };

        let mut deliveries = Vec::new();
        for entry in entries.ids {
            if let Some(value) = entry.map.get(PAYLOAD_FIELD) {
                let payload: Vec<u8> = redis::from_redis_value(value)?;
                deliveries.push(Delivery {
                    id: entry.id.clone(),
                    payload,
                });
            }
        }

        if !deliveries.is_empty() {
            debug!(
                stream,
                group,
                claimed = deliveries.len(),
                "claimed abandoned deliveries"
            );
        }
        Ok(deliveries)
    }

    /// Unacked backlog of a group, for health reporting.
    pub async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        // Summary form: [count, min-id, max-id, consumers].
        match redis::from_redis_value::<(u64, Value, Value, Value)>(&value) {
            Ok((count, _, _, _)) => Ok(count),
            Err(_) => Ok(0),
        }
    }
}

/// Decode a JSON payload into a message type.
pub fn decode<T: serde::de::DeserializeOwned>(
    payload: &[u8],
) -> std::result::Result<T, BusError> {
    Ok(serde_json::from_slice(payload)?)
}
