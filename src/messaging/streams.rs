use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::{Client, RedisError, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cli::config::BrokerSettings;
use crate::error::MessagingError;
use crate::messaging::{Broker, Delivery, Subscription};

/// Stream entry field holding the message body
const PAYLOAD_FIELD: &str = "payload";

fn stream_key(topic: &str, partition: u32) -> String {
    format!("{}:{}", topic, partition)
}

/// Where a member reads from next on one stream
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Still replaying this member's own unacknowledged entries, after this id
    Pending(String),
    /// Only new entries
    New,
}

/// Broker over Redis Streams: one stream per topic partition, consumer groups
/// for at-least-once delivery
pub struct RedisBroker {
    /// Connection pool
    conn_pool: Arc<Mutex<MultiplexedConnection>>,

    dead_letter_suffix: String,

    /// Pending entries idle this long are claimed from whichever member holds them; 0 disables claiming
    claim_idle_ms: u64,

    /// Groups known to exist, keyed by (stream, group)
    groups: Mutex<HashSet<(String, String)>>,

    /// Read position per (stream, group, consumer)
    cursors: Mutex<HashMap<(String, String, String), ReadCursor>>,
}

impl RedisBroker {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, MessagingError> {
        let redis_url = settings.redis_url.as_str();
        let client = Client::open(redis_url)
            .map_err(|e| MessagingError::Connection(format!("invalid Redis URL {}: {}", redis_url, e)))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MessagingError::Connection(format!("failed to connect to Redis at {}: {}", redis_url, e)))?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn_pool: Arc::new(Mutex::new(conn)),
            dead_letter_suffix: settings.dead_letter_suffix.clone(),
            claim_idle_ms: settings.claim_idle_ms,
            groups: Mutex::new(HashSet::new()),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Create the consumer group from the start of the stream unless it exists
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), MessagingError> {
        let key = (stream.to_string(), group.to_string());
        let mut groups = self.groups.lock().await;
        if groups.contains(&key) {
            return Ok(());
        }

        let mut conn = self.conn_pool.lock().await;
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match created {
            Ok(()) => debug!("Created consumer group {} on {}", group, stream),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => {
                return Err(MessagingError::Subscribe {
                    topic: stream.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        groups.insert(key);
        Ok(())
    }

    async fn read(
        &self,
        subscription: &Subscription,
        stream: &str,
        from: &str,
        block_ms: Option<u64>,
    ) -> Result<Option<(String, String)>, MessagingError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&subscription.group)
            .arg(&subscription.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(ms) = block_ms {
            cmd.arg("BLOCK").arg(ms);
        }
        cmd.arg("STREAMS").arg(stream).arg(from);

        let mut conn = self.conn_pool.lock().await;
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut *conn)
            .await
            .map_err(|e| MessagingError::Subscribe {
                topic: stream.to_string(),
                reason: e.to_string(),
            })?;

        let entry = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .next();

        Ok(entry.map(|entry| {
            let payload = entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default();
            (entry.id, payload)
        }))
    }

    /// Take over one entry that has sat unacknowledged for at least
    /// `claim_idle_ms`, under any member of the group, this one included
    async fn claim_idle(&self, subscription: &Subscription, stream: &str) -> Result<Option<(String, String)>, MessagingError> {
        if self.claim_idle_ms == 0 {
            return Ok(None);
        }

        let claim_error = |reason: String| MessagingError::Subscribe {
            topic: stream.to_string(),
            reason,
        };

        let mut conn = self.conn_pool.lock().await;

        // Reply: next cursor, claimed entries, and (Redis 7+) deleted ids
        let reply: Vec<Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(&subscription.group)
            .arg(&subscription.consumer)
            .arg(self.claim_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut *conn)
            .await
            .map_err(|e| claim_error(e.to_string()))?;

        let claimed: Vec<(String, HashMap<String, String>)> = match reply.get(1) {
            Some(entries) => redis::from_redis_value(entries).map_err(|e| claim_error(e.to_string()))?,
            None => Vec::new(),
        };

        Ok(claimed
            .into_iter()
            .next()
            .map(|(id, mut fields)| (id, fields.remove(PAYLOAD_FIELD).unwrap_or_default())))
    }

    fn delivery(subscription: &Subscription, partition: u32, id: String, payload: String) -> Delivery {
        Delivery {
            id,
            topic: subscription.topic.clone(),
            partition,
            payload,
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, partition: u32, payload: &str) -> Result<(), MessagingError> {
        let stream = stream_key(topic, partition);
        let mut conn = self.conn_pool.lock().await;

        let id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut *conn)
            .await
            .map_err(|e| MessagingError::Publish {
                topic: stream.clone(),
                reason: e.to_string(),
            })?;

        debug!("Appended {} to {}", id, stream);
        Ok(())
    }

    async fn poll(&self, subscription: &Subscription) -> Result<Option<Delivery>, MessagingError> {
        for partition in &subscription.partitions {
            let stream = stream_key(&subscription.topic, *partition);
            self.ensure_group(&stream, &subscription.group).await?;

            let cursor_key = (stream.clone(), subscription.group.clone(), subscription.consumer.clone());
            let cursor = self
                .cursors
                .lock()
                .await
                .get(&cursor_key)
                .cloned()
                .unwrap_or_else(|| ReadCursor::Pending("0".to_string()));

            let ReadCursor::Pending(after) = cursor else {
                continue;
            };

            // Entries delivered to this member before a restart and never acknowledged
            match self.read(subscription, &stream, &after, None).await? {
                Some((id, payload)) => {
                    self.cursors
                        .lock()
                        .await
                        .insert(cursor_key, ReadCursor::Pending(id.clone()));
                    debug!("Redelivering pending entry {} from {}", id, stream);
                    return Ok(Some(Self::delivery(subscription, *partition, id, payload)));
                }
                None => {
                    self.cursors.lock().await.insert(cursor_key, ReadCursor::New);
                }
            }
        }

        // Entries abandoned by members that are gone or stuck
        for partition in &subscription.partitions {
            let stream = stream_key(&subscription.topic, *partition);
            if let Some((id, payload)) = self.claim_idle(subscription, &stream).await? {
                info!("Claimed idle entry {} from {}", id, stream);
                return Ok(Some(Self::delivery(subscription, *partition, id, payload)));
            }
        }

        // Spread the block time over the partitions so one poll stays bounded
        let block_ms = u64::try_from(subscription.block.as_millis()).unwrap_or(u64::MAX)
            / subscription.partitions.len().max(1) as u64;

        for partition in &subscription.partitions {
            let stream = stream_key(&subscription.topic, *partition);
            if let Some((id, payload)) = self.read(subscription, &stream, ">", Some(block_ms.max(1))).await? {
                return Ok(Some(Self::delivery(subscription, *partition, id, payload)));
            }
        }

        Ok(None)
    }

    async fn release(&self, subscription: &Subscription, delivery: &Delivery) -> Result<(), MessagingError> {
        let stream = stream_key(&delivery.topic, delivery.partition);
        warn!("Releasing {} on {} for redelivery", delivery.id, stream);

        // Replay this member's pending list from the start on the next poll
        self.cursors.lock().await.insert(
            (stream, subscription.group.clone(), subscription.consumer.clone()),
            ReadCursor::Pending("0".to_string()),
        );
        Ok(())
    }

    async fn ack(&self, subscription: &Subscription, delivery: &Delivery) -> Result<(), MessagingError> {
        let stream = stream_key(&delivery.topic, delivery.partition);
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("XACK")
            .arg(&stream)
            .arg(&subscription.group)
            .arg(&delivery.id)
            .query_async::<_, i64>(&mut *conn)
            .await
            .map_err(|e| MessagingError::Ack {
                topic: stream.clone(),
                id: delivery.id.clone(),
                reason: e.to_string(),
            })?;

        debug!("Acknowledged {} on {}", delivery.id, stream);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), MessagingError> {
        let stream = format!("{}{}", delivery.topic, self.dead_letter_suffix);
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&delivery.payload)
            .arg("reason")
            .arg(reason)
            .arg("source")
            .arg(stream_key(&delivery.topic, delivery.partition))
            .arg("sourceId")
            .arg(&delivery.id)
            .query_async::<_, String>(&mut *conn)
            .await
            .map_err(|e| MessagingError::Publish {
                topic: stream.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}
