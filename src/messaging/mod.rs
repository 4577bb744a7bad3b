pub mod message;
pub mod streams;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::MessagingError;

// Re-export common types
pub use self::message::{Keyed, ResultMessage, TaskMessage};
pub use self::streams::RedisBroker;

/// A message handed to a consumer, not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned entry id
    pub id: String,
    pub topic: String,
    pub partition: u32,
    pub payload: String,
}

/// A consumer-group member bound to a set of partitions of one topic
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub group: String,
    pub consumer: String,
    pub partitions: Vec<u32>,
    /// How long a poll may wait for new entries
    pub block: Duration,
}

/// At-least-once, partition-ordered message channel
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, partition: u32, payload: &str) -> Result<(), MessagingError>;

    /// Next delivery for this member, redelivering unacknowledged ones first
    async fn poll(&self, subscription: &Subscription) -> Result<Option<Delivery>, MessagingError>;

    async fn ack(&self, subscription: &Subscription, delivery: &Delivery) -> Result<(), MessagingError>;

    /// Give back a delivery that could not be handled; it stays unacknowledged
    /// and is handed to this member again on a later poll
    async fn release(&self, subscription: &Subscription, delivery: &Delivery) -> Result<(), MessagingError>;

    /// Park a delivery that cannot be handled, with the reason
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), MessagingError>;
}

/// Stable partition for a key
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

/// Partitions a member consumes: the assigned ones, or all of them
pub fn resolve_partitions(assigned: &[u32], total: u32) -> Vec<u32> {
    if assigned.is_empty() {
        (0..total.max(1)).collect()
    } else {
        assigned.to_vec()
    }
}

/// Sink the pagination state machine emits its results into
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn emit(&self, message: ResultMessage) -> Result<(), MessagingError>;
}

/// Publishes keyed messages to one topic, routing by partition key
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    topic: String,
    partitions: u32,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>, partitions: u32) -> Self {
        Self {
            broker,
            topic: topic.into(),
            partitions: partitions.max(1),
        }
    }

    pub async fn send<M>(&self, message: &M) -> Result<(), MessagingError>
    where
        M: Serialize + Keyed + Sync,
    {
        let payload = serde_json::to_string(message)?;
        let partition = partition_for(&message.partition_key(), self.partitions);

        self.broker.publish(&self.topic, partition, &payload).await?;
        debug!("Published to {}:{}", self.topic, partition);

        Ok(())
    }
}

#[async_trait]
impl ResultSink for Publisher {
    async fn emit(&self, message: ResultMessage) -> Result<(), MessagingError> {
        self.send(&message).await
    }
}

/// A delivery together with its decoded message
pub struct Received<M> {
    pub delivery: Delivery,
    pub message: Result<M, serde_json::Error>,
}

/// Pulls and decodes messages of type `M` for one subscription
pub struct Subscriber<M> {
    broker: Arc<dyn Broker>,
    subscription: Subscription,
    _message: PhantomData<fn() -> M>,
}

impl<M: DeserializeOwned> Subscriber<M> {
    pub fn new(broker: Arc<dyn Broker>, subscription: Subscription) -> Self {
        Self {
            broker,
            subscription,
            _message: PhantomData,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub async fn next(&self) -> Result<Option<Received<M>>, MessagingError> {
        let Some(delivery) = self.broker.poll(&self.subscription).await? else {
            return Ok(None);
        };

        let message = serde_json::from_str(&delivery.payload);
        Ok(Some(Received { delivery, message }))
    }

    pub async fn ack(&self, received: &Received<M>) -> Result<(), MessagingError> {
        self.broker.ack(&self.subscription, &received.delivery).await
    }

    pub async fn release(&self, received: &Received<M>) -> Result<(), MessagingError> {
        self.broker.release(&self.subscription, &received.delivery).await
    }

    /// Dead-letter, then acknowledge so the delivery is not handed out again
    pub async fn reject(&self, received: &Received<M>, reason: &str) -> Result<(), MessagingError> {
        warn!(
            "Dead-lettering {} from {}:{}: {}",
            received.delivery.id, received.delivery.topic, received.delivery.partition, reason
        );
        self.broker.dead_letter(&received.delivery, reason).await?;
        self.ack(received).await
    }
}
