use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::error::MessagingError;
use crate::messaging::{Broker, Delivery, Subscription};

#[derive(Default)]
struct GroupState {
    /// Next unread entry per partition
    cursors: HashMap<u32, usize>,
    /// Delivered, unacknowledged entry ids
    pending: BTreeMap<String, String>,
    /// Released deliveries, with the member they go back to
    released: Vec<(String, Delivery)>,
}

#[derive(Default)]
struct State {
    seq: u64,
    streams: HashMap<(String, u32), Vec<(String, String)>>,
    groups: HashMap<(String, String), GroupState>,
    dead: Vec<(Delivery, String)>,
}

/// In-process broker with consumer-group semantics
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads of a topic in publish order, across partitions
    pub async fn published(&self, topic: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut entries: Vec<(u64, String)> = state
            .streams
            .iter()
            .filter(|((t, _), _)| t == topic)
            .flat_map(|(_, entries)| entries.iter())
            .map(|(id, payload)| (id.parse().unwrap_or(0), payload.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, payload)| payload).collect()
    }

    pub async fn pending_count(&self, topic: &str, group: &str) -> usize {
        let state = self.state.lock().await;
        state
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map_or(0, |g| g.pending.len())
    }

    pub async fn dead_letters(&self) -> Vec<(Delivery, String)> {
        self.state.lock().await.dead.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, partition: u32, payload: &str) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        state.seq += 1;
        let id = state.seq.to_string();
        state
            .streams
            .entry((topic.to_string(), partition))
            .or_default()
            .push((id, payload.to_string()));
        Ok(())
    }

    async fn poll(&self, subscription: &Subscription) -> Result<Option<Delivery>, MessagingError> {
        let mut state = self.state.lock().await;
        let State { streams, groups, .. } = &mut *state;
        let group = groups
            .entry((subscription.topic.clone(), subscription.group.clone()))
            .or_default();

        let released = group.released.iter().position(|(consumer, delivery)| {
            *consumer == subscription.consumer && subscription.partitions.contains(&delivery.partition)
        });
        if let Some(index) = released {
            let (_, delivery) = group.released.remove(index);
            return Ok(Some(delivery));
        }

        for partition in &subscription.partitions {
            let Some(entries) = streams.get(&(subscription.topic.clone(), *partition)) else {
                continue;
            };
            let cursor = group.cursors.entry(*partition).or_insert(0);
            if let Some((id, payload)) = entries.get(*cursor) {
                *cursor += 1;
                group.pending.insert(id.clone(), subscription.consumer.clone());
                return Ok(Some(Delivery {
                    id: id.clone(),
                    topic: subscription.topic.clone(),
                    partition: *partition,
                    payload: payload.clone(),
                }));
            }
        }

        Ok(None)
    }

    async fn ack(&self, subscription: &Subscription, delivery: &Delivery) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        if let Some(group) = state
            .groups
            .get_mut(&(subscription.topic.clone(), subscription.group.clone()))
        {
            group.pending.remove(&delivery.id);
        }
        Ok(())
    }

    async fn release(&self, subscription: &Subscription, delivery: &Delivery) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        let group = state
            .groups
            .entry((subscription.topic.clone(), subscription.group.clone()))
            .or_default();
        if group.pending.contains_key(&delivery.id) {
            group.released.push((subscription.consumer.clone(), delivery.clone()));
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        state.dead.push((delivery.clone(), reason.to_string()));
        Ok(())
    }
}
