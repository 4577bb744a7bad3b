use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::MessagingError;
use crate::messaging::{Received, ResultMessage, Subscriber};
use crate::storage::{Applied, ResultStore};
use crate::utils::{RunStats, StatsCollector};

/// Pause after a broker error before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Exponential backoff with jitter for retryable store failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts in total, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): half the capped
    /// exponential step, plus up to the other half at random
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let step = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let half = step / 2;
        let jitter = rand::thread_rng().gen_range(0..=u64::try_from(half.as_millis()).unwrap_or(u64::MAX));
        half + Duration::from_millis(jitter)
    }
}

/// Applies result messages to the store, acknowledging each only after it
/// has been applied or dead-lettered
pub struct ResultConsumer {
    store: Arc<dyn ResultStore>,
    results: Subscriber<ResultMessage>,
    retry: RetryPolicy,
    stats: StatsCollector,
}

impl ResultConsumer {
    pub fn new(store: Arc<dyn ResultStore>, results: Subscriber<ResultMessage>, retry: RetryPolicy) -> Self {
        Self {
            store,
            results,
            retry,
            stats: StatsCollector::new(),
        }
    }

    pub fn stats(&self) -> StatsCollector {
        self.stats.clone()
    }

    /// Handle one delivery. Returns `false` when nothing was waiting.
    pub async fn process_next(&self) -> Result<bool, MessagingError> {
        let Some(received) = self.results.next().await? else {
            return Ok(false);
        };

        if let Err(e) = self.handle(&received).await {
            // Neither acknowledged nor dead-lettered; hand it back for redelivery
            if let Err(release) = self.results.release(&received).await {
                warn!("Failed to release result delivery {}: {}", received.delivery.id, release);
            }
            return Err(e);
        }

        Ok(true)
    }

    async fn handle(&self, received: &Received<ResultMessage>) -> Result<(), MessagingError> {
        let message = match &received.message {
            Ok(message) => message,
            Err(e) => {
                self.results
                    .reject(received, &format!("malformed result message: {}", e))
                    .await?;
                self.stats.record_dead_letter().await;
                return Ok(());
            }
        };

        let mut attempt = 1;
        loop {
            match self.store.apply(message).await {
                Ok(applied) => {
                    self.results.ack(received).await?;
                    self.stats.record_applied(applied).await;
                    if applied == Applied::Duplicate {
                        debug!("Skipped duplicate {} for task {}", message.kind(), message.task_id());
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Applying {} for task {} failed (attempt {}/{}), retrying in {}ms: {}",
                        message.kind(),
                        message.task_id(),
                        attempt,
                        self.retry.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    self.stats.record_retry().await;
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Giving up on {} for task {}: {}", message.kind(), message.task_id(), e);
                    self.results.reject(received, &e.to_string()).await?;
                    self.stats.record_dead_letter().await;
                    return Ok(());
                }
            }
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> RunStats {
        let subscription = self.results.subscription();
        info!(
            "Consumer {} reading {} partitions {:?}",
            subscription.consumer, subscription.topic, subscription.partitions
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.process_next().await {
                error!("Consumer error: {}", e);
                sleep(ERROR_BACKOFF).await;
            }
        }

        let stats = self.stats.snapshot().await;
        info!(
            "Consumer stopped: {} applied, {} duplicates, {} retries, {} dead-lettered",
            stats.results_applied, stats.results_duplicate, stats.retries, stats.dead_lettered
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::{Broker, Publisher, Subscription, TaskMessage};
    use crate::storage::memory::MemoryStore;
    use crate::storage::model::TaskStatus;
    use crate::storage::{MockResultStore, Task};
    use crate::testing::{items_page, Fixture, FixtureEngine};
    use crate::worker::runner::{RunDefaults, TaskRunner};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn subscriber(broker: &Arc<MemoryBroker>) -> Subscriber<ResultMessage> {
        Subscriber::new(
            broker.clone(),
            Subscription {
                topic: "results".to_string(),
                group: "core-results-group".to_string(),
                consumer: "core-1".to_string(),
                partitions: vec![0, 1, 2],
                block: Duration::from_millis(10),
            },
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    async fn publish_completed(broker: &Arc<MemoryBroker>) {
        Publisher::new(broker.clone(), "results", 3)
            .send(&ResultMessage::Completed {
                task_id: Uuid::new_v4(),
                source_url: "https://shop.test".to_string(),
                total_pages: 1,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let policy = fast_retry(5);
        for attempt in 1..=8 {
            let delay = policy.delay(attempt);
            let step = Duration::from_millis(100 * 2u64.pow(attempt - 1)).min(Duration::from_secs(1));
            assert!(delay >= step / 2, "attempt {}: {:?}", attempt, delay);
            assert!(delay <= step, "attempt {}: {:?}", attempt, delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_acks() {
        let broker = Arc::new(MemoryBroker::new());
        publish_completed(&broker).await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut store = MockResultStore::new();
        store.expect_apply().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
            } else {
                Ok(Applied::Updated)
            }
        });

        let consumer = ResultConsumer::new(Arc::new(store), subscriber(&broker), fast_retry(5));
        assert!(consumer.process_next().await.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.pending_count("results", "core-results-group").await, 0);
        assert!(broker.dead_letters().await.is_empty());

        let stats = consumer.stats().snapshot().await;
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.results_applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letters_after_max_attempts() {
        let broker = Arc::new(MemoryBroker::new());
        publish_completed(&broker).await;

        let mut store = MockResultStore::new();
        store
            .expect_apply()
            .times(3)
            .returning(|_| Err(PersistenceError::Database(sqlx::Error::PoolTimedOut)));

        let consumer = ResultConsumer::new(Arc::new(store), subscriber(&broker), fast_retry(3));
        assert!(consumer.process_next().await.unwrap());

        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("database error"), "{}", dead[0].1);
        assert_eq!(broker.pending_count("results", "core-results-group").await, 0);
    }

    #[tokio::test]
    async fn test_ordering_violation_is_dead_lettered_without_retry() {
        let broker = Arc::new(MemoryBroker::new());
        publish_completed(&broker).await;

        let mut store = MockResultStore::new();
        store.expect_apply().times(1).returning(|message| {
            Err(PersistenceError::OrderingViolation {
                task_id: message.task_id(),
                status: TaskStatus::Failed,
                message: message.kind(),
            })
        });

        let consumer = ResultConsumer::new(Arc::new(store), subscriber(&broker), fast_retry(5));
        assert!(consumer.process_next().await.unwrap());

        assert_eq!(broker.dead_letters().await.len(), 1);
        assert_eq!(consumer.stats().snapshot().await.retries, 0);
    }

    #[tokio::test]
    async fn test_malformed_result_is_dead_lettered() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .publish("results", 1, r#"{"status": "exploded"}"#)
            .await
            .unwrap();

        let mut store = MockResultStore::new();
        store.expect_apply().never();

        let consumer = ResultConsumer::new(Arc::new(store), subscriber(&broker), fast_retry(5));
        assert!(consumer.process_next().await.unwrap());
        assert!(!consumer.process_next().await.unwrap());

        assert_eq!(broker.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stops_when_shutdown_is_signalled() {
        let broker = Arc::new(MemoryBroker::new());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let consumer = ResultConsumer::new(Arc::new(MemoryStore::new()), subscriber(&broker), fast_retry(1));
        let stats = consumer.run(rx).await;

        assert_eq!(stats.results_applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_on_second_page_keeps_first_page_items() {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryStore::new());

        let config = json!({
            "itemContainerSelector": ".item",
            "fields": { "title": "h2" },
            "navigationTimeoutMs": 2000
        });
        let task = Task::pending("https://shop.test/list".to_string(), 3, "product".to_string(), config.clone());
        store.create_task(&task).await.unwrap();

        let engine = Arc::new(
            FixtureEngine::new()
                .with_page("https://shop.test/list?page=1", Fixture::Html(items_page(&["A", "B"])))
                .with_page("https://shop.test/list?page=2", Fixture::Hang),
        );
        let runner = TaskRunner::new(
            engine,
            Arc::new(Publisher::new(broker.clone(), "results", 3)),
            RunDefaults::default(),
        );
        runner
            .run(&TaskMessage {
                task_id: task.id,
                url: task.url.clone(),
                pages: 3,
                data_type: task.data_type.clone(),
                config,
            })
            .await
            .unwrap();

        let consumer = ResultConsumer::new(store.clone(), subscriber(&broker), fast_retry(3));
        while consumer.process_next().await.unwrap() {}

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.current_page, 1);
        assert!(stored.error.unwrap().contains("timed out"));

        let items: Vec<_> = store.items(task.id).await.into_iter().map(|item| item.data).collect();
        assert_eq!(items, vec![json!({ "title": "A" }), json!({ "title": "B" })]);
        assert_eq!(broker.pending_count("results", "core-results-group").await, 0);
    }

    #[tokio::test]
    async fn test_redelivered_processing_is_applied_once() {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let task = Task::pending("https://shop.test/list".to_string(), 1, "product".to_string(), json!({}));
        store.create_task(&task).await.unwrap();

        let publisher = Publisher::new(broker.clone(), "results", 3);
        let processing = ResultMessage::Processing {
            task_id: task.id,
            source_url: "https://shop.test/list?page=1".to_string(),
            page: 1,
            label: None,
            items: vec![json!({ "title": "A" })],
        };
        publisher.send(&processing).await.unwrap();
        publisher.send(&processing).await.unwrap();

        let consumer = ResultConsumer::new(store.clone(), subscriber(&broker), fast_retry(3));
        while consumer.process_next().await.unwrap() {}

        assert_eq!(store.count_items(task.id).await.unwrap(), 1);
        let stats = consumer.stats().snapshot().await;
        assert_eq!(stats.results_applied, 1);
        assert_eq!(stats.results_duplicate, 1);
    }
}
