use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::browser::RenderingEngine;
use crate::error::MessagingError;
use crate::messaging::{Received, ResultSink, Subscriber, TaskMessage};
use crate::utils::{RunStats, StatsCollector};
use crate::worker::runner::{RunDefaults, TaskOutcome, TaskRunner};

/// Pause after a broker error before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer-group member handling one task at a time
pub struct Worker {
    engine: Arc<dyn RenderingEngine>,
    runner: TaskRunner,
    tasks: Subscriber<TaskMessage>,
    stats: StatsCollector,
}

impl Worker {
    pub fn new(
        engine: Arc<dyn RenderingEngine>,
        results: Arc<dyn ResultSink>,
        tasks: Subscriber<TaskMessage>,
        defaults: RunDefaults,
    ) -> Self {
        Self {
            runner: TaskRunner::new(engine.clone(), results, defaults),
            engine,
            tasks,
            stats: StatsCollector::new(),
        }
    }

    pub fn stats(&self) -> StatsCollector {
        self.stats.clone()
    }

    /// Take one task off the channel and run it to its terminal message.
    /// Returns `false` when nothing was waiting.
    pub async fn process_next(&self) -> Result<bool, MessagingError> {
        let Some(received) = self.tasks.next().await? else {
            return Ok(false);
        };

        let task = match &received.message {
            Ok(task) => task,
            Err(e) => {
                self.tasks
                    .reject(&received, &format!("malformed task message: {}", e))
                    .await?;
                self.stats.record_dead_letter().await;
                return Ok(true);
            }
        };

        let timer = self.stats.start_timer();
        let outcome = match self.runner.run(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // No terminal message went out; hand the task back for redelivery
                error!("Task {} left unacknowledged: {}", task.task_id, e);
                self.release(&received).await;
                return Err(e);
            }
        };

        if let Err(e) = self.tasks.ack(&received).await {
            self.release(&received).await;
            return Err(e);
        }

        self.stats.record_task(&outcome, timer.elapsed()).await;
        if let TaskOutcome::Failed { error, .. } = &outcome {
            warn!("Task {} ended with failure: {}", task.task_id, error);
        }

        Ok(true)
    }

    async fn release(&self, received: &Received<TaskMessage>) {
        if let Err(e) = self.tasks.release(received).await {
            warn!("Failed to release task delivery {}: {}", received.delivery.id, e);
        }
    }

    /// Run until `shutdown` flips. The signal is only looked at between tasks,
    /// so an in-flight task always finishes before the engine is released.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> RunStats {
        let subscription = self.tasks.subscription();
        info!(
            "Worker {} consuming {} partitions {:?}",
            subscription.consumer, subscription.topic, subscription.partitions
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.process_next().await {
                error!("Worker error: {}", e);
                sleep(ERROR_BACKOFF).await;
            }
        }

        info!("Shutdown requested, releasing rendering engine");
        if let Err(e) = self.engine.shutdown().await {
            warn!("Failed to shut down rendering engine: {}", e);
        }

        let stats = self.stats.snapshot().await;
        info!(
            "Worker stopped: {} completed, {} failed, {} pages, {} items, {} dead-lettered",
            stats.tasks_completed, stats.tasks_failed, stats.pages_emitted, stats.items_emitted, stats.dead_lettered
        );
        stats
    }
}
