use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::storage::Applied;
use crate::worker::runner::TaskOutcome;

/// Counters for one worker or consumer process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,

    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub pages_emitted: u64,
    pub items_emitted: u64,

    /// Total wall time spent running tasks, in milliseconds
    pub task_time_ms: u64,

    pub results_applied: usize,
    pub results_duplicate: usize,
    pub retries: usize,

    /// Messages that could not be decoded or handled, sent to a dead-letter stream
    pub dead_lettered: usize,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            tasks_completed: 0,
            tasks_failed: 0,
            pages_emitted: 0,
            items_emitted: 0,
            task_time_ms: 0,
            results_applied: 0,
            results_duplicate: 0,
            retries: 0,
            dead_lettered: 0,
        }
    }
}

impl RunStats {
    pub fn average_task_ms(&self) -> Option<u64> {
        let tasks = (self.tasks_completed + self.tasks_failed) as u64;
        (tasks > 0).then(|| self.task_time_ms / tasks)
    }
}

/// Shared handle to a process's run statistics
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    stats: Arc<Mutex<RunStats>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_task(&self, outcome: &TaskOutcome, elapsed: Duration) {
        let mut stats = self.stats.lock().await;
        stats.task_time_ms += u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match outcome {
            TaskOutcome::Completed(_) => stats.tasks_completed += 1,
            TaskOutcome::Failed { .. } => stats.tasks_failed += 1,
        }

        // Pages emitted before a failure were still delivered
        let progress = outcome.progress();
        stats.pages_emitted += u64::from(progress.pages);
        stats.items_emitted += progress.items as u64;
    }

    pub async fn record_applied(&self, applied: Applied) {
        let mut stats = self.stats.lock().await;
        match applied {
            Applied::Updated => stats.results_applied += 1,
            Applied::Duplicate => stats.results_duplicate += 1,
        }
    }

    pub async fn record_retry(&self) {
        self.stats.lock().await.retries += 1;
    }

    pub async fn record_dead_letter(&self) {
        self.stats.lock().await.dead_lettered += 1;
    }

    pub async fn snapshot(&self) -> RunStats {
        self.stats.lock().await.clone()
    }

    pub fn start_timer(&self) -> TaskTimer {
        TaskTimer { start: Instant::now() }
    }
}

/// Measures how long a task run takes
pub struct TaskTimer {
    start: Instant,
}

impl TaskTimer {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
