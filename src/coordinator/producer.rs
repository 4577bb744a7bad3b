use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ConfigError, SubmitError};
use crate::extraction::ExtractionConfig;
use crate::messaging::{Publisher, ResultMessage, TaskMessage};
use crate::storage::{ResultStore, Task};

fn default_pages() -> u32 {
    1
}

/// Input for creating a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub url: String,

    #[serde(default = "default_pages", alias = "maxPages")]
    pub pages: u32,

    pub data_type: String,

    pub config: Value,
}

/// Creates tasks and hands them to the workers
pub struct Producer {
    store: Arc<dyn ResultStore>,
    tasks: Publisher,
}

impl Producer {
    pub fn new(store: Arc<dyn ResultStore>, tasks: Publisher) -> Self {
        Self { store, tasks }
    }

    /// Validate, store as `pending`, then enqueue. Nothing is stored for an
    /// invalid request.
    pub async fn create_task(&self, request: TaskRequest) -> Result<Task, SubmitError> {
        if request.url.trim().is_empty() {
            return Err(ConfigError::Missing("url").into());
        }
        if request.data_type.trim().is_empty() {
            return Err(ConfigError::Missing("dataType").into());
        }
        if request.pages == 0 {
            return Err(ConfigError::ZeroValue("pages").into());
        }
        ExtractionConfig::from_value(request.config.clone())?;

        let task = Task::pending(request.url, request.pages, request.data_type, request.config);
        self.store.create_task(&task).await?;

        let message = TaskMessage {
            task_id: task.id,
            url: task.url.clone(),
            pages: task.max_pages,
            data_type: task.data_type.clone(),
            config: task.config.clone(),
        };

        if let Err(e) = self.tasks.send(&message).await {
            // The task would otherwise sit in pending forever
            let failed = ResultMessage::Failed {
                task_id: task.id,
                source_url: task.url.clone(),
                error: format!("failed to enqueue task: {}", e),
            };
            if let Err(mark) = self.store.apply(&failed).await {
                warn!("Could not mark task {} as failed: {}", task.id, mark);
            }
            return Err(e.into());
        }

        info!("Created task {} for {}", task.id, task.url);
        Ok(task)
    }
}
