use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::extraction::ExtractionConfig;

/// Messages that carry the key used to pick their partition
pub trait Keyed {
    fn partition_key(&self) -> String;
}

fn default_pages() -> u32 {
    1
}

/// Wire projection of a task sent to workers on the tasks channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: Uuid,

    pub url: String,

    #[serde(default = "default_pages", alias = "maxPages")]
    pub pages: u32,

    pub data_type: String,

    /// Kept as raw JSON so a worker can report a bad config as a failed task
    pub config: Value,
}

impl TaskMessage {
    pub fn extraction_config(&self) -> Result<ExtractionConfig, ConfigError> {
        ExtractionConfig::from_value(self.config.clone())
    }
}

impl Keyed for TaskMessage {
    fn partition_key(&self) -> String {
        self.task_id.to_string()
    }
}

/// Incremental progress and terminal outcome of a task, on the results channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResultMessage {
    #[serde(rename_all = "camelCase")]
    Processing {
        task_id: Uuid,
        source_url: String,
        page: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, alias = "data")]
        items: Vec<Value>,
    },

    #[serde(rename_all = "camelCase")]
    Completed {
        task_id: Uuid,
        source_url: String,
        total_pages: u32,
    },

    #[serde(rename_all = "camelCase")]
    Failed {
        task_id: Uuid,
        source_url: String,
        error: String,
    },
}

impl ResultMessage {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Processing { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. } => *task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Processing { .. } => "processing",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

impl Keyed for ResultMessage {
    fn partition_key(&self) -> String {
        self.task_id().to_string()
    }
}
