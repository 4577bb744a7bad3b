use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a task. Moves forward only; `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// One requested extraction job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub url: String,
    pub max_pages: u32,
    pub data_type: String,

    /// Extraction config as submitted, already validated
    pub config: Value,

    pub status: TaskStatus,
    pub current_page: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// A freshly created task, not yet seen by any worker
    pub fn pending(url: String, max_pages: u32, data_type: String, config: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url,
            max_pages,
            data_type,
            config,
            status: TaskStatus::Pending,
            current_page: 0,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// An extracted record. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedItem {
    pub id: Uuid,
    pub task_id: Uuid,
    pub source_url: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

/// Item search across tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemQuery {
    /// Only items of tasks with this data type
    pub data_type: Option<String>,

    /// Top-level fields of the item data that must equal these values; all must match
    pub filters: BTreeMap<String, Value>,

    /// Item data field to sort by; creation time when absent
    pub sort_field: Option<String>,
    pub sort_order: SortOrder,

    /// 1-based
    pub page: u32,
    pub limit: u32,
}

impl Default for ItemQuery {
    fn default() -> Self {
        Self {
            data_type: None,
            filters: BTreeMap::new(),
            sort_field: None,
            sort_order: SortOrder::Desc,
            page: 1,
            limit: 10,
        }
    }
}

impl ItemQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }
}

/// The task an item came from, as shown in search results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub url: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub item: ScrapedItem,
    pub task: TaskSummary,
}

/// One page of search results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub items: Vec<SearchHit>,
    pub total: u64,
    pub page: u32,
    pub total_pages: u64,
}

impl SearchPage {
    pub fn new(items: Vec<SearchHit>, total: u64, query: &ItemQuery) -> Self {
        let limit = u64::from(query.limit.max(1));
        Self {
            items,
            total,
            page: query.page.max(1),
            total_pages: (total + limit - 1) / limit,
        }
    }
}
