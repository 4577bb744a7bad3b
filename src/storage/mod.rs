pub mod apply;
pub mod model;
pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use self::model::{ScrapedItem, SearchPage};
use crate::error::PersistenceError;
use crate::messaging::ResultMessage;

// Re-export common types
pub use self::apply::Applied;
pub use self::model::{ItemQuery, SortOrder, Task};
pub use self::postgres::PostgresStore;

/// Durable task and item store. `apply` runs one result message as a single
/// atomic unit.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<(), PersistenceError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, PersistenceError>;

    /// Items of a task, newest first; `page` is 1-based
    async fn list_items(&self, task_id: Uuid, page: u32, limit: u32) -> Result<Vec<ScrapedItem>, PersistenceError>;

    async fn count_items(&self, task_id: Uuid) -> Result<u64, PersistenceError>;

    /// Items across tasks matching `query`, with the total match count
    async fn search(&self, query: &ItemQuery) -> Result<SearchPage, PersistenceError>;

    async fn apply(&self, message: &ResultMessage) -> Result<Applied, PersistenceError>;
}
