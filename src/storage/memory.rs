use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::messaging::ResultMessage;
use crate::storage::apply::{batch_label, plan_transition, Applied, Transition};
use crate::storage::model::{ItemQuery, ScrapedItem, SearchHit, SearchPage, SortOrder, Task, TaskSummary};
use crate::storage::ResultStore;

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, Task>,
    items: Vec<ScrapedItem>,
    batches: HashSet<(Uuid, String, u32)>,
}

/// In-process result store with the same transition and ledger rules
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn items(&self, task_id: Uuid) -> Vec<ScrapedItem> {
        let state = self.state.lock().await;
        state
            .items
            .iter()
            .filter(|item| item.task_id == task_id)
            .cloned()
            .collect()
    }
}

/// Rank of a JSON type in jsonb ordering
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Ascending jsonb order for scalars; a missing field sorts after everything
fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => {
                let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<(), PersistenceError> {
        self.state.lock().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, PersistenceError> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn list_items(&self, task_id: Uuid, page: u32, limit: u32) -> Result<Vec<ScrapedItem>, PersistenceError> {
        let mut items = self.items(task_id).await;
        items.reverse();
        let skip = (page.max(1) - 1) as usize * limit as usize;
        Ok(items.into_iter().skip(skip).take(limit as usize).collect())
    }

    async fn count_items(&self, task_id: Uuid) -> Result<u64, PersistenceError> {
        Ok(self.items(task_id).await.len() as u64)
    }

    async fn search(&self, query: &ItemQuery) -> Result<SearchPage, PersistenceError> {
        let state = self.state.lock().await;

        // Insertion order stands in for the sequence column
        let mut hits: Vec<(usize, &ScrapedItem, &Task)> = state
            .items
            .iter()
            .enumerate()
            .filter_map(|(seq, item)| state.tasks.get(&item.task_id).map(|task| (seq, item, task)))
            .filter(|(_, _, task)| query.data_type.as_ref().map_or(true, |kind| *kind == task.data_type))
            .filter(|(_, item, _)| {
                query
                    .filters
                    .iter()
                    .all(|(field, value)| item.data.get(field) == Some(value))
            })
            .collect();

        hits.sort_by(|(seq_a, a, _), (seq_b, b, _)| {
            let by_field = match &query.sort_field {
                Some(field) => compare_field(a.data.get(field), b.data.get(field)),
                None => a.created_at.cmp(&b.created_at),
            };
            let ordering = by_field.then(seq_a.cmp(seq_b));
            match query.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = hits.len() as u64;
        let items = hits
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .map(|(_, item, task)| SearchHit {
                item: item.clone(),
                task: TaskSummary {
                    url: task.url.clone(),
                    data_type: task.data_type.clone(),
                },
            })
            .collect();

        Ok(SearchPage::new(items, total, query))
    }

    async fn apply(&self, message: &ResultMessage) -> Result<Applied, PersistenceError> {
        let task_id = message.task_id();
        let mut state = self.state.lock().await;
        let State { tasks, items, batches } = &mut *state;

        let task = tasks
            .get_mut(&task_id)
            .ok_or(PersistenceError::UnknownTask(task_id))?;

        let target = match plan_transition(task.status, message)? {
            Transition::Apply(target) => target,
            Transition::Duplicate => return Ok(Applied::Duplicate),
        };

        let now = Utc::now();
        match message {
            ResultMessage::Processing {
                source_url,
                page,
                label,
                items: records,
                ..
            } => {
                if !batches.insert((task_id, batch_label(label).to_string(), *page)) {
                    return Ok(Applied::Duplicate);
                }
                items.extend(records.iter().map(|data| ScrapedItem {
                    id: Uuid::new_v4(),
                    task_id,
                    source_url: source_url.clone(),
                    data: data.clone(),
                    created_at: now,
                }));
                task.current_page = *page;
            }
            ResultMessage::Completed { .. } => {}
            ResultMessage::Failed { error, .. } => {
                task.error = Some(error.clone());
            }
        }

        task.status = target;
        task.updated_at = now;

        Ok(Applied::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::TaskStatus;
    use serde_json::json;

    fn processing(task_id: Uuid, page: u32, label: Option<&str>, n: usize) -> ResultMessage {
        ResultMessage::Processing {
            task_id,
            source_url: format!("https://a.b/list?page={}", page),
            page,
            label: label.map(str::to_string),
            items: (0..n).map(|i| json!({ "i": i })).collect(),
        }
    }

    async fn store_with_task() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let task = Task::pending("https://a.b/list".to_string(), 2, "product".to_string(), json!({}));
        store.create_task(&task).await.unwrap();
        (store, task.id)
    }

    #[tokio::test]
    async fn test_completed_leaves_items_untouched() {
        let (store, id) = store_with_task().await;

        store.apply(&processing(id, 1, None, 2)).await.unwrap();
        store.apply(&processing(id, 2, None, 2)).await.unwrap();
        let before = store.items(id).await;

        let applied = store
            .apply(&ResultMessage::Completed {
                task_id: id,
                source_url: "https://a.b/list".to_string(),
                total_pages: 2,
            })
            .await
            .unwrap();

        assert_eq!(applied, Applied::Updated);
        assert_eq!(store.items(id).await, before);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.current_page, 2);
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_a_duplicate() {
        let (store, id) = store_with_task().await;

        assert_eq!(store.apply(&processing(id, 1, None, 3)).await.unwrap(), Applied::Updated);
        assert_eq!(store.apply(&processing(id, 1, None, 3)).await.unwrap(), Applied::Duplicate);
        assert_eq!(
            store.apply(&processing(id, 1, Some("shoes"), 1)).await.unwrap(),
            Applied::Updated
        );

        assert_eq!(store.count_items(id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_processing_after_failed_is_rejected() {
        let (store, id) = store_with_task().await;

        store.apply(&processing(id, 1, None, 1)).await.unwrap();
        store
            .apply(&ResultMessage::Failed {
                task_id: id,
                source_url: "https://a.b/list".to_string(),
                error: "timeout".to_string(),
            })
            .await
            .unwrap();

        let err = store.apply(&processing(id, 2, None, 1)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::OrderingViolation { .. }));

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("timeout"));
        assert_eq!(store.count_items(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let store = MemoryStore::new();
        let err = store.apply(&processing(Uuid::new_v4(), 1, None, 1)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn test_list_items_newest_first() {
        let (store, id) = store_with_task().await;
        store.apply(&processing(id, 1, None, 3)).await.unwrap();

        let first = store.list_items(id, 1, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].data, json!({ "i": 2 }));

        let second = store.list_items(id, 2, 2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data, json!({ "i": 0 }));
    }

    async fn search_fixture() -> MemoryStore {
        let store = MemoryStore::new();
        let shoes = Task::pending("https://shop.test/shoes".to_string(), 1, "product".to_string(), json!({}));
        let news = Task::pending("https://news.test/".to_string(), 1, "article".to_string(), json!({}));
        store.create_task(&shoes).await.unwrap();
        store.create_task(&news).await.unwrap();

        let batch = |task_id: Uuid, items: Vec<Value>| ResultMessage::Processing {
            task_id,
            source_url: "https://a.b/list?page=1".to_string(),
            page: 1,
            label: None,
            items,
        };
        store
            .apply(&batch(
                shoes.id,
                vec![
                    json!({ "brand": "Acme", "price": 30 }),
                    json!({ "brand": "Zeta", "price": 10 }),
                    json!({ "brand": "Acme", "price": 20 }),
                    json!({ "brand": "Acme" }),
                ],
            ))
            .await
            .unwrap();
        store
            .apply(&batch(news.id, vec![json!({ "brand": "Acme", "title": "Launch" })]))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_filters_by_data_type_and_fields() {
        let store = search_fixture().await;

        let mut query = ItemQuery {
            data_type: Some("product".to_string()),
            ..ItemQuery::default()
        };
        query.filters.insert("brand".to_string(), json!("Acme"));

        let page = store.search(&query).await.unwrap();
        assert_eq!(page.total, 3);
        assert!(page.items.iter().all(|hit| hit.task.data_type == "product"));
        assert_eq!(page.items[0].item.data, json!({ "brand": "Acme" }));

        query.filters.insert("price".to_string(), json!(20));
        let page = store.search(&query).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].task.url, "https://shop.test/shoes");

        let everything = store.search(&ItemQuery::default()).await.unwrap();
        assert_eq!(everything.total, 5);
        assert_eq!(everything.items[0].item.data["title"], json!("Launch"));
    }

    #[tokio::test]
    async fn test_search_sorts_by_data_field_and_pages() {
        let store = search_fixture().await;

        let query = ItemQuery {
            data_type: Some("product".to_string()),
            sort_field: Some("price".to_string()),
            sort_order: SortOrder::Asc,
            limit: 2,
            ..ItemQuery::default()
        };
        let first = store.search(&query).await.unwrap();
        let prices: Vec<Value> = first.items.iter().map(|hit| hit.item.data["price"].clone()).collect();
        assert_eq!(prices, vec![json!(10), json!(20)]);
        assert_eq!(first.total, 4);
        assert_eq!(first.total_pages, 2);

        let second = store.search(&ItemQuery { page: 2, ..query.clone() }).await.unwrap();
        assert_eq!(second.items[0].item.data["price"], json!(30));
        assert_eq!(second.items[1].item.data.get("price"), None);

        let descending = store
            .search(&ItemQuery {
                sort_order: SortOrder::Desc,
                ..query
            })
            .await
            .unwrap();
        assert_eq!(descending.items[0].item.data.get("price"), None);
        assert_eq!(descending.items[1].item.data["price"], json!(30));
    }
}
