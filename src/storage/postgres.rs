use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::cli::config::StorageSettings;
use crate::error::PersistenceError;
use crate::messaging::ResultMessage;
use crate::storage::apply::{batch_label, plan_transition, Applied, Transition};
use crate::storage::model::{ItemQuery, ScrapedItem, SearchHit, SearchPage, Task, TaskStatus, TaskSummary};
use crate::storage::ResultStore;

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS scraping_tasks (
        id UUID PRIMARY KEY,
        url TEXT NOT NULL,
        max_pages BIGINT NOT NULL,
        data_type TEXT NOT NULL,
        config JSONB NOT NULL,
        status TEXT NOT NULL,
        current_page BIGINT NOT NULL DEFAULT 0,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS scraped_items (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL REFERENCES scraping_tasks (id),
        source_url TEXT NOT NULL,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        seq BIGSERIAL NOT NULL
    )",
    "ALTER TABLE scraped_items ADD COLUMN IF NOT EXISTS seq BIGSERIAL",
    "CREATE INDEX IF NOT EXISTS scraped_items_task_seq
        ON scraped_items (task_id, seq DESC)",
    "CREATE TABLE IF NOT EXISTS result_batches (
        task_id UUID NOT NULL REFERENCES scraping_tasks (id),
        label TEXT NOT NULL,
        page BIGINT NOT NULL,
        item_count BIGINT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (task_id, label, page)
    )",
];

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    url: String,
    max_pages: i64,
    data_type: String,
    config: Json<Value>,
    status: String,
    current_page: i64,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = PersistenceError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| PersistenceError::Corrupt(format!("task {}: bad {}", row.id, what));

        Ok(Task {
            id: row.id,
            max_pages: u32::try_from(row.max_pages).map_err(|_| corrupt("max_pages"))?,
            current_page: u32::try_from(row.current_page).map_err(|_| corrupt("current_page"))?,
            status: row.status.parse().map_err(PersistenceError::Corrupt)?,
            url: row.url,
            data_type: row.data_type,
            config: row.config.0,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    task_id: Uuid,
    source_url: String,
    data: Json<Value>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SearchRow {
    #[sqlx(flatten)]
    item: ItemRow,
    task_url: String,
    data_type: String,
}

impl From<SearchRow> for SearchHit {
    fn from(row: SearchRow) -> Self {
        SearchHit {
            item: row.item.into(),
            task: TaskSummary {
                url: row.task_url,
                data_type: row.data_type,
            },
        }
    }
}

/// FROM and WHERE clauses shared by the search count and page queries
fn push_search_conditions(builder: &mut QueryBuilder<'_, Postgres>, query: &ItemQuery) {
    builder.push(" FROM scraped_items i JOIN scraping_tasks t ON t.id = i.task_id WHERE TRUE");

    if let Some(data_type) = &query.data_type {
        builder.push(" AND t.data_type = ").push_bind(data_type.clone());
    }

    for (field, value) in &query.filters {
        builder
            .push(" AND i.data -> ")
            .push_bind(field.clone())
            .push(" = ")
            .push_bind(Json(value.clone()));
    }
}

impl From<ItemRow> for ScrapedItem {
    fn from(row: ItemRow) -> Self {
        ScrapedItem {
            id: row.id,
            task_id: row.task_id,
            source_url: row.source_url,
            data: row.data.0,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL result store
pub struct PostgresStore {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect and make sure the tables exist
    pub async fn connect(settings: &StorageSettings) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.pool_size)
            .connect(&settings.database_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL database");

        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("Ensured result store schema exists");
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn create_task(&self, task: &Task) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO scraping_tasks
                (id, url, max_pages, data_type, config, status, current_page, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(task.id)
        .bind(&task.url)
        .bind(i64::from(task.max_pages))
        .bind(&task.data_type)
        .bind(Json(&task.config))
        .bind(task.status.as_str())
        .bind(i64::from(task.current_page))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Stored task {}", task.id);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, PersistenceError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM scraping_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn list_items(&self, task_id: Uuid, page: u32, limit: u32) -> Result<Vec<ScrapedItem>, PersistenceError> {
        let offset = i64::from(page.max(1) - 1) * i64::from(limit);

        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT id, task_id, source_url, data, created_at FROM scraped_items
             WHERE task_id = $1
             ORDER BY seq DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(task_id)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ScrapedItem::from).collect())
    }

    async fn count_items(&self, task_id: Uuid) -> Result<u64, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scraped_items WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn search(&self, query: &ItemQuery) -> Result<SearchPage, PersistenceError> {
        // Count every match
        let mut count = QueryBuilder::new("SELECT COUNT(*)");
        push_search_conditions(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        // Fetch the requested page
        let mut select = QueryBuilder::new(
            "SELECT i.id, i.task_id, i.source_url, i.data, i.created_at, t.url AS task_url, t.data_type",
        );
        push_search_conditions(&mut select, query);

        let direction = query.sort_order.as_sql();
        match &query.sort_field {
            Some(field) => {
                select
                    .push(" ORDER BY i.data -> ")
                    .push_bind(field.clone())
                    .push(format!(" {}, i.seq {}", direction, direction));
            }
            None => {
                select.push(format!(" ORDER BY i.created_at {}, i.seq {}", direction, direction));
            }
        }

        select
            .push(" LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows: Vec<SearchRow> = select.build_query_as().fetch_all(&self.pool).await?;
        debug!("Search matched {} items", total);

        Ok(SearchPage::new(
            rows.into_iter().map(SearchHit::from).collect(),
            u64::try_from(total).unwrap_or(0),
            query,
        ))
    }

    async fn apply(&self, message: &ResultMessage) -> Result<Applied, PersistenceError> {
        let task_id = message.task_id();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM scraping_tasks WHERE id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current: TaskStatus = status
            .ok_or(PersistenceError::UnknownTask(task_id))?
            .parse()
            .map_err(PersistenceError::Corrupt)?;

        let target = match plan_transition(current, message)? {
            Transition::Apply(target) => target,
            Transition::Duplicate => {
                tx.rollback().await?;
                return Ok(Applied::Duplicate);
            }
        };

        match message {
            ResultMessage::Processing {
                source_url,
                page,
                label,
                items,
                ..
            } => {
                let recorded = sqlx::query(
                    "INSERT INTO result_batches (task_id, label, page, item_count)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT DO NOTHING",
                )
                .bind(task_id)
                .bind(batch_label(label))
                .bind(i64::from(*page))
                .bind(items.len() as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if recorded == 0 {
                    tx.rollback().await?;
                    debug!("Batch {} page {} of task {} already applied", batch_label(label), page, task_id);
                    return Ok(Applied::Duplicate);
                }

                if !items.is_empty() {
                    let mut builder: QueryBuilder<Postgres> =
                        QueryBuilder::new("INSERT INTO scraped_items (id, task_id, source_url, data) ");
                    builder.push_values(items.iter(), |mut row, item| {
                        row.push_bind(Uuid::new_v4())
                            .push_bind(task_id)
                            .push_bind(source_url.clone())
                            .push_bind(Json(item.clone()));
                    });
                    builder.build().execute(&mut *tx).await?;
                }

                sqlx::query(
                    "UPDATE scraping_tasks SET status = $2, current_page = $3, updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(task_id)
                .bind(target.as_str())
                .bind(i64::from(*page))
                .execute(&mut *tx)
                .await?;
            }
            ResultMessage::Completed { .. } => {
                sqlx::query("UPDATE scraping_tasks SET status = $2, updated_at = NOW() WHERE id = $1")
                    .bind(task_id)
                    .bind(target.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
            ResultMessage::Failed { error, .. } => {
                sqlx::query(
                    "UPDATE scraping_tasks SET status = $2, error = $3, updated_at = NOW() WHERE id = $1",
                )
                .bind(task_id)
                .bind(target.as_str())
                .bind(error)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("Applied {} for task {}", message.kind(), task_id);

        Ok(Applied::Updated)
    }
}
