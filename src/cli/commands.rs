use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{HttpEngine, RenderingEngine, WebDriverEngine};
use crate::cli::config::{EngineKind, ServiceConfig};
use crate::coordinator::{Producer, ResultConsumer, TaskRequest};
use crate::messaging::{resolve_partitions, Publisher, RedisBroker, Subscriber, Subscription};
use crate::storage::{ItemQuery, PostgresStore, ResultStore, SortOrder};
use crate::utils::default_log_file;
use crate::worker::Worker;

async fn connect_broker(config: &ServiceConfig) -> Result<Arc<RedisBroker>> {
    let broker = RedisBroker::connect(&config.broker)
        .await
        .context("Failed to connect to the message broker")?;
    Ok(Arc::new(broker))
}

async fn connect_store(config: &ServiceConfig) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(&config.storage)
        .await
        .context(format!("Failed to connect to PostgreSQL: {}", config.storage.database_url))?;
    Ok(Arc::new(store))
}

async fn start_engine(config: &ServiceConfig) -> Result<Arc<dyn RenderingEngine>> {
    let engine: Arc<dyn RenderingEngine> = match config.worker.engine {
        EngineKind::Webdriver => Arc::new(
            WebDriverEngine::connect(&config.browser)
                .await
                .context("Failed to start the browser")?,
        ),
        EngineKind::Http => Arc::new(HttpEngine::new(&config.browser).context("Failed to create HTTP engine")?),
    };
    Ok(engine)
}

/// Flips to `true` on Ctrl-C or SIGTERM
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing current work");
        let _ = tx.send(true);
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run a scraping worker until shut down
pub async fn worker(config: ServiceConfig) -> Result<()> {
    let broker = connect_broker(&config).await?;
    let engine = start_engine(&config).await?;

    let results = Publisher::new(broker.clone(), &config.broker.results_topic, config.broker.partitions);
    let tasks = Subscriber::new(
        broker,
        Subscription {
            topic: config.broker.tasks_topic.clone(),
            group: config.worker.group.clone(),
            consumer: config.worker.consumer_name.clone(),
            partitions: resolve_partitions(&config.worker.partitions, config.broker.partitions),
            block: config.broker.poll_block(),
        },
    );

    let worker = Worker::new(engine, Arc::new(results), tasks, config.worker.run_defaults());
    let stats = worker.run(shutdown_signal()).await;

    if let Some(average) = stats.average_task_ms() {
        info!("Average task time: {}ms", average);
    }
    Ok(())
}

/// Run the result consumer until shut down
pub async fn consumer(config: ServiceConfig) -> Result<()> {
    let broker = connect_broker(&config).await?;
    let store = connect_store(&config).await?;

    let results = Subscriber::new(
        broker,
        Subscription {
            topic: config.broker.results_topic.clone(),
            group: config.consumer.group.clone(),
            consumer: config.consumer.consumer_name.clone(),
            partitions: resolve_partitions(&config.consumer.partitions, config.broker.partitions),
            block: config.broker.poll_block(),
        },
    );

    ResultConsumer::new(store, results, config.consumer.retry_policy())
        .run(shutdown_signal())
        .await;
    Ok(())
}

/// Read an extraction config from a JSON or YAML file
fn read_extraction_config(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path)
        .context(format!("Failed to read extraction config: {}", path.display()))?;

    let is_json = path.extension().map_or(false, |ext| ext == "json");
    if is_json {
        serde_json::from_str(&contents).context(format!("Failed to parse JSON config: {}", path.display()))
    } else {
        serde_yaml::from_str(&contents).context(format!("Failed to parse YAML config: {}", path.display()))
    }
}

/// Create a task and enqueue it
pub async fn submit(config: ServiceConfig, url: String, path: PathBuf, data_type: String, pages: u32) -> Result<()> {
    let extraction = read_extraction_config(&path)?;

    let broker = connect_broker(&config).await?;
    let store = connect_store(&config).await?;
    let producer = Producer::new(
        store,
        Publisher::new(broker, &config.broker.tasks_topic, config.broker.partitions),
    );

    let task = producer
        .create_task(TaskRequest {
            url,
            pages,
            data_type,
            config: extraction,
        })
        .await
        .context("Failed to create task")?;

    println!("Task created: {}", task.id);
    println!("Use `scraper status {}` to check progress", task.id);

    Ok(())
}

/// Print the status of a task
pub async fn status(config: ServiceConfig, task_id: Uuid) -> Result<()> {
    let store = connect_store(&config).await?;

    let Some(task) = store.get_task(task_id).await? else {
        anyhow::bail!("Task {} not found", task_id)
    };
    let items = store.count_items(task_id).await?;

    println!("Task ID: {}", task.id);
    println!("URL: {}", task.url);
    println!("Status: {}", task.status);
    println!("Current Page: {}/{}", task.current_page, task.max_pages);
    println!("Items: {}", items);
    println!("Created: {}", task.created_at);
    println!("Last Updated: {}", task.updated_at);

    if let Some(error) = &task.error {
        println!("Error: {}", error);
    }

    Ok(())
}

/// Print a page of a task's items as JSON, newest first
pub async fn items(config: ServiceConfig, task_id: Uuid, page: u32, limit: u32) -> Result<()> {
    let store = connect_store(&config).await?;

    let Some(task) = store.get_task(task_id).await? else {
        anyhow::bail!("Task {} not found", task_id)
    };
    let total = store.count_items(task_id).await?;
    let items = store.list_items(task_id, page, limit).await?;

    let output = serde_json::json!({
        "task": task,
        "items": items,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
        },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Build a search query; each filter is `FIELD=VALUE`, where VALUE is read
/// as JSON when it parses and as a plain string otherwise
pub fn item_query(
    data_type: Option<String>,
    filters: &[String],
    sort_field: Option<String>,
    sort_order: SortOrder,
    page: u32,
    limit: u32,
) -> Result<ItemQuery> {
    let mut query = ItemQuery {
        data_type,
        sort_field,
        sort_order,
        page: page.max(1),
        limit: limit.max(1),
        ..ItemQuery::default()
    };

    for filter in filters {
        let Some((field, raw)) = filter.split_once('=') else {
            anyhow::bail!("Filter '{}' is not of the form FIELD=VALUE", filter)
        };
        if field.is_empty() {
            anyhow::bail!("Filter '{}' has no field name", filter)
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        query.filters.insert(field.to_string(), value);
    }

    Ok(query)
}

/// Print one page of matching items as JSON
pub async fn search(config: ServiceConfig, query: ItemQuery) -> Result<()> {
    let store = connect_store(&config).await?;
    let results = store.search(&query).await.context("Search failed")?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = ServiceConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from defaults if it does not exist
pub fn manage_profile(profile_name: String) -> Result<()> {
    match ServiceConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let path = ServiceConfig::default().save_as_profile(&profile_name)?;
            println!("Created default profile: {}", path.display());
        }
    }

    Ok(())
}

/// Show the configuration in effect
pub fn show_config(config: &ServiceConfig) -> Result<()> {
    println!("Configuration directory: {}", ServiceConfig::config_dir().display());
    println!("Suggested log file: {}", default_log_file().display());
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}
