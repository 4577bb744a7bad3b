use thiserror::Error;
use uuid::Uuid;

use crate::storage::model::TaskStatus;
use crate::worker::runner::Phase;

/// Malformed or incomplete extraction configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("invalid selector for {field} ({selector}): {reason}")]
    InvalidSelector {
        field: String,
        selector: String,
        reason: String,
    },

    #[error("requireFields names an undeclared field: {0}")]
    UnknownRequiredField(String),

    #[error("{0} must be at least 1")]
    ZeroValue(&'static str),

    #[error("malformed extraction config: {0}")]
    Malformed(String),
}

/// Page fetch and content-wait failures. Always fatal to the task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("navigation to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("selector {selector} did not appear within {timeout_ms}ms")]
    SelectorTimeout { selector: String, timeout_ms: u64 },

    #[error("failed to load {url}: {reason}")]
    Failed { url: String, reason: String },

    #[error("rendering engine error: {0}")]
    Engine(String),
}

/// Field-level evaluation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("field {field}: {reason}")]
    Field { field: String, reason: String },
}

/// Broker connect, publish and subscribe failures
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to read from {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("failed to acknowledge {id} on {topic}: {reason}")]
    Ack {
        topic: String,
        id: String,
        reason: String,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures applying result messages to the durable store
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task {0} not found")]
    UnknownTask(Uuid),

    #[error("ordering violation for task {task_id}: {message} message after terminal status {status}")]
    OrderingViolation {
        task_id: Uuid,
        status: TaskStatus,
        message: &'static str,
    },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Everything that aborts a task run and is reported through a `Failed` result
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("invalid extraction config: {0}")]
    Config(#[from] ConfigError),

    #[error("{phase} failed: {source}")]
    Navigation {
        phase: Phase,
        #[source]
        source: NavigationError,
    },

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("publishing results failed: {0}")]
    Messaging(#[from] MessagingError),
}

impl TaskFailure {
    pub fn navigation(phase: Phase, source: NavigationError) -> Self {
        Self::Navigation { phase, source }
    }
}

/// Task creation failures
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}
