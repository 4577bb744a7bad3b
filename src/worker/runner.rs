use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::browser::{PageSurface, RenderingEngine};
use crate::error::{MessagingError, NavigationError, TaskFailure};
use crate::extraction::{build_url, filter_valid, record_to_json, ExtractionConfig, Extractor};
use crate::messaging::{ResultMessage, ResultSink, TaskMessage};

/// Where a label run is in its page loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Navigating,
    WaitingForContent,
    Extracting,
    Deciding,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "opening page",
            Self::Navigating => "navigation",
            Self::WaitingForContent => "waiting for content",
            Self::Extracting => "extraction",
            Self::Deciding => "pagination check",
        };
        f.write_str(name)
    }
}

/// Why a label stopped paginating without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NoValidItems,
    NoNextPage,
    PageCap,
}

/// Result of one successful iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Continue,
    Exhausted(StopReason),
}

/// Pages and items emitted so far
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub pages: u32,
    pub items: usize,
}

/// How a task run ended, as reported to the results channel.
/// A failed run still reports what it emitted before the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(Progress),
    Failed { error: String, progress: Progress },
}

impl TaskOutcome {
    pub fn progress(&self) -> Progress {
        match self {
            Self::Completed(progress) | Self::Failed { progress, .. } => *progress,
        }
    }
}

/// Timeouts used when a config does not set its own
#[derive(Debug, Clone, Copy)]
pub struct RunDefaults {
    pub navigation_timeout: Duration,
    pub selector_timeout: Duration,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_millis(90_000),
            selector_timeout: Duration::from_millis(50_000),
        }
    }
}

/// Everything a label run reads
struct LabelRun<'a> {
    task: &'a TaskMessage,
    config: &'a ExtractionConfig,
    extractor: &'a Extractor,
    label: Option<&'a str>,
    page_limit: u32,
    navigation_timeout: Duration,
    selector_timeout: Duration,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Pagination and label state machine for one task at a time
pub struct TaskRunner {
    engine: Arc<dyn RenderingEngine>,
    sink: Arc<dyn ResultSink>,
    defaults: RunDefaults,
}

impl TaskRunner {
    pub fn new(engine: Arc<dyn RenderingEngine>, sink: Arc<dyn ResultSink>, defaults: RunDefaults) -> Self {
        Self { engine, sink, defaults }
    }

    /// Run a task to its terminal result message. An `Err` means even the
    /// terminal message could not be published, so the task must be redelivered.
    pub async fn run(&self, task: &TaskMessage) -> Result<TaskOutcome, MessagingError> {
        let span = info_span!("task", task_id = %task.task_id, url = %task.url);

        async {
            info!("Starting task");

            let mut progress = Progress::default();
            let outcome = match self.run_labels(task, &mut progress).await {
                Ok(()) => {
                    self.sink
                        .emit(ResultMessage::Completed {
                            task_id: task.task_id,
                            source_url: task.url.clone(),
                            total_pages: progress.pages,
                        })
                        .await?;

                    info!("Task completed: {} pages, {} items", progress.pages, progress.items);
                    TaskOutcome::Completed(progress)
                }
                Err(failure) => {
                    let error = failure.to_string();
                    error!("Task failed: {}", error);

                    self.sink
                        .emit(ResultMessage::Failed {
                            task_id: task.task_id,
                            source_url: task.url.clone(),
                            error: error.clone(),
                        })
                        .await?;

                    TaskOutcome::Failed { error, progress }
                }
            };

            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Labels run strictly one after another; the first failure abandons the rest
    async fn run_labels(&self, task: &TaskMessage, progress: &mut Progress) -> Result<(), TaskFailure> {
        let config = task.extraction_config()?;
        let extractor = Extractor::new(&config)?;

        for label in config.labels() {
            let run = LabelRun {
                task,
                config: &config,
                extractor: &extractor,
                label: label.as_deref(),
                page_limit: config.page_limit(task.pages).max(1),
                navigation_timeout: config.navigation_timeout(self.defaults.navigation_timeout),
                selector_timeout: config.selector_timeout(self.defaults.selector_timeout),
            };

            let span = info_span!("label", label = label.as_deref().unwrap_or("-"));
            self.run_label(&run, progress).instrument(span).await?;
        }

        Ok(())
    }

    /// One page per label, closed on every exit path
    async fn run_label(&self, run: &LabelRun<'_>, progress: &mut Progress) -> Result<(), TaskFailure> {
        let mut page = self
            .engine
            .new_page()
            .await
            .map_err(|e| TaskFailure::navigation(Phase::Idle, e))?;

        let result = self.paginate(page.as_mut(), run, progress).await;

        if let Err(e) = page.close().await {
            warn!("Failed to close page: {}", e);
        }

        result
    }

    async fn paginate(
        &self,
        page: &mut dyn PageSurface,
        run: &LabelRun<'_>,
        progress: &mut Progress,
    ) -> Result<(), TaskFailure> {
        if !run.config.block_resource_types.is_empty() {
            page.block_resources(&run.config.block_resource_types)
                .await
                .map_err(|e| TaskFailure::navigation(Phase::Idle, e))?;
        }

        let mut current_page = 1;
        loop {
            match self.visit(page, run, current_page, progress).await? {
                PageOutcome::Continue => {
                    current_page += 1;
                    if let Some(delay) = run.config.page_delay() {
                        debug!("Waiting {}ms before page {}", millis(delay), current_page);
                        sleep(delay).await;
                    }
                }
                PageOutcome::Exhausted(reason) => {
                    debug!("Label finished at page {}: {:?}", current_page, reason);
                    return Ok(());
                }
            }
        }
    }

    /// One pass through Navigating, WaitingForContent, Extracting, Deciding
    async fn visit(
        &self,
        page: &mut dyn PageSurface,
        run: &LabelRun<'_>,
        current_page: u32,
        progress: &mut Progress,
    ) -> Result<PageOutcome, TaskFailure> {
        let url = build_url(&run.task.url, current_page, run.label, &run.config.pagination());
        info!(page = current_page, "Visiting {}", url);

        match timeout(run.navigation_timeout, page.navigate(&url)).await {
            Ok(result) => result.map_err(|e| TaskFailure::navigation(Phase::Navigating, e))?,
            Err(_) => {
                return Err(TaskFailure::navigation(
                    Phase::Navigating,
                    NavigationError::Timeout {
                        url,
                        timeout_ms: millis(run.navigation_timeout),
                    },
                ))
            }
        }

        if let Some(selector) = &run.config.wait_selector {
            let waited = timeout(run.selector_timeout, page.wait_for_selector(selector, run.selector_timeout)).await;
            match waited {
                Ok(result) => result.map_err(|e| TaskFailure::navigation(Phase::WaitingForContent, e))?,
                Err(_) => {
                    return Err(TaskFailure::navigation(
                        Phase::WaitingForContent,
                        NavigationError::SelectorTimeout {
                            selector: selector.clone(),
                            timeout_ms: millis(run.selector_timeout),
                        },
                    ))
                }
            }
        }

        if run.config.scroll_to_bottom {
            page.scroll_to_bottom()
                .await
                .map_err(|e| TaskFailure::navigation(Phase::WaitingForContent, e))?;
        }

        let html = page
            .content()
            .await
            .map_err(|e| TaskFailure::navigation(Phase::Extracting, e))?;
        let records = run.extractor.extract(&html);
        let valid = filter_valid(records, run.config.require_fields.as_deref());

        if valid.is_empty() {
            return Ok(PageOutcome::Exhausted(StopReason::NoValidItems));
        }

        let count = valid.len();
        self.sink
            .emit(ResultMessage::Processing {
                task_id: run.task.task_id,
                source_url: url,
                page: current_page,
                label: run.label.map(str::to_string),
                items: valid.iter().map(record_to_json).collect(),
            })
            .await?;

        progress.pages += 1;
        progress.items += count;
        debug!(page = current_page, "Emitted {} items", count);

        if let Some(selector) = &run.config.next_page_selector {
            let has_next = page
                .has_next(selector)
                .await
                .map_err(|e| TaskFailure::navigation(Phase::Deciding, e))?;
            if !has_next {
                return Ok(PageOutcome::Exhausted(StopReason::NoNextPage));
            }
        }

        if current_page >= run.page_limit {
            return Ok(PageOutcome::Exhausted(StopReason::PageCap));
        }

        Ok(PageOutcome::Continue)
    }
}
