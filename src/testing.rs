//! Fake rendering engine and result sink for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::{has_next_in_html, html_matches, PageSurface, RenderingEngine};
use crate::error::{MessagingError, NavigationError};
use crate::extraction::ResourceType;
use crate::messaging::{ResultMessage, ResultSink};

/// What navigating to a URL does
#[derive(Debug, Clone)]
pub enum Fixture {
    Html(String),
    /// Never finishes loading
    Hang,
    Fail(String),
}

/// Markup with one `.item` container per title
pub fn items_page(titles: &[&str]) -> String {
    let items: String = titles
        .iter()
        .map(|title| format!("<div class=\"item\"><h2>{}</h2></div>", title))
        .collect();
    format!("<html><body>{}</body></html>", items)
}

#[derive(Default)]
struct Counters {
    opened: usize,
    closed: usize,
    scrolls: usize,
    visited: Vec<String>,
    blocked: Vec<ResourceType>,
    shut_down: bool,
}

#[derive(Default)]
pub struct FixtureEngine {
    pages: HashMap<String, Fixture>,
    default: Option<Fixture>,
    counters: Arc<Mutex<Counters>>,
}

impl FixtureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, fixture: Fixture) -> Self {
        self.pages.insert(url.to_string(), fixture);
        self
    }

    /// Fixture for every URL without its own
    pub fn with_default(mut self, fixture: Fixture) -> Self {
        self.default = Some(fixture);
        self
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap()
    }

    pub fn opened(&self) -> usize {
        self.counters().opened
    }

    pub fn closed(&self) -> usize {
        self.counters().closed
    }

    pub fn scrolls(&self) -> usize {
        self.counters().scrolls
    }

    pub fn visited(&self) -> Vec<String> {
        self.counters().visited.clone()
    }

    pub fn blocked(&self) -> Vec<ResourceType> {
        self.counters().blocked.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.counters().shut_down
    }
}

#[async_trait]
impl RenderingEngine for FixtureEngine {
    async fn new_page(&self) -> Result<Box<dyn PageSurface>, NavigationError> {
        self.counters().opened += 1;
        Ok(Box::new(FixturePage {
            pages: self.pages.clone(),
            default: self.default.clone(),
            counters: self.counters.clone(),
            document: None,
        }))
    }

    async fn shutdown(&self) -> Result<(), NavigationError> {
        self.counters().shut_down = true;
        Ok(())
    }
}

struct FixturePage {
    pages: HashMap<String, Fixture>,
    default: Option<Fixture>,
    counters: Arc<Mutex<Counters>>,
    document: Option<String>,
}

impl FixturePage {
    fn document(&self) -> Result<&str, NavigationError> {
        self.document
            .as_deref()
            .ok_or_else(|| NavigationError::Engine("no document loaded".to_string()))
    }
}

#[async_trait]
impl PageSurface for FixturePage {
    async fn block_resources(&mut self, types: &[ResourceType]) -> Result<(), NavigationError> {
        self.counters.lock().unwrap().blocked.extend_from_slice(types);
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        self.counters.lock().unwrap().visited.push(url.to_string());

        let fixture = self
            .pages
            .get(url)
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or_else(|| Fixture::Html(items_page(&[])));

        match fixture {
            Fixture::Html(html) => {
                self.document = Some(html);
                Ok(())
            }
            Fixture::Hang => std::future::pending().await,
            Fixture::Fail(reason) => Err(NavigationError::Failed {
                url: url.to_string(),
                reason,
            }),
        }
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> Result<(), NavigationError> {
        if html_matches(self.document()?, selector)? {
            Ok(())
        } else {
            std::future::pending().await
        }
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), NavigationError> {
        self.counters.lock().unwrap().scrolls += 1;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, NavigationError> {
        self.document().map(str::to_string)
    }

    async fn has_next(&mut self, selector: &str) -> Result<bool, NavigationError> {
        has_next_in_html(self.document()?, selector)
    }

    async fn close(&mut self) -> Result<(), NavigationError> {
        self.counters.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Sink that keeps every emitted message; optionally refuses one kind
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<ResultMessage>>,
    failing_kind: Option<&'static str>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_kind(kind: &'static str) -> Self {
        Self {
            failing_kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<ResultMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn emit(&self, message: ResultMessage) -> Result<(), MessagingError> {
        if self.failing_kind == Some(message.kind()) {
            return Err(MessagingError::Publish {
                topic: "results".to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}
