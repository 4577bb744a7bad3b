pub mod http;
pub mod webdriver;

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::time::Duration;

use crate::error::NavigationError;
use crate::extraction::ResourceType;

// Re-export common types
pub use http::HttpEngine;
pub use webdriver::WebDriverEngine;

/// Process-wide rendering engine, owned by the worker
#[async_trait]
pub trait RenderingEngine: Send + Sync {
    /// Open a fresh rendering surface
    async fn new_page(&self) -> Result<Box<dyn PageSurface>, NavigationError>;

    /// Release the engine; no pages may be opened afterwards
    async fn shutdown(&self) -> Result<(), NavigationError>;
}

/// A live, navigable page. Owned by a single label run and closed when it ends.
#[async_trait]
pub trait PageSurface: Send {
    /// Refuse requests of the given types for the rest of the page's life
    async fn block_resources(&mut self, types: &[ResourceType]) -> Result<(), NavigationError>;

    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError>;

    /// Resolve once `selector` matches; callers bound the wait with `timeout`
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), NavigationError>;

    /// Scroll to the bottom in small steps so lazy content loads
    async fn scroll_to_bottom(&mut self) -> Result<(), NavigationError>;

    /// Rendered markup of the current document
    async fn content(&mut self) -> Result<String, NavigationError>;

    /// Whether the next-page indicator exists and is enabled
    async fn has_next(&mut self, selector: &str) -> Result<bool, NavigationError>;

    async fn close(&mut self) -> Result<(), NavigationError>;
}

/// Next-page check against static markup: the element exists, has no
/// `disabled` attribute and no `disabled` class.
pub fn has_next_in_html(html: &str, selector: &str) -> Result<bool, NavigationError> {
    let selector = Selector::parse(selector)
        .map_err(|e| NavigationError::Engine(format!("invalid selector {}: {}", selector, e)))?;
    let document = Html::parse_document(html);

    Ok(document
        .select(&selector)
        .next()
        .map_or(false, |element| {
            let value = element.value();
            value.attr("disabled").is_none() && !value.classes().any(|class| class == "disabled")
        }))
}

/// Whether `selector` matches anything in static markup
pub fn html_matches(html: &str, selector: &str) -> Result<bool, NavigationError> {
    let selector = Selector::parse(selector)
        .map_err(|e| NavigationError::Engine(format!("invalid selector {}: {}", selector, e)))?;
    Ok(Html::parse_document(html).select(&selector).next().is_some())
}
