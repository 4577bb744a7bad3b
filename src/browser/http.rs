use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::browser::{has_next_in_html, html_matches, PageSurface, RenderingEngine};
use crate::cli::config::BrowserSettings;
use crate::error::NavigationError;
use crate::extraction::ResourceType;

/// Static-markup engine for sites that render server side. No scripts run,
/// so scrolling and resource blocking have nothing to act on.
pub struct HttpEngine {
    client: Client,
}

impl HttpEngine {
    pub fn new(settings: &BrowserSettings) -> Result<Self, NavigationError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .cookie_store(true)
            .timeout(Duration::from_millis(settings.page_load_timeout_ms))
            .build()
            .map_err(|e| NavigationError::Engine(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RenderingEngine for HttpEngine {
    async fn new_page(&self) -> Result<Box<dyn PageSurface>, NavigationError> {
        Ok(Box::new(HttpPage {
            client: self.client.clone(),
            document: None,
        }))
    }

    async fn shutdown(&self) -> Result<(), NavigationError> {
        Ok(())
    }
}

pub struct HttpPage {
    client: Client,
    document: Option<String>,
}

impl HttpPage {
    fn document(&self) -> Result<&str, NavigationError> {
        self.document
            .as_deref()
            .ok_or_else(|| NavigationError::Engine("no document loaded".to_string()))
    }
}

#[async_trait]
impl PageSurface for HttpPage {
    async fn block_resources(&mut self, _types: &[ResourceType]) -> Result<(), NavigationError> {
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        debug!("Fetching: {}", url);
        let failed = |e: reqwest::Error| NavigationError::Failed {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let body = self
            .client
            .get(url)
            .send()
            .await
            .map_err(failed)?
            .error_for_status()
            .map_err(failed)?
            .text()
            .await
            .map_err(failed)?;

        self.document = Some(body);
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), NavigationError> {
        // Static markup never changes, so a missing selector will not appear later
        if html_matches(self.document()?, selector)? {
            Ok(())
        } else {
            Err(NavigationError::SelectorTimeout {
                selector: selector.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), NavigationError> {
        Ok(())
    }

    async fn content(&mut self) -> Result<String, NavigationError> {
        self.document().map(str::to_string)
    }

    async fn has_next(&mut self, selector: &str) -> Result<bool, NavigationError> {
        has_next_in_html(self.document()?, selector)
    }

    async fn close(&mut self) -> Result<(), NavigationError> {
        self.document = None;
        Ok(())
    }
}
