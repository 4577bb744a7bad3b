use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thirtyfour::error::WebDriverError;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::browser::{PageSurface, RenderingEngine};
use crate::cli::config::BrowserSettings;
use crate::error::NavigationError;
use crate::extraction::ResourceType;

/// Distance of a single scroll step in pixels
const SCROLL_STEP: u64 = 100;

/// Pause between scroll steps
const SCROLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on scroll steps for pages that keep growing
const MAX_SCROLL_STEPS: u32 = 2_000;

const HAS_NEXT_SCRIPT: &str = r#"
    const element = document.querySelector(arguments[0]);
    return !!element && !element.disabled && !element.classList.contains("disabled");
"#;

const SCROLL_SCRIPT: &str = r#"
    window.scrollBy(0, arguments[0]);
    return document.body.scrollHeight;
"#;

fn engine_error(e: WebDriverError) -> NavigationError {
    NavigationError::Engine(e.to_string())
}

/// Chrome over WebDriver: one session per process, one tab per page
pub struct WebDriverEngine {
    driver: WebDriver,

    /// Tab that stays open so the session survives page closes
    home: WindowHandle,
}

impl WebDriverEngine {
    /// Start a browser session with the configured capabilities
    pub async fn connect(settings: &BrowserSettings) -> Result<Self, NavigationError> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", settings.user_agent))
            .map_err(engine_error)?;
        caps.add_chrome_arg(&format!("--window-size={},{}", settings.window_width, settings.window_height))
            .map_err(engine_error)?;

        if settings.headless {
            caps.set_headless().map_err(engine_error)?;
        }

        for arg in [
            "--no-sandbox",
            "--disable-setuid-sandbox",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            "--disable-blink-features=AutomationControlled",
        ] {
            caps.add_chrome_arg(arg).map_err(engine_error)?;
        }

        let driver = WebDriver::new(&settings.webdriver_url, caps)
            .await
            .map_err(|e| NavigationError::Engine(format!(
                "failed to connect to WebDriver at {}: {}",
                settings.webdriver_url, e
            )))?;

        driver
            .set_page_load_timeout(Duration::from_millis(settings.page_load_timeout_ms))
            .await
            .map_err(engine_error)?;

        let home = driver.window().await.map_err(engine_error)?;

        info!("Browser initialized via {}", settings.webdriver_url);

        Ok(Self { driver, home })
    }
}

#[async_trait]
impl RenderingEngine for WebDriverEngine {
    async fn new_page(&self) -> Result<Box<dyn PageSurface>, NavigationError> {
        let handle = self.driver.new_tab().await.map_err(engine_error)?;
        self.driver
            .switch_to_window(handle.clone())
            .await
            .map_err(engine_error)?;

        debug!("Opened browser tab");

        Ok(Box::new(WebDriverPage {
            driver: self.driver.clone(),
            home: self.home.clone(),
            handle: Some(handle),
        }))
    }

    async fn shutdown(&self) -> Result<(), NavigationError> {
        self.driver.clone().quit().await.map_err(engine_error)?;
        info!("Browser closed");
        Ok(())
    }
}

/// A browser tab
pub struct WebDriverPage {
    driver: WebDriver,
    home: WindowHandle,
    handle: Option<WindowHandle>,
}

impl WebDriverPage {
    fn driver(&self) -> Result<&WebDriver, NavigationError> {
        if self.handle.is_some() {
            Ok(&self.driver)
        } else {
            Err(NavigationError::Engine("page already closed".to_string()))
        }
    }
}

#[async_trait]
impl PageSurface for WebDriverPage {
    async fn block_resources(&mut self, types: &[ResourceType]) -> Result<(), NavigationError> {
        let patterns: Vec<&str> = types
            .iter()
            .flat_map(|kind| kind.url_patterns().iter().copied())
            .collect();
        let stubs: Vec<&str> = types.iter().filter_map(|kind| kind.stub_script()).collect();

        let dev_tools = ChromeDevTools::new(self.driver()?.handle.clone());
        if !patterns.is_empty() {
            dev_tools
                .execute_cdp("Network.enable")
                .await
                .map_err(engine_error)?;
            dev_tools
                .execute_cdp_with_params("Network.setBlockedURLs", json!({ "urls": patterns }))
                .await
                .map_err(engine_error)?;
            debug!("Blocking {} resource patterns", patterns.len());
        }

        // Request APIs are replaced before the first document script runs
        for source in &stubs {
            dev_tools
                .execute_cdp_with_params("Page.addScriptToEvaluateOnNewDocument", json!({ "source": source }))
                .await
                .map_err(engine_error)?;
        }
        if !stubs.is_empty() {
            debug!("Stubbed {} request APIs", stubs.len());
        }

        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        debug!("Navigating to: {}", url);
        self.driver()?
            .goto(url)
            .await
            .map_err(|e| NavigationError::Failed {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), NavigationError> {
        self.driver()?
            .query(By::Css(selector))
            .wait(timeout, Duration::from_millis(250))
            .first()
            .await
            .map(|_| ())
            .map_err(|_| NavigationError::SelectorTimeout {
                selector: selector.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), NavigationError> {
        let driver = self.driver()?;
        let mut scrolled = 0u64;

        for _ in 0..MAX_SCROLL_STEPS {
            let ret = driver
                .execute(SCROLL_SCRIPT, vec![json!(SCROLL_STEP)])
                .await
                .map_err(engine_error)?;
            scrolled += SCROLL_STEP;

            let height = ret.json().as_u64().unwrap_or(0);
            if scrolled >= height {
                break;
            }
            sleep(SCROLL_INTERVAL).await;
        }

        debug!("Scrolled {} pixels", scrolled);
        Ok(())
    }

    async fn content(&mut self) -> Result<String, NavigationError> {
        self.driver()?.source().await.map_err(engine_error)
    }

    async fn has_next(&mut self, selector: &str) -> Result<bool, NavigationError> {
        let ret = self
            .driver()?
            .execute(HAS_NEXT_SCRIPT, vec![json!(selector)])
            .await
            .map_err(engine_error)?;
        Ok(ret.json().as_bool().unwrap_or(false))
    }

    async fn close(&mut self) -> Result<(), NavigationError> {
        if self.handle.take().is_some() {
            self.driver.close_window().await.map_err(engine_error)?;
            self.driver
                .switch_to_window(self.home.clone())
                .await
                .map_err(engine_error)?;
            debug!("Closed browser tab");
        }
        Ok(())
    }
}

impl Drop for WebDriverPage {
    fn drop(&mut self) {
        if self.handle.is_some() {
            error!("Browser tab dropped without being closed");
        }
    }
}
