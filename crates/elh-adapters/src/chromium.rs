//! Headless Chromium implementation of [`PageRenderer`].

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{PageRenderer, PageSnapshot, RenderError};

const REVEAL_CONTROL: &str = r#"button[class*="btn-outline"]"#;

#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    pub navigation_timeout: Duration,
    /// Pause after navigation and after each click before the DOM is read.
    pub settle: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            settle: Duration::from_millis(2500),
        }
    }
}

/// Drives one headless browser tab. Calls are serialized: one page is live at a time and
/// `interact` acts on the page produced by the latest `render`.
pub struct ChromiumRenderer {
    browser: Mutex<Browser>,
    page: Mutex<Option<Page>>,
    handler: JoinHandle<()>,
    config: ChromiumConfig,
}

impl ChromiumRenderer {
    pub async fn launch(config: ChromiumConfig) -> Result<Self, RenderError> {
        let browser_config = BrowserConfig::builder()
            .build()
            .map_err(RenderError::Unavailable)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::Unavailable(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler stopped");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(browser),
            page: Mutex::new(None),
            handler,
            config,
        })
    }

    pub async fn close(self) {
        if let Some(page) = self.page.lock().await.take() {
            let _ = page.close().await;
        }
        if let Err(err) = self.browser.lock().await.close().await {
            warn!(error = %err, "closing browser failed");
        }
        self.handler.abort();
    }

    async fn snapshot(&self, page: &Page, fallback_url: &str) -> Result<PageSnapshot, RenderError> {
        tokio::time::sleep(self.config.settle).await;
        let navigation = |e: chromiumoxide::error::CdpError| RenderError::Navigation {
            url: fallback_url.to_string(),
            message: e.to_string(),
        };
        let html = page.content().await.map_err(navigation)?;
        let url = page
            .url()
            .await
            .map_err(navigation)?
            .unwrap_or_else(|| fallback_url.to_string());
        Ok(PageSnapshot { url, html })
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render(&self, url: &str) -> Result<PageSnapshot, RenderError> {
        let navigation = |message: String| RenderError::Navigation {
            url: url.to_string(),
            message,
        };

        let mut current = self.page.lock().await;
        if let Some(previous) = current.take() {
            let _ = previous.close().await;
        }

        let page = tokio::time::timeout(self.config.navigation_timeout, async {
            let page = self.browser.lock().await.new_page(url).await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(page)
        })
        .await
        .map_err(|_| navigation("timed out".to_string()))?
        .map_err(|e| navigation(e.to_string()))?;

        let snapshot = self.snapshot(&page, url).await?;
        *current = Some(page);
        Ok(snapshot)
    }

    async fn interact(
        &self,
        snapshot: &PageSnapshot,
        control_label: &str,
    ) -> Result<PageSnapshot, RenderError> {
        let interaction = |e: chromiumoxide::error::CdpError| RenderError::Interaction {
            label: control_label.to_string(),
            message: e.to_string(),
        };

        let current = self.page.lock().await;
        let page = current
            .as_ref()
            .ok_or_else(|| RenderError::Unavailable("no page rendered".to_string()))?;

        let mut target = None;
        for element in page.find_elements(REVEAL_CONTROL).await.map_err(interaction)? {
            let label = element.inner_text().await.map_err(interaction)?;
            if label.as_deref().map(str::trim) == Some(control_label) {
                target = Some(element);
                break;
            }
        }
        let Some(element) = target else {
            return Err(RenderError::ControlNotFound {
                url: snapshot.url.clone(),
                label: control_label.to_string(),
            });
        };

        element.click().await.map_err(interaction)?;
        self.snapshot(page, &snapshot.url).await
    }
}
