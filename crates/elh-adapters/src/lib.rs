//! Site adapter contracts + the collaborators the harvest engine talks to: page sources,
//! episode fetchers and page renderers.

use std::sync::Arc;

use async_trait::async_trait;
use elh_core::{CollectionKey, Record, WorkItemRef};
use elh_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

mod anixl;
#[cfg(feature = "browser")]
mod chromium;

pub use anixl::AnixlAdapter;
#[cfg(feature = "browser")]
pub use chromium::{ChromiumConfig, ChromiumRenderer};

pub const CRATE_NAME: &str = "elh-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Fields extracted from a title page fetched without rendering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TitlePage {
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub episodes: Vec<WorkItemRef>,
    /// The page carries pagination controls, so the static episode list is incomplete.
    pub needs_render: bool,
}

/// Fields extracted from a rendered title page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTitle {
    pub key: CollectionKey,
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub episodes: Vec<WorkItemRef>,
}

/// Pure extraction for one site. Nothing here performs I/O.
pub trait SiteAdapter: Send + Sync {
    fn site_id(&self) -> &'static str;
    fn base_url(&self) -> &Url;
    fn listing_page_url(&self, listing_url: &str, page: u32) -> Result<String, AdapterError>;
    fn parse_listing(&self, html: &str) -> Result<Vec<WorkItemRef>, AdapterError>;
    fn parse_title(&self, page_url: &str, html: &str) -> Result<TitlePage, AdapterError>;
    fn parse_rendered_title(
        &self,
        current_url: &str,
        html: &str,
    ) -> Result<RenderedTitle, AdapterError>;
    /// Labels of the "reveal more" controls currently on the page, in page order.
    fn reveal_controls(&self, html: &str) -> Result<Vec<String>, AdapterError>;
    fn parse_episode(&self, html: &str) -> Result<Record, AdapterError>;
}

pub fn adapter_for_site(site_id: &str, base_url: Url) -> Option<Arc<dyn SiteAdapter>> {
    match site_id {
        "anixl" => Some(Arc::new(AnixlAdapter::new(base_url))),
        _ => None,
    }
}

/// Plain page retrieval, used by listing crawls and static discovery.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_text(url).await?.body)
    }
}

/// Fetches one work item. Implementations never fail: any transport or parse problem
/// yields an empty record and a log line.
#[async_trait]
pub trait EpisodeFetcher: Send + Sync {
    async fn fetch(&self, reference: &WorkItemRef) -> Record;
}

pub struct PageEpisodeFetcher {
    pages: Arc<dyn PageSource>,
    adapter: Arc<dyn SiteAdapter>,
}

impl PageEpisodeFetcher {
    pub fn new(pages: Arc<dyn PageSource>, adapter: Arc<dyn SiteAdapter>) -> Self {
        Self { pages, adapter }
    }
}

#[async_trait]
impl EpisodeFetcher for PageEpisodeFetcher {
    async fn fetch(&self, reference: &WorkItemRef) -> Record {
        let html = match self.pages.get(reference.as_str()).await {
            Ok(html) => html,
            Err(err) => {
                warn!(url = %reference, error = %err, "episode fetch failed");
                return Record::empty();
            }
        };
        match self.adapter.parse_episode(&html) {
            Ok(record) => {
                info!(
                    url = %reference,
                    video = %record.video,
                    dub = %record.dub,
                    subtitle = %record.subtitle,
                    "episode fetched"
                );
                record
            }
            Err(err) => {
                warn!(url = %reference, error = %err, "episode parse failed");
                Record::empty()
            }
        }
    }
}

/// A rendered page: where the browser ended up and the DOM serialized as HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rendering {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("no control labelled {label:?} on {url}")]
    ControlNotFound { url: String, label: String },
    #[error("activating {label:?} failed: {message}")]
    Interaction { label: String, message: String },
    #[error("renderer unavailable: {0}")]
    Unavailable(String),
}

/// Dynamic page rendering. Both calls return only once the page has settled.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<PageSnapshot, RenderError>;
    async fn interact(
        &self,
        snapshot: &PageSnapshot,
        control_label: &str,
    ) -> Result<PageSnapshot, RenderError>;
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

fn select_all_attrs(document: &Html, css: &str, attr: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}
