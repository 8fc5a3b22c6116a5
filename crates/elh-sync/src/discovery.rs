use std::collections::{BTreeMap, HashSet};

use elh_adapters::{AdapterError, PageRenderer, PageSource, RenderError, SiteAdapter};
use elh_core::{
    append_unique, CollectionKey, Discovered, DiscoveredCollection, WorkItemRef, META_IMAGE_URL,
    META_MAIN_URL, META_TITLE,
};
use elh_storage::FetchError;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ListingConfig;

/// Upper bound on control activations for one rendered collection.
const MAX_INTERACTIONS: usize = 1000;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Walks `?page=N` listing pages from `start_page` until a page yields no titles, a page
/// fails, or the page limit is reached. Titles found before a failure are kept.
pub async fn crawl_listing(
    pages: &dyn PageSource,
    adapter: &dyn SiteAdapter,
    listing: &ListingConfig,
    default_max_pages: u32,
) -> Vec<WorkItemRef> {
    let max_pages = listing.max_pages.unwrap_or(default_max_pages);
    let mut titles = Vec::new();

    for page in listing.start_page..listing.start_page.saturating_add(max_pages) {
        let found = async {
            let url = adapter.listing_page_url(&listing.url, page)?;
            let html = pages.get(&url).await?;
            Ok::<_, DiscoveryError>(adapter.parse_listing(&html)?)
        }
        .instrument(info_span!("listing_page", listing = %listing.url, page))
        .await;

        match found {
            Ok(found) if found.is_empty() => {
                debug!(listing = %listing.url, page, "listing exhausted");
                break;
            }
            Ok(found) => {
                let added = append_unique(&mut titles, found);
                info!(listing = %listing.url, page, added, total = titles.len(), "listing page crawled");
            }
            Err(err) => {
                warn!(listing = %listing.url, page, error = %err, "listing page failed, stopping crawl");
                break;
            }
        }
    }
    titles
}

/// Fetches a collection page without rendering. Pages whose episode list is paginated
/// behind controls are deferred to the rendered path.
pub async fn discover_static(
    pages: &dyn PageSource,
    adapter: &dyn SiteAdapter,
    source: &str,
) -> Result<Discovered, DiscoveryError> {
    let html = pages.get(source).await?;
    let page = adapter.parse_title(source, &html)?;

    if page.needs_render {
        debug!(source, "pagination controls present, deferring");
        return Ok(Discovered::Deferred {
            source: source.to_string(),
        });
    }

    let key = page
        .title
        .as_deref()
        .map(CollectionKey::canonicalize)
        .unwrap_or_else(CollectionKey::unknown);

    let mut metadata = BTreeMap::from([(META_MAIN_URL.to_string(), source.to_string())]);
    if let Some(title) = page.title {
        metadata.insert(META_TITLE.to_string(), title);
    }
    if let Some(image_url) = page.image_url {
        metadata.insert(META_IMAGE_URL.to_string(), image_url);
    }

    Ok(Discovered::Collection(DiscoveredCollection {
        key,
        metadata,
        refs: page.episodes,
    }))
}

/// Renders a collection page and activates each distinct reveal control once, accumulating
/// the union of episode references in first-seen order.
///
/// Navigation failure is an error. A failed activation ends pagination but keeps whatever
/// was collected up to that point.
pub async fn discover_rendered(
    renderer: &dyn PageRenderer,
    adapter: &dyn SiteAdapter,
    source: &str,
) -> Result<DiscoveredCollection, DiscoveryError> {
    let mut snapshot = renderer.render(source).await?;
    let first = adapter.parse_rendered_title(&snapshot.url, &snapshot.html)?;

    let mut refs = Vec::new();
    append_unique(&mut refs, first.episodes);
    let mut metadata = BTreeMap::from([(META_MAIN_URL.to_string(), source.to_string())]);
    if let Some(title) = first.title {
        metadata.insert(META_TITLE.to_string(), title);
    }
    if let Some(image_url) = first.image_url {
        metadata.insert(META_IMAGE_URL.to_string(), image_url);
    }

    let mut activated: HashSet<String> = HashSet::new();
    while activated.len() < MAX_INTERACTIONS {
        let controls = match adapter.reveal_controls(&snapshot.html) {
            Ok(controls) => controls,
            Err(err) => {
                warn!(source, error = %err, "reading pagination controls failed");
                break;
            }
        };
        let Some(label) = controls.into_iter().find(|l| !activated.contains(l)) else {
            break;
        };
        activated.insert(label.clone());

        snapshot = match renderer.interact(&snapshot, &label).await {
            Ok(next) => next,
            Err(err) => {
                warn!(source, control = %label, error = %err, "pagination stopped early");
                break;
            }
        };

        match adapter.parse_rendered_title(&snapshot.url, &snapshot.html) {
            Ok(page) => {
                let added = append_unique(&mut refs, page.episodes);
                debug!(source, control = %label, added, total = refs.len(), "control activated");
            }
            Err(err) => {
                warn!(source, control = %label, error = %err, "parsing revealed page failed");
                break;
            }
        }
    }

    info!(
        source,
        key = %first.key,
        episodes = refs.len(),
        controls = activated.len(),
        "rendered discovery finished"
    );
    Ok(DiscoveredCollection {
        key: first.key,
        metadata,
        refs,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use elh_adapters::{adapter_for_site, PageSnapshot};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use url::Url;

    pub(crate) fn fixture(name: &str) -> String {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/anixl")
            .join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
    }

    pub(crate) fn anixl() -> Arc<dyn SiteAdapter> {
        adapter_for_site("anixl", Url::parse("https://anixl.to").unwrap()).expect("anixl")
    }

    #[derive(Default)]
    pub(crate) struct MapPages {
        pub(crate) pages: HashMap<String, String>,
        pub(crate) requested: Mutex<Vec<String>>,
    }

    impl MapPages {
        pub(crate) fn with(mut self, url: &str, html: impl Into<String>) -> Self {
            self.pages.insert(url.to_string(), html.into());
            self
        }
    }

    #[async_trait]
    impl PageSource for MapPages {
        async fn get(&self, url: &str) -> Result<String, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().ok_or(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    fn rendered_page(labels: &[&str], episodes: &[u32]) -> String {
        let buttons: String = labels
            .iter()
            .map(|l| format!(r#"<button class="btn btn-outline">{l}</button>"#))
            .collect();
        let links: String = episodes
            .iter()
            .map(|e| format!(r#"<a class="btn" href="/title/202-paged-saga/{e}-episode">{e}</a>"#))
            .collect();
        format!(
            r#"<html><body><img alt="c" title="Paged Saga" src="/media/202.jpg">{buttons}{links}</body></html>"#
        )
    }

    /// Scripted renderer: each label maps to the page revealed by clicking it.
    struct ScriptedRenderer {
        initial: String,
        reveals: HashMap<String, String>,
        failing: Option<String>,
        clicks: Mutex<Vec<String>>,
    }

    impl ScriptedRenderer {
        fn new(initial: String) -> Self {
            Self {
                initial,
                reveals: HashMap::new(),
                failing: None,
                clicks: Mutex::new(Vec::new()),
            }
        }

        fn reveal(mut self, label: &str, html: String) -> Self {
            self.reveals.insert(label.to_string(), html);
            self
        }
    }

    const SAGA_URL: &str = "https://anixl.to/title/202-paged-saga";

    #[async_trait]
    impl PageRenderer for ScriptedRenderer {
        async fn render(&self, url: &str) -> Result<PageSnapshot, RenderError> {
            Ok(PageSnapshot {
                url: url.to_string(),
                html: self.initial.clone(),
            })
        }

        async fn interact(
            &self,
            snapshot: &PageSnapshot,
            control_label: &str,
        ) -> Result<PageSnapshot, RenderError> {
            self.clicks.lock().unwrap().push(control_label.to_string());
            if self.failing.as_deref() == Some(control_label) {
                return Err(RenderError::Interaction {
                    label: control_label.to_string(),
                    message: "detached".to_string(),
                });
            }
            let html = self.reveals.get(control_label).cloned().ok_or_else(|| {
                RenderError::ControlNotFound {
                    url: snapshot.url.clone(),
                    label: control_label.to_string(),
                }
            })?;
            Ok(PageSnapshot {
                url: snapshot.url.clone(),
                html,
            })
        }
    }

    fn urls(refs: &[WorkItemRef]) -> Vec<String> {
        refs.iter()
            .map(|r| r.as_str().rsplit('/').next().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn listing_crawl_stops_at_the_first_empty_page() {
        let pages = MapPages::default()
            .with("https://anixl.to/search?page=1", fixture("listing_page.html"))
            .with("https://anixl.to/search?page=2", fixture("listing_page.html"))
            .with("https://anixl.to/search?page=3", "<html><body></body></html>");
        let listing = ListingConfig {
            url: "https://anixl.to/search".to_string(),
            start_page: 1,
            max_pages: None,
        };

        let titles = crawl_listing(&pages, anixl().as_ref(), &listing, 50).await;
        assert_eq!(
            titles.iter().map(WorkItemRef::as_str).collect::<Vec<_>>(),
            vec![
                "https://anixl.to/title/101-demo-show",
                "https://anixl.to/title/202-paged-saga"
            ]
        );
        assert_eq!(pages.requested.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn listing_crawl_honours_the_page_limit_and_keeps_partial_results() {
        let pages = MapPages::default()
            .with("https://anixl.to/search?page=4", fixture("listing_page.html"));
        let listing = ListingConfig {
            url: "https://anixl.to/search".to_string(),
            start_page: 4,
            max_pages: Some(3),
        };

        let titles = crawl_listing(&pages, anixl().as_ref(), &listing, 50).await;
        assert_eq!(titles.len(), 2);
        // page 5 is missing: the crawl stops there instead of probing page 6
        assert_eq!(pages.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn static_discovery_builds_a_collection() {
        let source = "https://anixl.to/title/101-demo-show";
        let pages = MapPages::default().with(source, fixture("title_static.html"));

        let Discovered::Collection(found) =
            discover_static(&pages, anixl().as_ref(), source).await.unwrap()
        else {
            panic!("expected a collection");
        };
        assert_eq!(found.key.as_str(), "demo_show");
        assert_eq!(found.metadata[META_MAIN_URL], source);
        assert_eq!(found.metadata[META_TITLE], "Demo Show");
        assert_eq!(found.metadata[META_IMAGE_URL], "https://anixl.to/media/covers/101.jpg");
        assert_eq!(urls(&found.refs), vec!["5001-episode-1", "5002-episode-2", "5003-episode-3"]);
    }

    #[tokio::test]
    async fn static_discovery_defers_paginated_pages() {
        let pages = MapPages::default().with(SAGA_URL, fixture("title_paginated.html"));
        let found = discover_static(&pages, anixl().as_ref(), SAGA_URL).await.unwrap();
        assert_eq!(
            found,
            Discovered::Deferred {
                source: SAGA_URL.to_string()
            }
        );
    }

    #[tokio::test]
    async fn static_discovery_surfaces_fetch_errors() {
        let result = discover_static(&MapPages::default(), anixl().as_ref(), SAGA_URL).await;
        assert!(matches!(result, Err(DiscoveryError::Fetch(_))));
    }

    #[tokio::test]
    async fn each_control_is_activated_once_and_results_are_unioned() {
        let labels = ["1-10", "11-20"];
        let renderer = ScriptedRenderer::new(rendered_page(&labels, &[1, 2]))
            .reveal("1-10", rendered_page(&labels, &[1, 2, 3]))
            .reveal("11-20", rendered_page(&labels, &[11, 12]));

        let found = discover_rendered(&renderer, anixl().as_ref(), SAGA_URL)
            .await
            .unwrap();

        assert_eq!(*renderer.clicks.lock().unwrap(), vec!["1-10", "11-20"]);
        assert_eq!(found.key.as_str(), "paged_saga");
        assert_eq!(
            urls(&found.refs),
            vec!["1-episode", "2-episode", "3-episode", "11-episode", "12-episode"]
        );
        assert_eq!(found.metadata[META_IMAGE_URL], "https://anixl.to/media/202.jpg");
    }

    #[tokio::test]
    async fn a_control_that_never_changes_is_not_reactivated() {
        let page = rendered_page(&["1-10"], &[1]);
        let renderer = ScriptedRenderer::new(page.clone()).reveal("1-10", page);

        let found = discover_rendered(&renderer, anixl().as_ref(), SAGA_URL)
            .await
            .unwrap();
        assert_eq!(renderer.clicks.lock().unwrap().len(), 1);
        assert_eq!(found.refs.len(), 1);
    }

    #[tokio::test]
    async fn a_failed_activation_keeps_the_partial_list() {
        let labels = ["1-10", "11-20"];
        let mut renderer = ScriptedRenderer::new(rendered_page(&labels, &[1]))
            .reveal("1-10", rendered_page(&labels, &[1, 2]));
        renderer.failing = Some("11-20".to_string());

        let found = discover_rendered(&renderer, anixl().as_ref(), SAGA_URL)
            .await
            .unwrap();
        assert_eq!(urls(&found.refs), vec!["1-episode", "2-episode"]);
    }

    #[tokio::test]
    async fn labels_without_a_range_are_not_pagination() {
        let renderer = ScriptedRenderer::new(rendered_page(&["Sort"], &[1, 2]));
        let found = discover_rendered(&renderer, anixl().as_ref(), SAGA_URL)
            .await
            .unwrap();
        assert!(renderer.clicks.lock().unwrap().is_empty());
        assert_eq!(found.refs.len(), 2);
    }
}
