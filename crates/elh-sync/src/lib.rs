//! Harvest orchestration: discovery, bounded enrichment, reconciliation and graceful stop.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use elh_adapters::{
    adapter_for_site, EpisodeFetcher, PageEpisodeFetcher, PageRenderer, PageSource, SiteAdapter,
};
use elh_core::{
    append_unique, CheckpointFile, CollectionKey, Discovered, DiscoveredCollection, UpsertOutcome,
    WorkItemRef, META_TITLE,
};
use elh_storage::{CheckpointError, CheckpointStore, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
mod discovery;
mod reconcile;
mod scheduler;
mod shutdown;

pub use config::{load_source_registry, HarvestConfig, ListingConfig, SourceRegistry};
pub use discovery::{crawl_listing, discover_rendered, discover_static, DiscoveryError};
pub use reconcile::{Applied, Reconciler};
pub use scheduler::{BatchStats, Scheduler, SchedulerConfig, DEFAULT_CONCURRENCY};
pub use shutdown::{install_interrupt_handler, ShutdownSignal};

pub const CRATE_NAME: &str = "elh-sync";

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoverOptions {
    /// Re-fetch sources already recorded in the checkpoint and merge what they yield.
    pub rediscover: bool,
    /// Run the rendered path for deferred sources, if a renderer is configured.
    pub render: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoverySummary {
    pub sources: usize,
    pub skipped: usize,
    pub collections: usize,
    pub deferred: usize,
    pub rendered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichSummary {
    pub collections: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub empty: usize,
    pub timed_out: usize,
}

impl EnrichSummary {
    fn absorb(&mut self, stats: BatchStats) {
        self.dispatched += stats.dispatched;
        self.completed += stats.completed;
        self.empty += stats.empty;
        self.timed_out += stats.timed_out;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovery: DiscoverySummary,
    pub enrichment: EnrichSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStatus {
    pub key: CollectionKey,
    pub title: Option<String>,
    pub complete: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub collections: Vec<CollectionStatus>,
    pub deferred: usize,
}

impl StatusReport {
    pub fn from_checkpoint(file: &CheckpointFile) -> Self {
        Self {
            collections: file
                .collections
                .iter()
                .map(|(key, state)| CollectionStatus {
                    key: key.clone(),
                    title: state.metadata.get(META_TITLE).cloned(),
                    complete: state.complete_count(),
                    total: state.refs.len(),
                })
                .collect(),
            deferred: file.deferred.len(),
        }
    }

    pub fn complete(&self) -> usize {
        self.collections.iter().map(|c| c.complete).sum()
    }

    pub fn total(&self) -> usize {
        self.collections.iter().map(|c| c.total).sum()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Completed(T),
    /// A stop was requested; progress reconciled so far has been saved.
    Interrupted,
}

/// Owns everything a harvest shares: configuration, the checkpoint store and the
/// collaborators that touch the network. Built once per process and passed to each step.
pub struct Harvester {
    config: HarvestConfig,
    store: Arc<CheckpointStore>,
    adapter: Arc<dyn SiteAdapter>,
    pages: Arc<dyn PageSource>,
    fetcher: Arc<dyn EpisodeFetcher>,
    renderer: Option<Arc<dyn PageRenderer>>,
    discovered: Mutex<HashMap<CollectionKey, BTreeMap<String, String>>>,
}

impl Harvester {
    pub fn new(
        config: HarvestConfig,
        store: Arc<CheckpointStore>,
        adapter: Arc<dyn SiteAdapter>,
        pages: Arc<dyn PageSource>,
        fetcher: Arc<dyn EpisodeFetcher>,
    ) -> Self {
        Self {
            config,
            store,
            adapter,
            pages,
            fetcher,
            renderer: None,
            discovered: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Wires the HTTP transport, the configured site adapter and the checkpoint at
    /// `config.checkpoint_path`.
    pub async fn from_config(config: HarvestConfig) -> Result<Self> {
        let base_url = url::Url::parse(&config.base_url)
            .with_context(|| format!("invalid base url {}", config.base_url))?;
        let adapter = adapter_for_site(&config.site, base_url)
            .with_context(|| format!("no adapter registered for site {}", config.site))?;
        let http: Arc<dyn PageSource> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            max_in_flight: config.concurrency,
        })?);
        let fetcher = Arc::new(PageEpisodeFetcher::new(Arc::clone(&http), Arc::clone(&adapter)));
        let store = Arc::new(CheckpointStore::open(config.checkpoint_path.clone()).await);

        Ok(Self::new(config, store, adapter, http, fetcher))
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Crawls listings, discovers every new source and records it in the checkpoint,
    /// persisting after each source.
    pub async fn discover(
        &self,
        registry: &SourceRegistry,
        options: DiscoverOptions,
    ) -> Result<DiscoverySummary> {
        let mut summary = DiscoverySummary::default();

        let mut sources: Vec<WorkItemRef> = Vec::new();
        for listing in &registry.listings {
            let found = crawl_listing(
                self.pages.as_ref(),
                self.adapter.as_ref(),
                listing,
                self.config.max_listing_pages,
            )
            .await;
            append_unique(&mut sources, found);
        }
        append_unique(
            &mut sources,
            registry.titles.iter().filter_map(|title| {
                let resolved = WorkItemRef::resolve(self.adapter.base_url(), title);
                if resolved.is_none() {
                    warn!(source = %title, "unusable title url, skipping");
                }
                resolved
            }),
        );
        summary.sources = sources.len();

        let fresh: Vec<String> = if options.rediscover {
            sources.into_iter().map(|s| s.as_str().to_string()).collect()
        } else {
            let known = self
                .store
                .read(|file| {
                    sources
                        .iter()
                        .map(|s| file.is_known(s.as_str()))
                        .collect::<Vec<_>>()
                })
                .await;
            sources
                .into_iter()
                .zip(known)
                .filter_map(|(source, known)| (!known).then(|| source.as_str().to_string()))
                .collect()
        };
        summary.skipped = summary.sources - fresh.len();
        info!(
            sources = summary.sources,
            skipped = summary.skipped,
            "discovering collections"
        );

        self.discover_static_sources(fresh, &mut summary).await?;

        if options.render {
            self.discover_deferred(&mut summary).await?;
        }

        let deferred = self.store.read(|file| file.deferred.len()).await;
        if deferred > 0 && (!options.render || self.renderer.is_none()) {
            info!(deferred, "sources waiting for rendered discovery");
        }
        Ok(summary)
    }

    /// Static discovery with at most `concurrency` title pages in flight. Results are
    /// recorded in source order so key collisions resolve the same way on every run.
    async fn discover_static_sources(
        &self,
        sources: Vec<String>,
        summary: &mut DiscoverySummary,
    ) -> Result<()> {
        let cap = self.config.concurrency.max(1);
        let mut queue = sources.into_iter().enumerate();
        let mut in_flight = JoinSet::new();
        let mut ready = BTreeMap::new();
        let mut next = 0usize;

        loop {
            while in_flight.len() < cap {
                let Some((index, source)) = queue.next() else {
                    break;
                };
                let pages = Arc::clone(&self.pages);
                let adapter = Arc::clone(&self.adapter);
                let span = info_span!("discover_title", source = %source);
                in_flight.spawn(
                    async move {
                        let result = discover_static(pages.as_ref(), adapter.as_ref(), &source).await;
                        (index, source, result)
                    }
                    .instrument(span),
                );
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((index, source, result)) => {
                    ready.insert(index, (source, result));
                }
                Err(err) => {
                    error!(error = %err, "discovery task crashed");
                    summary.failed += 1;
                    continue;
                }
            }

            while let Some((source, result)) = ready.remove(&next) {
                self.record_static(&source, result, summary).await?;
                next += 1;
            }
        }

        // only reached with gaps left by crashed tasks
        for (_, (source, result)) in ready {
            self.record_static(&source, result, summary).await?;
        }
        Ok(())
    }

    async fn record_static(
        &self,
        source: &str,
        result: Result<Discovered, DiscoveryError>,
        summary: &mut DiscoverySummary,
    ) -> Result<(), CheckpointError> {
        match result {
            Ok(Discovered::Collection(collection)) => {
                self.record_collection(source, collection).await?;
                summary.collections += 1;
            }
            Ok(Discovered::Deferred { source }) => {
                if self.store.update(|file| file.defer(&source)).await {
                    self.store.persist().await?;
                }
                info!(source = %source, "deferred to rendered discovery");
                summary.deferred += 1;
            }
            Err(err) => {
                warn!(source, error = %err, "discovery failed");
                summary.failed += 1;
            }
        }
        Ok(())
    }

    async fn record_collection(
        &self,
        source: &str,
        collection: DiscoveredCollection,
    ) -> Result<(), CheckpointError> {
        let key = collection.key.clone();
        let refs = collection.refs.len();
        self.discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), collection.metadata.clone());

        let outcome = self
            .store
            .update(|file| {
                file.undefer(source);
                file.upsert_discovered(collection)
            })
            .await;
        match outcome {
            UpsertOutcome::Replaced => {
                warn!(collection = %key, source, "key already used by another source, replaced")
            }
            UpsertOutcome::Merged { appended } => {
                info!(collection = %key, source, refs, appended, "collection rediscovered")
            }
            UpsertOutcome::Inserted => info!(collection = %key, source, refs, "collection discovered"),
        }
        self.store.persist().await?;
        Ok(())
    }

    async fn discover_deferred(&self, summary: &mut DiscoverySummary) -> Result<()> {
        let deferred = self.store.read(|file| file.deferred.clone()).await;
        if deferred.is_empty() {
            return Ok(());
        }
        let Some(renderer) = &self.renderer else {
            warn!(deferred = deferred.len(), "no renderer available, deferred sources left as is");
            return Ok(());
        };

        for source in deferred {
            let span = info_span!("render_title", source = %source);
            match discover_rendered(renderer.as_ref(), self.adapter.as_ref(), &source)
                .instrument(span)
                .await
            {
                Ok(collection) => {
                    self.record_collection(&source, collection).await?;
                    summary.rendered += 1;
                }
                Err(err) => {
                    warn!(source = %source, error = %err, "rendered discovery failed, still deferred");
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Fetches every pending item of every collection in the checkpoint.
    pub async fn enrich(&self) -> Result<EnrichSummary> {
        let keys = self
            .store
            .read(|file| file.collections.keys().cloned().collect::<Vec<_>>())
            .await;

        let mut summary = EnrichSummary::default();
        for key in keys {
            let stats = self
                .enrich_collection(&key)
                .await
                .with_context(|| format!("saving progress of {key}"))?;
            summary.collections += 1;
            summary.absorb(stats);
        }
        Ok(summary)
    }

    /// Runs one collection's pending items through the scheduler. Returns once every
    /// dispatched item has been reconciled and persisted.
    pub async fn enrich_collection(&self, key: &CollectionKey) -> Result<BatchStats, CheckpointError> {
        let prepared = self
            .store
            .update(|file| {
                let state = file.collections.get_mut(key)?;
                let dropped = state.align_items();
                let jobs: Vec<(usize, WorkItemRef)> = state
                    .pending_indices()
                    .into_iter()
                    .map(|i| (i, state.refs[i].clone()))
                    .collect();
                Some((dropped, jobs, state.refs.len()))
            })
            .await;
        let Some((dropped, jobs, total)) = prepared else {
            warn!(collection = %key, "collection not in checkpoint");
            return Ok(BatchStats::default());
        };
        if dropped > 0 {
            warn!(collection = %key, dropped, "records beyond the reference list were discarded");
        }
        self.store.persist().await?;

        if jobs.is_empty() {
            info!(collection = %key, total, "collection already complete");
            return Ok(BatchStats::default());
        }

        let metadata = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default();
        let mut reconciler = Reconciler::new(Arc::clone(&self.store), key.clone(), metadata);
        let scheduler = Scheduler::new(SchedulerConfig {
            concurrency: self.config.concurrency,
            item_timeout: self.config.item_timeout(),
        });

        let span = info_span!("enrich_collection", collection = %key, pending = jobs.len(), total);
        async {
            info!("collection started");
            let stats = scheduler
                .run(jobs, Arc::clone(&self.fetcher), &mut reconciler)
                .await?;
            info!(completed = stats.completed, empty = stats.empty, "collection finished");
            Ok::<_, CheckpointError>(stats)
        }
        .instrument(span)
        .await
    }

    /// Discovery followed by enrichment.
    pub async fn run(&self, registry: &SourceRegistry, options: DiscoverOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "harvest run started");

        let discovery = self.discover(registry, options).await?;
        let enrichment = self.enrich().await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            discovery,
            enrichment,
        })
    }

    /// Drives `step` until it finishes or `shutdown` fires. On a stop request the step is
    /// dropped, which cancels its in-flight fetches, and the checkpoint is persisted within
    /// the configured grace period.
    pub async fn run_until_shutdown<T, F>(
        &self,
        step: F,
        shutdown: &mut ShutdownSignal,
    ) -> Result<RunOutcome<T>>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            result = step => return result.map(RunOutcome::Completed),
            _ = shutdown.recv() => {}
        }

        warn!("stop requested, saving progress");
        match tokio::time::timeout(self.config.grace(), self.store.persist()).await {
            Ok(Ok(outcome)) => info!(?outcome, path = %self.store.path().display(), "progress saved"),
            Ok(Err(err)) => return Err(err).context("saving progress after interrupt"),
            Err(_) => error!(
                grace_secs = self.config.grace_secs,
                "grace period elapsed before progress was saved"
            ),
        }
        Ok(RunOutcome::Interrupted)
    }

    pub async fn status(&self) -> StatusReport {
        self.store.read(StatusReport::from_checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::{anixl, fixture, MapPages};
    use async_trait::async_trait;
    use elh_adapters::{PageSnapshot, RenderError};
    use elh_core::{CollectionState, Record, META_MAIN_URL};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    const DEMO: &str = "https://anixl.to/title/101-demo-show";
    const SAGA: &str = "https://anixl.to/title/202-paged-saga";
    const REMAKE: &str = "https://anixl.to/title/303-demo-show-remake";

    fn config(dir: &std::path::Path) -> HarvestConfig {
        HarvestConfig {
            checkpoint_path: dir.join("checkpoint.json"),
            concurrency: 4,
            item_timeout_secs: 5,
            grace_secs: 2,
            ..HarvestConfig::default()
        }
    }

    fn site_pages() -> MapPages {
        MapPages::default()
            .with("https://anixl.to/search?page=1", fixture("listing_page.html"))
            .with("https://anixl.to/search?page=2", "<html></html>")
            .with(DEMO, fixture("title_static.html"))
            .with(SAGA, fixture("title_paginated.html"))
    }

    fn listing_registry() -> SourceRegistry {
        SourceRegistry {
            listings: vec![ListingConfig {
                url: "https://anixl.to/search".to_string(),
                start_page: 1,
                max_pages: None,
            }],
            titles: vec!["/title/101-demo-show".to_string()],
        }
    }

    /// Completes every reference except the ones listed in `hang`, which never return.
    #[derive(Default)]
    struct FakeFetcher {
        hang: Vec<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EpisodeFetcher for FakeFetcher {
        async fn fetch(&self, reference: &WorkItemRef) -> Record {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let position: usize = reference
                .as_str()
                .rsplit('/')
                .next()
                .and_then(|s| s.split('-').next())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            if self.hang.contains(&(position % 10)) {
                std::future::pending::<()>().await;
            }
            Record {
                video: format!("{reference}/master.m3u8"),
                ..Record::empty()
            }
        }
    }

    struct FixedRenderer;

    #[async_trait]
    impl PageRenderer for FixedRenderer {
        async fn render(&self, url: &str) -> Result<PageSnapshot, RenderError> {
            Ok(PageSnapshot {
                url: url.to_string(),
                html: fixture("title_paginated.html"),
            })
        }

        async fn interact(&self, snapshot: &PageSnapshot, _label: &str) -> Result<PageSnapshot, RenderError> {
            Ok(snapshot.clone())
        }
    }

    /// A checkpoint path whose parent is a regular file, so every write fails.
    fn unwritable_config(dir: &std::path::Path) -> HarvestConfig {
        let blocker = dir.join("blocker");
        std::fs::write(&blocker, b"not a directory").expect("blocker");
        HarvestConfig {
            checkpoint_path: blocker.join("checkpoint.json"),
            ..config(dir)
        }
    }

    fn pending_demo() -> CheckpointFile {
        let mut file = CheckpointFile::default();
        file.collections.insert(
            CollectionKey::canonicalize("demo"),
            CollectionState {
                refs: (0..3)
                    .map(|i| WorkItemRef::new(format!("{DEMO}/{}-episode", 5000 + i)))
                    .collect(),
                ..Default::default()
            },
        );
        file
    }

    fn harvester(dir: &std::path::Path, pages: MapPages, fetcher: Arc<FakeFetcher>) -> Harvester {
        let config = config(dir);
        let store = Arc::new(CheckpointStore::with_state(
            config.checkpoint_path.clone(),
            CheckpointFile::default(),
        ));
        Harvester::new(config, store, anixl(), Arc::new(pages), fetcher)
    }

    #[tokio::test]
    async fn discovery_records_static_titles_and_defers_paginated_ones() {
        let dir = tempdir().expect("tempdir");
        let h = harvester(dir.path(), site_pages(), Arc::new(FakeFetcher::default()));

        let summary = h
            .discover(&listing_registry(), DiscoverOptions::default())
            .await
            .expect("discover");

        assert_eq!(summary.sources, 2);
        assert_eq!(summary.collections, 1);
        assert_eq!(summary.deferred, 1);

        let on_disk = CheckpointStore::load(h.store().path()).await;
        let demo = &on_disk.collections[&CollectionKey::canonicalize("demo show")];
        assert_eq!(demo.metadata[META_MAIN_URL], DEMO);
        assert_eq!(demo.refs.len(), 3);
        assert_eq!(demo.items.len(), 3);
        assert_eq!(on_disk.deferred, vec![SAGA.to_string()]);
    }

    #[tokio::test]
    async fn known_sources_are_not_fetched_again_unless_rediscovering() {
        let dir = tempdir().expect("tempdir");
        let pages = Arc::new(site_pages());
        let config = config(dir.path());
        let store = Arc::new(CheckpointStore::with_state(
            config.checkpoint_path.clone(),
            CheckpointFile::default(),
        ));
        let h = Harvester::new(
            config,
            store,
            anixl(),
            Arc::clone(&pages) as Arc<dyn PageSource>,
            Arc::new(FakeFetcher::default()),
        );
        let registry = SourceRegistry {
            listings: Vec::new(),
            titles: vec![DEMO.to_string(), SAGA.to_string()],
        };

        h.discover(&registry, DiscoverOptions::default()).await.expect("first");
        let second = h.discover(&registry, DiscoverOptions::default()).await.expect("second");
        assert_eq!(second.skipped, 2);
        assert_eq!(pages.requested.lock().unwrap().len(), 2);

        let again = h
            .discover(
                &registry,
                DiscoverOptions {
                    rediscover: true,
                    render: false,
                },
            )
            .await
            .expect("rediscover");
        assert_eq!(again.skipped, 0);
        assert_eq!(pages.requested.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn colliding_sources_settle_on_one_owner_and_resume_without_refetching() {
        let dir = tempdir().expect("tempdir");
        let remake = fixture("title_static.html").replace("101-demo-show", "303-demo-show-remake");
        let pages = || site_pages().with(REMAKE, remake.clone());
        let registry = SourceRegistry {
            listings: Vec::new(),
            titles: vec![DEMO.to_string(), REMAKE.to_string()],
        };
        let key = CollectionKey::canonicalize("demo show");

        let fetcher = Arc::new(FakeFetcher::default());
        let first = harvester(dir.path(), pages(), Arc::clone(&fetcher));
        let summary = first.run(&registry, DiscoverOptions::default()).await.expect("first run");
        assert_eq!(summary.discovery.collections, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        drop(first);

        for _ in 0..2 {
            let config = config(dir.path());
            let store = Arc::new(CheckpointStore::open(config.checkpoint_path.clone()).await);
            let idle = Arc::new(FakeFetcher::default());
            let h = Harvester::new(config, store, anixl(), Arc::new(pages()), Arc::clone(&idle) as Arc<dyn EpisodeFetcher>);

            let summary = h.run(&registry, DiscoverOptions::default()).await.expect("resumed run");
            assert_eq!(summary.discovery.skipped, 2);
            assert_eq!(summary.enrichment.dispatched, 0);
            assert_eq!(idle.calls.load(Ordering::SeqCst), 0);

            let on_disk = CheckpointStore::load(h.store().path()).await;
            assert_eq!(on_disk.collections[&key].main_url(), Some(REMAKE));
            assert_eq!(on_disk.collections[&key].complete_count(), 3);
            assert_eq!(on_disk.superseded, vec![DEMO.to_string()]);
        }
    }

    #[tokio::test]
    async fn rendered_discovery_resolves_deferred_sources() {
        let dir = tempdir().expect("tempdir");
        let h = harvester(dir.path(), site_pages(), Arc::new(FakeFetcher::default()))
            .with_renderer(Arc::new(FixedRenderer));
        let registry = SourceRegistry {
            listings: Vec::new(),
            titles: vec![SAGA.to_string()],
        };

        let summary = h
            .discover(
                &registry,
                DiscoverOptions {
                    rediscover: false,
                    render: true,
                },
            )
            .await
            .expect("discover");
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.rendered, 1);

        let file = h.store().snapshot().await;
        assert!(file.deferred.is_empty());
        let saga = &file.collections[&CollectionKey::canonicalize("paged-saga")];
        assert_eq!(saga.refs.len(), 2);
        assert_eq!(saga.main_url(), Some(SAGA));
    }

    #[tokio::test]
    async fn enrichment_fills_every_pending_slot_and_skips_complete_ones() {
        let dir = tempdir().expect("tempdir");
        let fetcher = Arc::new(FakeFetcher::default());
        let h = harvester(dir.path(), site_pages(), Arc::clone(&fetcher));
        h.discover(&listing_registry(), DiscoverOptions::default())
            .await
            .expect("discover");

        let summary = h.enrich().await.expect("enrich");
        assert_eq!(summary.completed, 3);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        let status = h.status().await;
        assert_eq!((status.complete(), status.total()), (3, 3));
        assert_eq!(status.deferred, 1);

        let second = h.enrich().await.expect("second enrich");
        assert_eq!(second.dispatched, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn interrupt_saves_reconciled_progress_and_reports_interrupted() {
        let dir = tempdir().expect("tempdir");
        let refs: Vec<WorkItemRef> = (0..3)
            .map(|i| WorkItemRef::new(format!("{DEMO}/{}-episode", 5000 + i)))
            .collect();
        let mut file = CheckpointFile::default();
        file.collections.insert(
            CollectionKey::canonicalize("demo"),
            CollectionState {
                refs,
                ..Default::default()
            },
        );
        let config = config(dir.path());
        let store = Arc::new(CheckpointStore::with_state(config.checkpoint_path.clone(), file));
        let fetcher = Arc::new(FakeFetcher {
            hang: vec![2],
            ..Default::default()
        });
        let h = Harvester::new(config, store, anixl(), Arc::new(MapPages::default()), fetcher);

        let (tx, mut shutdown) = ShutdownSignal::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });

        let outcome = h
            .run_until_shutdown(h.enrich(), &mut shutdown)
            .await
            .expect("graceful stop");
        assert!(matches!(outcome, RunOutcome::Interrupted));

        let on_disk = CheckpointStore::load(h.store().path()).await;
        let items = &on_disk.collections[&CollectionKey::canonicalize("demo")].items;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_complete());
        assert!(items[1].is_complete());
        assert!(items[2].is_empty());
    }

    #[tokio::test]
    async fn enrichment_fails_when_progress_cannot_be_saved() {
        let dir = tempdir().expect("tempdir");
        let config = unwritable_config(dir.path());
        let store = Arc::new(CheckpointStore::with_state(config.checkpoint_path.clone(), pending_demo()));
        let fetcher = Arc::new(FakeFetcher::default());
        let h = Harvester::new(config, store, anixl(), Arc::new(MapPages::default()), Arc::clone(&fetcher) as Arc<dyn EpisodeFetcher>);

        let err = h.enrich().await.expect_err("checkpoint is unwritable");
        assert!(format!("{err:#}").contains("saving progress of demo"));
        assert!(err.chain().any(|cause| cause.downcast_ref::<CheckpointError>().is_some()));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interrupt_fails_when_progress_cannot_be_saved() {
        let dir = tempdir().expect("tempdir");
        let config = unwritable_config(dir.path());
        let store = Arc::new(CheckpointStore::with_state(config.checkpoint_path.clone(), pending_demo()));
        let h = Harvester::new(
            config,
            store,
            anixl(),
            Arc::new(MapPages::default()),
            Arc::new(FakeFetcher::default()),
        );
        h.store().update(|file| file.defer(SAGA)).await;

        let (tx, mut shutdown) = ShutdownSignal::channel();
        tx.send(true).expect("send");
        let err = h
            .run_until_shutdown(std::future::pending::<Result<()>>(), &mut shutdown)
            .await
            .expect_err("checkpoint is unwritable");
        assert!(format!("{err:#}").contains("saving progress after interrupt"));
    }

    #[tokio::test]
    async fn a_step_that_finishes_first_is_completed() {
        let dir = tempdir().expect("tempdir");
        let h = harvester(dir.path(), site_pages(), Arc::new(FakeFetcher::default()));
        let mut shutdown = ShutdownSignal::never();
        let outcome = h
            .run_until_shutdown(async { Ok(7) }, &mut shutdown)
            .await
            .expect("run");
        assert_eq!(outcome, RunOutcome::Completed(7));
    }
}
