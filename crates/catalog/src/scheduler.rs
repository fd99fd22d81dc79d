//! Background refresh scheduler: one cooperative loop per registered source,
//! with per-source mutual exclusion and a staleness policy.

use crate::model::{RefreshState, SourceRefreshStatus, SourceType};
use crate::scrape::{ScrapeContext, Scraper};
use crate::store::Store;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sleep between failed refresh attempts inside a loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Upper bound between staleness checks.
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Drives periodic refreshes of every registered source.
pub struct RefreshScheduler {
    store: Arc<Store>,
    ctx: ScrapeContext,
    scrapers: HashMap<SourceType, Arc<dyn Scraper>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RefreshScheduler {
    #[must_use]
    pub fn new(store: Arc<Store>, scrapers: Vec<Arc<dyn Scraper>>) -> Self {
        let ctx = ScrapeContext {
            cache_dir: store.cache_dir().to_path_buf(),
            sources_dir: store.sources_dir().to_path_buf(),
        };
        let scrapers = scrapers
            .into_iter()
            .map(|s| (s.source(), s))
            .collect::<HashMap<_, _>>();
        RefreshScheduler {
            store,
            ctx,
            scrapers,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Sources this scheduler can refresh.
    #[must_use]
    pub fn sources(&self) -> Vec<SourceType> {
        let mut sources: Vec<SourceType> = self.scrapers.keys().copied().collect();
        sources.sort_by_key(|s| s.as_str());
        sources
    }

    /// Spawn one refresh loop per source, plus an immediate refresh for any
    /// source that is already stale.
    pub fn start(&self) {
        let check_interval = self.check_interval();
        for (source, scraper) in &self.scrapers {
            let source = *source;
            tracing::info!(
                source = %source,
                check_interval_secs = check_interval.as_secs(),
                "starting refresh loop"
            );
            let store = Arc::clone(&self.store);
            let ctx = self.ctx.clone();
            let scraper = Arc::clone(scraper);
            let cancel = self.cancel.clone();
            let handle = tokio::spawn(async move {
                refresh_loop(store, ctx, scraper, cancel, check_interval).await;
            });
            self.tasks.lock().push(handle);

            if self.store.should_refresh(source) {
                let store = Arc::clone(&self.store);
                let ctx = self.ctx.clone();
                let scraper = Arc::clone(&self.scrapers[&source]);
                let handle = tokio::spawn(async move {
                    if let Err(e) = refresh_once(&store, &ctx, scraper.as_ref()).await {
                        tracing::warn!(source = %source, error = %e, "initial refresh failed");
                    }
                });
                self.tasks.lock().push(handle);
            }
        }
    }

    /// Cancel all loops and wait for them with a timeout.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("refresh task did not stop within the grace period");
            }
        }
        tracing::info!("refresh scheduler stopped");
    }

    /// Refresh `source` now, bypassing the staleness check but still holding
    /// the per-source guard. Returns the number of entries committed.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown source or a failed scrape; failures
    /// are also recorded in the source's refresh status.
    pub async fn force_refresh(&self, source: SourceType) -> anyhow::Result<usize> {
        let scraper = self
            .scrapers
            .get(&source)
            .ok_or_else(|| anyhow::anyhow!("no scraper registered for source '{source}'"))?;
        tracing::info!(source = %source, "force refreshing");
        refresh_once(&self.store, &self.ctx, scraper.as_ref()).await
    }

    fn check_interval(&self) -> Duration {
        MIN_CHECK_INTERVAL.max(self.store.refresh_interval() / 4)
    }
}

async fn refresh_loop(
    store: Arc<Store>,
    ctx: ScrapeContext,
    scraper: Arc<dyn Scraper>,
    cancel: CancellationToken,
    check_interval: Duration,
) {
    let source = scraper.source();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(check_interval) => {}
        }

        if !store.should_refresh(source) {
            tracing::debug!(source = %source, "refresh not due");
            continue;
        }

        let refresh = refresh_once(&store, &ctx, scraper.as_ref());
        let failed = tokio::select! {
            () = cancel.cancelled() => break,
            result = refresh => result.is_err(),
        };

        if failed {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(ERROR_BACKOFF) => {}
            }
        }
    }
    tracing::info!(source = %source, "refresh loop cancelled");
}

/// One refresh iteration. Holds the per-source guard for the whole body so
/// refreshes of the same source are strictly serialized; the store bulk add
/// is the single commit point.
async fn refresh_once(
    store: &Store,
    ctx: &ScrapeContext,
    scraper: &dyn Scraper,
) -> anyhow::Result<usize> {
    let source = scraper.source();
    let _guard = store.refresh_guard(source).lock().await;

    let mut status = SourceRefreshStatus {
        last_attempt: Some(Utc::now()),
        status: RefreshState::Refreshing,
        ..store
            .source_status(source)
            .unwrap_or_else(|| SourceRefreshStatus::new(source))
    };
    store.update_source_status(status.clone());

    match scraper.scrape(ctx).await {
        Ok(entries) => {
            let count = store.bulk_add(entries);
            status.last_refresh = Some(Utc::now());
            status.entry_count = count;
            status.status = RefreshState::Ok;
            status.error_message = None;
            store.update_source_status(status);
            tracing::info!(source = %source, count, "refreshed source");
            Ok(count)
        }
        Err(e) => {
            tracing::error!(source = %source, error = %e, "source refresh failed");
            status.status = RefreshState::Error;
            status.error_message = Some(e.to_string());
            store.update_source_status(status);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, SearchQuery};
    use crate::scrape::Scraper;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct StubScraper {
        source: SourceType,
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubScraper {
        fn new(source: SourceType) -> Self {
            StubScraper {
                source,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing(source: SourceType) -> Self {
            StubScraper {
                fail: true,
                ..StubScraper::new(source)
            }
        }
    }

    #[async_trait]
    impl Scraper for StubScraper {
        fn source(&self) -> SourceType {
            self.source
        }

        async fn scrape(&self, _ctx: &ScrapeContext) -> anyhow::Result<Vec<Entry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("scraper exploded");
            }
            Ok(vec![
                Entry::new("docker/one", "One", "d", self.source)?,
                Entry::new("docker/two", "Two", "d", self.source)?,
                Entry::new("docker/three", "Three", "d", self.source)?,
            ])
        }
    }

    fn store(dir: &TempDir) -> Arc<Store> {
        Arc::new(
            Store::open(
                dir.path().join("cache"),
                dir.path().join("sources"),
                Duration::from_secs(24 * 3600),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn force_refresh_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let scheduler = RefreshScheduler::new(
            Arc::clone(&store),
            vec![Arc::new(StubScraper::new(SourceType::Docker))],
        );

        let first = scheduler.force_refresh(SourceType::Docker).await.unwrap();
        let after_first = store
            .source_status(SourceType::Docker)
            .unwrap()
            .last_refresh
            .unwrap();
        let second = scheduler.force_refresh(SourceType::Docker).await.unwrap();
        let after_second = store
            .source_status(SourceType::Docker)
            .unwrap()
            .last_refresh
            .unwrap();

        assert_eq!(first, 3);
        assert_eq!(second, 3);
        assert_eq!(store.len(), 3, "no duplicate ids after re-refresh");
        assert!(after_second >= after_first);
    }

    #[tokio::test]
    async fn failed_refresh_records_error_status() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let scheduler = RefreshScheduler::new(
            Arc::clone(&store),
            vec![Arc::new(StubScraper::failing(SourceType::Mcpservers))],
        );

        assert!(scheduler.force_refresh(SourceType::Mcpservers).await.is_err());

        let status = store.source_status(SourceType::Mcpservers).unwrap();
        assert_eq!(status.status, RefreshState::Error);
        assert!(status.error_message.unwrap().contains("exploded"));
        assert!(status.last_attempt.is_some());
        assert!(status.last_refresh.is_none());
    }

    #[tokio::test]
    async fn refresh_success_populates_status_and_entries() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let scheduler = RefreshScheduler::new(
            Arc::clone(&store),
            vec![Arc::new(StubScraper::new(SourceType::Docker))],
        );

        scheduler.force_refresh(SourceType::Docker).await.unwrap();

        let status = store.source_status(SourceType::Docker).unwrap();
        assert_eq!(status.status, RefreshState::Ok);
        assert_eq!(status.entry_count, 3);
        assert!(status.last_refresh.is_some());
        assert!(!store.should_refresh(SourceType::Docker));

        let hits = store.search(&SearchQuery::text("One"));
        assert!(!hits.is_empty());
    }

    struct OverlapScraper {
        active: AtomicUsize,
        overlaps: AtomicUsize,
    }

    #[async_trait]
    impl Scraper for OverlapScraper {
        fn source(&self) -> SourceType {
            SourceType::Awesome
        }

        async fn scrape(&self, _ctx: &ScrapeContext) -> anyhow::Result<Vec<Entry>> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Entry::new("awesome/a", "A", "d", SourceType::Awesome)?])
        }
    }

    #[tokio::test]
    async fn same_source_refreshes_are_serialized() {
        let dir = TempDir::new().unwrap();
        let scraper = Arc::new(OverlapScraper {
            active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
        });
        let scheduler =
            RefreshScheduler::new(store(&dir), vec![Arc::clone(&scraper) as Arc<dyn Scraper>]);

        let (a, b) = tokio::join!(
            scheduler.force_refresh(SourceType::Awesome),
            scheduler.force_refresh(SourceType::Awesome),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(scraper.overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let scheduler = RefreshScheduler::new(store(&dir), Vec::new());
        assert!(scheduler.force_refresh(SourceType::Awesome).await.is_err());
        assert!(scheduler.sources().is_empty());
    }

    #[tokio::test]
    async fn start_triggers_initial_refresh_for_stale_sources() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let scheduler = RefreshScheduler::new(
            Arc::clone(&store),
            vec![Arc::new(StubScraper::new(SourceType::Docker))],
        );

        scheduler.start();
        // The initial refresh runs as a spawned task; give it a beat.
        for _ in 0..50 {
            if store.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;

        assert_eq!(store.len(), 3);
    }
}
