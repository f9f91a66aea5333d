//! Bulk sync of existing entities into an edge's outbox.
//!
//! One generic [`PageableFetcher`] per entity type, built from two
//! capabilities: a [`PageFetch`] source returning pages of entities related
//! to an edge, and a conversion from one entity to the id and body of the
//! ADDED event that announces it. A [`FetcherRegistry`] holds one fetcher
//! per entity type and runs them in registration order.

use crate::config::{FetchConfig, RetryConfig};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use edgesync_outbox::EventOutbox;
use edgesync_protocol::{EdgeEvent, EdgeId, EntityId, EntityType, PageData, PageLink, TenantId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of entity pages for one entity type.
///
/// Repeating a call with the same link must return the same page.
#[async_trait]
pub trait PageFetch<T>: Send + Sync {
    /// Fetches the page described by `link` of entities related to `edge`.
    async fn fetch_page(
        &self,
        tenant: TenantId,
        edge: EdgeId,
        link: &PageLink,
    ) -> SyncResult<PageData<T>>;
}

/// What an entity contributes to its ADDED event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedEntity {
    /// Entity id.
    pub id: EntityId,
    /// Event body.
    pub body: Option<Vec<u8>>,
}

/// Converts one fetched entity.
pub type ConvertFn<T> = Arc<dyn Fn(&T) -> SyncResult<ConvertedEntity> + Send + Sync>;

/// Where a drain stands. Holding on to it lets a failed drain resume with
/// the page that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchProgress {
    link: PageLink,
    done: bool,
}

impl FetchProgress {
    /// Progress positioned at the first page.
    pub fn start(link: PageLink) -> Self {
        Self { link, done: false }
    }

    /// The next page to request.
    pub fn link(&self) -> &PageLink {
        &self.link
    }

    /// True once the last page was appended.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn advance(&mut self, last: bool) {
        if last {
            self.done = true;
        } else {
            self.link = self.link.next_page_link();
        }
    }
}

/// An entity that failed conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntity {
    /// Entity type.
    pub entity_type: EntityType,
    /// Page it was on.
    pub page: u32,
    /// Position on that page.
    pub index: usize,
    /// Conversion error.
    pub reason: String,
}

/// Converted contents of one page.
#[derive(Debug, Clone)]
pub struct PageEvents {
    /// One ADDED event per converted entity, in page order.
    pub events: Vec<EdgeEvent>,
    /// Entities that failed conversion.
    pub skipped: Vec<SkippedEntity>,
    /// Whether this is the final page.
    pub last: bool,
}

/// Totals of a drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Pages appended.
    pub pages: u32,
    /// Events appended.
    pub appended: usize,
    /// Entities skipped.
    pub skipped: Vec<SkippedEntity>,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.pages += other.pages;
        self.appended += other.appended;
        self.skipped.extend(other.skipped);
    }
}

/// Generic pagination driver for one entity type.
pub struct PageableFetcher<T> {
    entity_type: EntityType,
    source: Arc<dyn PageFetch<T>>,
    convert: ConvertFn<T>,
    config: FetchConfig,
}

impl<T: Send + Sync + 'static> PageableFetcher<T> {
    /// Creates a fetcher.
    pub fn new(
        entity_type: EntityType,
        source: Arc<dyn PageFetch<T>>,
        convert: impl Fn(&T) -> SyncResult<ConvertedEntity> + Send + Sync + 'static,
        config: FetchConfig,
    ) -> Self {
        Self {
            entity_type,
            source,
            convert: Arc::new(convert),
            config,
        }
    }

    /// Progress positioned at the first page, sorted as configured.
    pub fn start(&self) -> FetchProgress {
        FetchProgress::start(
            PageLink::new(self.config.page_size).with_sort_order(self.config.sort_order.clone()),
        )
    }

    /// A lazy page-by-page view of the events for `edge`.
    pub fn drain(&self, tenant: TenantId, edge: EdgeId) -> FetchDrain<'_, T> {
        FetchDrain {
            fetcher: self,
            tenant,
            edge,
            progress: self.start(),
        }
    }

    /// Fetches and converts the page at `link` without moving any progress.
    pub async fn fetch_events(
        &self,
        tenant: TenantId,
        edge: EdgeId,
        link: &PageLink,
    ) -> SyncResult<PageEvents> {
        let page = self.source.fetch_page(tenant, edge, link).await?;
        let last = page.is_last(link);

        let mut events = Vec::with_capacity(page.data.len());
        let mut skipped = Vec::new();
        for (index, entity) in page.data.iter().enumerate() {
            match (self.convert)(entity) {
                Ok(converted) => events.push(EdgeEvent::added(
                    tenant,
                    edge,
                    self.entity_type,
                    converted.id,
                    converted.body,
                )),
                Err(e) => {
                    warn!(
                        %edge,
                        entity_type = self.entity_type.as_str(),
                        page = link.page,
                        index,
                        error = %e,
                        "skipping entity that failed conversion"
                    );
                    skipped.push(SkippedEntity {
                        entity_type: self.entity_type,
                        page: link.page,
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(PageEvents {
            events,
            skipped,
            last,
        })
    }

    /// Appends every remaining page to the outbox, one atomic append per page.
    ///
    /// `progress` only moves after a page is durable, so on error the same
    /// call can be repeated and resumes with the page that failed.
    pub async fn drain_into(
        &self,
        outbox: &EventOutbox,
        tenant: TenantId,
        edge: EdgeId,
        progress: &mut FetchProgress,
    ) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        while !progress.is_done() {
            let page = self.fetch_events(tenant, edge, progress.link()).await?;
            let receipt = outbox.append(edge, page.events)?;

            debug!(
                %edge,
                entity_type = self.entity_type.as_str(),
                page = progress.link().page,
                appended = receipt.count,
                "appended fetched page"
            );
            report.pages += 1;
            report.appended += receipt.count;
            report.skipped.extend(page.skipped);
            progress.advance(page.last);
        }
        Ok(report)
    }
}

/// Lazy sequence of converted pages for one edge.
///
/// [`next_page`](Self::next_page) fetches the current page;
/// [`commit`](Self::commit) moves past it. A page that is not committed is
/// fetched again by the next call.
pub struct FetchDrain<'a, T> {
    fetcher: &'a PageableFetcher<T>,
    tenant: TenantId,
    edge: EdgeId,
    progress: FetchProgress,
}

impl<T: Send + Sync + 'static> FetchDrain<'_, T> {
    /// Fetches the current page, `None` once the drain is finished.
    pub async fn next_page(&mut self) -> SyncResult<Option<PageEvents>> {
        if self.progress.is_done() {
            return Ok(None);
        }
        self.fetcher
            .fetch_events(self.tenant, self.edge, self.progress.link())
            .await
            .map(Some)
    }

    /// Marks the current page as consumed.
    pub fn commit(&mut self, page: &PageEvents) {
        self.progress.advance(page.last);
    }

    /// Current progress.
    pub fn progress(&self) -> &FetchProgress {
        &self.progress
    }
}

/// Type-erased fetcher stored in a [`FetcherRegistry`].
#[async_trait]
pub trait BulkFetch: Send + Sync {
    /// Entity type handled.
    fn entity_type(&self) -> EntityType;

    /// Progress positioned at the first page.
    fn start(&self) -> FetchProgress;

    /// See [`PageableFetcher::drain_into`].
    async fn drain_into(
        &self,
        outbox: &EventOutbox,
        tenant: TenantId,
        edge: EdgeId,
        progress: &mut FetchProgress,
    ) -> SyncResult<DrainReport>;
}

#[async_trait]
impl<T: Send + Sync + 'static> BulkFetch for PageableFetcher<T> {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    fn start(&self) -> FetchProgress {
        PageableFetcher::start(self)
    }

    async fn drain_into(
        &self,
        outbox: &EventOutbox,
        tenant: TenantId,
        edge: EdgeId,
        progress: &mut FetchProgress,
    ) -> SyncResult<DrainReport> {
        PageableFetcher::drain_into(self, outbox, tenant, edge, progress).await
    }
}

/// Ordered table of fetchers, one per entity type.
#[derive(Default)]
pub struct FetcherRegistry {
    fetchers: Vec<Box<dyn BulkFetch>>,
}

impl FetcherRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fetcher, replacing any previous one for the same type.
    pub fn register(&mut self, fetcher: impl BulkFetch + 'static) {
        let entity_type = fetcher.entity_type();
        self.fetchers.retain(|f| f.entity_type() != entity_type);
        self.fetchers.push(Box::new(fetcher));
    }

    /// Registered entity types in run order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        self.fetchers.iter().map(|f| f.entity_type()).collect()
    }

    /// Runs every fetcher for an edge, retrying transient failures.
    ///
    /// A retry re-requests the page that failed. Non-retryable errors and
    /// exhausted retries abort the sync; cancellation is checked between
    /// attempts.
    pub async fn sync_edge(
        &self,
        outbox: &EventOutbox,
        tenant: TenantId,
        edge: EdgeId,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> SyncResult<DrainReport> {
        let mut total = DrainReport::default();
        for fetcher in &self.fetchers {
            let mut progress = fetcher.start();
            let mut attempt = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                match fetcher.drain_into(outbox, tenant, edge, &mut progress).await {
                    Ok(report) => {
                        total.merge(report);
                        break;
                    }
                    Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                        attempt += 1;
                        let delay = retry.delay_for_attempt(attempt);
                        warn!(
                            %edge,
                            entity_type = fetcher.entity_type().as_str(),
                            page = progress.link().page,
                            attempt,
                            error = %e,
                            "bulk fetch failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(
            %edge,
            appended = total.appended,
            skipped = total.skipped.len(),
            "bulk sync finished"
        );
        Ok(total)
    }
}

/// In-memory page source over a pre-sorted list, for tests and fixtures.
pub struct VecPageSource<T> {
    items: Mutex<Vec<T>>,
    failures: AtomicUsize,
    requests: Mutex<Vec<PageLink>>,
}

impl<T: Clone> VecPageSource<T> {
    /// Creates a source over `items`, already in sort order.
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items),
            failures: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `count` requests fail with a retryable error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Links requested so far, failed ones included.
    pub fn requests(&self) -> Vec<PageLink> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> PageFetch<T> for VecPageSource<T> {
    async fn fetch_page(
        &self,
        _tenant: TenantId,
        _edge: EdgeId,
        link: &PageLink,
    ) -> SyncResult<PageData<T>> {
        self.requests.lock().push(link.clone());
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Fetch("injected page failure".into()));
        }
        Ok(PageData::from_sorted(&self.items.lock(), link))
    }
}
