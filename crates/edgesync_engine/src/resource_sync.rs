//! Periodic import of gateway dashboard resources from an external repository.

use crate::config::ResourceSyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::router::PartitionRouter;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Repository key of the gateway dashboard sources.
pub const GATEWAYS_REPO_KEY: &str = "gateways-dashboard";

/// Resource key the gateway dashboard is stored under.
pub const GATEWAYS_DASHBOARD_KEY: &str = "gateways_dashboard.json";

/// Kind of repository entry to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular files.
    File,
    /// Directories.
    Directory,
}

/// An entry in a resource repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    /// Path relative to the repository root.
    pub path: String,
    /// File name.
    pub name: String,
    /// Entry kind.
    pub file_type: FileType,
}

/// Kind of system resource being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// JavaScript module.
    JsModule,
    /// Dashboard definition.
    Dashboard,
}

/// Read access to an external resource repository.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Registers a repository under `repo_key`.
    async fn register(&self, repo_key: &str, url: &str, branch: &str) -> SyncResult<()>;

    /// Lists entries under `path` up to `depth` levels deep.
    async fn list_files(
        &self,
        repo_key: &str,
        path: &str,
        depth: u32,
        file_type: FileType,
    ) -> SyncResult<Vec<RepoFile>>;

    /// Reads a file's current content.
    async fn get_file_content(&self, repo_key: &str, path: &str) -> SyncResult<String>;
}

/// Destination of imported resources.
#[async_trait]
pub trait ResourceSink: Send + Sync {
    /// Creates or replaces a system resource.
    async fn update_system_resource(
        &self,
        kind: ResourceKind,
        key: &str,
        data: String,
    ) -> SyncResult<()>;

    /// Creates or replaces system widget bundles and widget types.
    async fn update_system_widgets(
        &self,
        bundles: Vec<String>,
        widget_types: Vec<String>,
    ) -> SyncResult<()>;
}

/// What one run of the job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Another node owns the system scope.
    NotOwner,
    /// Resources were imported.
    Imported {
        /// JS modules written.
        resources: usize,
        /// Widget bundles written.
        bundles: usize,
        /// Widget types written.
        widget_types: usize,
    },
}

/// Keeps the gateway dashboard and its widgets in line with a repository.
pub struct GatewayDashboardSync {
    repository: Arc<dyn ResourceRepository>,
    sink: Arc<dyn ResourceSink>,
    router: Arc<PartitionRouter>,
}

impl GatewayDashboardSync {
    /// Creates the job.
    pub fn new(
        repository: Arc<dyn ResourceRepository>,
        sink: Arc<dyn ResourceSink>,
        router: Arc<PartitionRouter>,
    ) -> Self {
        Self {
            repository,
            sink,
            router,
        }
    }

    async fn list(&self, path: &str) -> SyncResult<Vec<RepoFile>> {
        self.repository
            .list_files(GATEWAYS_REPO_KEY, path, 1, FileType::File)
            .await
    }

    async fn read_all(&self, files: &[RepoFile]) -> SyncResult<Vec<String>> {
        let mut contents = Vec::with_capacity(files.len());
        for file in files {
            contents.push(
                self.repository
                    .get_file_content(GATEWAYS_REPO_KEY, &file.path)
                    .await?,
            );
        }
        Ok(contents)
    }

    /// Runs one import if this node owns the system scope.
    pub async fn update(&self) -> SyncResult<ImportOutcome> {
        if !self.router.owns_system_scope() {
            debug!("skipping gateway dashboard sync, system scope owned elsewhere");
            return Ok(ImportOutcome::NotOwner);
        }

        let resources = self.list("resources").await?;
        for file in &resources {
            let data = self
                .repository
                .get_file_content(GATEWAYS_REPO_KEY, &file.path)
                .await?;
            self.sink
                .update_system_resource(ResourceKind::JsModule, &file.name, data)
                .await?;
        }

        let bundles = self.read_all(&self.list("widget_bundles").await?).await?;
        let widget_types = self.read_all(&self.list("widget_types").await?).await?;
        let (bundle_count, type_count) = (bundles.len(), widget_types.len());
        self.sink
            .update_system_widgets(bundles, widget_types)
            .await?;

        let dashboards = self.list("dashboards").await?;
        let dashboard = dashboards
            .first()
            .ok_or_else(|| SyncError::Fetch("repository has no dashboard".into()))?;
        let json = self
            .repository
            .get_file_content(GATEWAYS_REPO_KEY, &dashboard.path)
            .await?;
        self.sink
            .update_system_resource(ResourceKind::Dashboard, GATEWAYS_DASHBOARD_KEY, json)
            .await?;

        info!(
            resources = resources.len(),
            bundles = bundle_count,
            widget_types = type_count,
            "gateways dashboard sync completed"
        );
        Ok(ImportOutcome::Imported {
            resources: resources.len(),
            bundles: bundle_count,
            widget_types: type_count,
        })
    }

    /// Registers the repository and schedules the job.
    ///
    /// Returns `None` without touching the repository when disabled.
    pub async fn schedule(
        self: Arc<Self>,
        config: &ResourceSyncConfig,
        cancel: CancellationToken,
    ) -> SyncResult<Option<JoinHandle<()>>> {
        if !config.enabled {
            return Ok(None);
        }
        self.repository
            .register(GATEWAYS_REPO_KEY, &config.repository_url, &config.branch)
            .await?;
        let job = self;
        Ok(Some(spawn_periodic(
            "gateways-dashboard-sync",
            config.fetch_frequency,
            cancel,
            move || {
                let job = job.clone();
                async move { job.update().await.map(|_| ()) }
            },
        )))
    }
}

/// Runs `job` immediately and then every `interval` until cancelled.
///
/// A failed run is logged and the schedule continues.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = job().await {
                        warn!(job = name, error = %e, "periodic job failed");
                    }
                }
            }
        }
        debug!(job = name, "periodic job stopped");
    })
}
