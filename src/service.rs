/// Service setup and initialization
///
/// Wires together the repository, the ephemeral store, the dispatcher, the run
/// lifecycle and the worker pool. Operations are registered by the embedding
/// service before the scheduler is built.

use crate::{
    config::Config,
    operation::registry::OperationRegistry,
    repository::{database, Repository},
    runtime::{DeferredRunner, LocalTaskDispatcher, RunLifecycle, TaskDispatcher, WorkerPool},
    store::{EphemeralStore, InMemoryStore},
};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, honouring `RUST_LOG`
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Fully wired scheduler, ready to spawn workers
#[derive(Clone)]
pub struct Scheduler {
    pub config: Config,
    pub repository: Repository,
    pub registry: Arc<OperationRegistry>,
    pub store: Arc<dyn EphemeralStore>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub lifecycle: Arc<RunLifecycle>,
    pub runner: DeferredRunner,
}

impl Scheduler {
    /// Connect to the database and wire every component
    pub async fn build(
        config: Config,
        registry: Arc<OperationRegistry>,
        store: Arc<dyn EphemeralStore>,
    ) -> Result<Self> {
        ensure_data_dir(&config.database.url)?;

        tracing::info!("🗄️ Connecting to {}", config.database.url);
        let pool = database::connect(&config.database)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open scheduler database: {}", e))?;
        let repository = Repository::new(pool);

        tracing::info!("⚙️ Initializing local task dispatcher");
        let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(LocalTaskDispatcher::new(
            Arc::clone(&registry),
            config.lease.heartbeat_interval(),
        ));

        let lifecycle = Arc::new(RunLifecycle::new(
            repository.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        ));
        let runner = DeferredRunner::new(
            repository.clone(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
        );

        tracing::info!(
            "✅ Scheduler initialized with operations {:?}",
            registry.list_operation_names()
        );
        Ok(Self {
            config,
            repository,
            registry,
            store,
            dispatcher,
            lifecycle,
            runner,
        })
    }

    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::spawn(
            &self.config.worker,
            &self.config.lease,
            self.repository.clone(),
            self.runner.clone(),
        )
    }
}

/// Run the scheduler until ctrl-c
pub async fn start_service(config: Config, registry: Arc<OperationRegistry>) -> Result<()> {
    init_tracing();
    tracing::info!("Starting stepwright scheduler...");

    let scheduler = Scheduler::build(config, registry, Arc::new(InMemoryStore::new())).await?;
    let pool = scheduler.spawn_workers();

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested");
    pool.shutdown().await;
    Ok(())
}

/// Create the parent directory of a file-backed SQLite url
fn ensure_data_dir(url: &str) -> Result<()> {
    let Some(path) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring data directory exists: {}", parent.display());
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_is_created_for_file_urls_only() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/stepwright.db");
        ensure_data_dir(&format!("sqlite://{}?mode=rwc", nested.display())).unwrap();
        assert!(dir.path().join("a/b").is_dir());

        ensure_data_dir("sqlite::memory:").unwrap();
        ensure_data_dir("sqlite://:memory:").unwrap();
    }

    #[tokio::test]
    async fn scheduler_builds_against_a_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.url = format!("sqlite://{}", dir.path().join("data/s.db").display());
        config.worker.workers = 2;

        let scheduler = Scheduler::build(
            config,
            Arc::new(OperationRegistry::new()),
            Arc::new(InMemoryStore::new()),
        )
        .await
        .unwrap();

        let pool = scheduler.spawn_workers();
        pool.shutdown().await;
        assert!(dir.path().join("data/s.db").exists());
    }
}
