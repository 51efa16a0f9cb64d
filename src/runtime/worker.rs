/// Claim-based workers
///
/// Each worker loops on `claim_one_step` and hands every claim to the
/// deferred runner. An empty poll (or a database error) doubles the sleep up
/// to `max_poll_backoff`; a successful claim resets it and polls again at once.

use crate::config::{LeaseConfig, WorkerConfig};
use crate::error::SchedulerResult;
use crate::repository::Repository;
use crate::runtime::deferred::DeferredRunner;
use crate::runtime::sweeper::spawn_lease_sweeper;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct Worker {
    id: String,
    repository: Repository,
    runner: DeferredRunner,
    poll_interval: Duration,
    max_poll_backoff: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        repository: Repository,
        runner: DeferredRunner,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            repository,
            runner,
            poll_interval: config.poll_interval(),
            max_poll_backoff: config.max_poll_backoff().max(config.poll_interval()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and start at most one step; true when a step was claimed
    ///
    /// A step that fails to dispatch is still a consumed claim, the runner
    /// already recorded the failure on it.
    pub async fn poll_once(&self) -> SchedulerResult<bool> {
        let Some(claim) = self.repository.claim_one_step(&self.id).await? else {
            return Ok(false);
        };
        if let Err(err) = self.runner.start(&claim).await {
            tracing::warn!("⚠️ Worker {} could not start step {}: {}", self.id, claim.step_id, err);
        }
        Ok(true)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("👷 Worker {} started", self.id);
        let mut backoff = self.poll_interval;

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(true) => {
                    backoff = self.poll_interval;
                    continue;
                }
                Ok(false) => {}
                Err(err) => tracing::error!("❌ Worker {} failed to claim: {}", self.id, err),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.max_poll_backoff);
        }

        tracing::info!("🛑 Worker {} stopped", self.id);
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// N workers plus the lease sweeper, stopped together
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        worker_config: &WorkerConfig,
        lease_config: &LeaseConfig,
        repository: Repository,
        runner: DeferredRunner,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(worker_config.workers + 1);

        for _ in 0..worker_config.workers {
            let worker = Worker::new(
                format!("worker-{}", Uuid::new_v4()),
                repository.clone(),
                runner.clone(),
                worker_config,
            );
            handles.push(tokio::spawn(worker.run(shutdown.child_token())));
        }
        handles.push(spawn_lease_sweeper(
            repository,
            lease_config.sweep_interval(),
            lease_config.lease_timeout(),
            shutdown.child_token(),
        ));

        tracing::info!("🚀 Worker pool started with {} workers", worker_config.workers);
        Self { shutdown, handles }
    }

    /// Stop polling and wait for every loop to exit
    ///
    /// Tasks already handed to the dispatcher keep running; their claims expire
    /// if nothing reports back.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!("❌ Worker task panicked: {}", err);
            }
        }
        tracing::info!("✅ Worker pool stopped");
    }
}
