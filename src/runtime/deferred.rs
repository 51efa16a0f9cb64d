/// Deferred runner: the bridge between claims and the task dispatcher
///
/// `start` resolves the claimed step in the registry, hands it to the
/// dispatcher and records the returned task uid, without waiting for the task.
/// Outcomes come back through `CompletionSink` and are written with the
/// claim's attempt token, so a late outcome never overwrites a newer state.

use crate::error::{SchedulerError, SchedulerResult};
use crate::operation::registry::OperationRegistry;
use crate::operation::step::FailurePolicy;
use crate::repository::models::{Claim, StepState};
use crate::repository::Repository;
use crate::runtime::dispatch::{CompletionSink, TaskDispatcher, TaskOutcome, TaskUid, WorkDescriptor};
use crate::runtime::lifecycle::RunLifecycle;
use crate::store::{EphemeralStore, ScheduleDataProxy, StepStoreProxy};
use async_trait::async_trait;
use std::sync::Arc;

/// Cheap to clone; clones share the same collaborators
#[derive(Clone)]
pub struct DeferredRunner {
    repository: Repository,
    store: Arc<dyn EphemeralStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    registry: Arc<OperationRegistry>,
    lifecycle: Arc<RunLifecycle>,
}

impl DeferredRunner {
    pub fn new(
        repository: Repository,
        store: Arc<dyn EphemeralStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        registry: Arc<OperationRegistry>,
        lifecycle: Arc<RunLifecycle>,
    ) -> Self {
        Self {
            repository,
            store,
            dispatcher,
            registry,
            lifecycle,
        }
    }

    /// Dispatch the claimed step's `create` or `destroy`
    ///
    /// The task uid is stored in the repository and in the step hash before
    /// this returns. When the step cannot be dispatched, or its task uid cannot
    /// be stored, the task is cancelled and the step marked `FAILED` so the run
    /// does not wait on it forever. The dispatch error is returned.
    pub async fn start(&self, claim: &Claim) -> SchedulerResult<TaskUid> {
        match self.dispatch(claim).await {
            Ok(task_uid) => Ok(task_uid),
            Err(err) => {
                tracing::error!("❌ Could not start step {} of run {}: {}", claim.step_type, claim.run_id, err);
                match self
                    .repository
                    .mark_step_failed(claim, &format!("dispatch failed: {err}"))
                    .await
                {
                    Ok(_) => {
                        if let Err(advance_err) = self.lifecycle.advance(&claim.run_id).await {
                            tracing::error!("❌ Could not advance run {}: {}", claim.run_id, advance_err);
                        }
                    }
                    Err(mark_err) => {
                        tracing::warn!("⚠️ Step {} left as is: {}", claim.step_id, mark_err)
                    }
                }
                Err(err)
            }
        }
    }

    async fn dispatch(&self, claim: &Claim) -> SchedulerResult<TaskUid> {
        let (group_index, group) = self
            .registry
            .locate_step(&claim.operation_name, &claim.step_type)?;
        let step_group_name = group.get_step_group_name(group_index);

        let run = self.repository.get_run(&claim.run_id).await?;
        let node = self.repository.get_node(&run.node_id).await?;

        ScheduleDataProxy::new(Arc::clone(&self.store), &claim.run_id)
            .set_progress(&claim.operation_name, group_index, claim.is_creating())
            .await?;
        let step_store = self.step_store(claim, &step_group_name);
        step_store
            .set_outcome(StepState::Running.as_str(), None, false)
            .await?;

        let work = WorkDescriptor {
            claim: claim.clone(),
            node_id: node.node_id,
            step_group_name,
            desired_spec: node.desired_spec,
        };
        let sink: Arc<dyn CompletionSink> = Arc::new(self.clone());
        let task_uid = self.dispatcher.start(work, sink).await?;

        if let Err(err) = self.remember_task(claim, &step_store, &task_uid).await {
            // nothing tracks this task any more
            if let Err(cancel_err) = self.dispatcher.cancel(&task_uid).await {
                tracing::warn!("⚠️ Could not cancel untracked task {}: {}", task_uid, cancel_err);
            }
            return Err(err);
        }

        tracing::info!(
            "📤 Dispatched {} ({}) of run {} as task {}",
            claim.step_type,
            if claim.is_creating() { "create" } else { "destroy" },
            claim.run_id,
            task_uid
        );
        Ok(task_uid)
    }

    async fn remember_task(
        &self,
        claim: &Claim,
        step_store: &StepStoreProxy,
        task_uid: &str,
    ) -> SchedulerResult<()> {
        self.repository.record_deferred_task(claim, task_uid).await?;
        step_store.set_deferred_task(task_uid).await
    }

    /// Request cooperative cancellation of a dispatched task
    pub async fn cancel(&self, task_uid: &str) -> SchedulerResult<bool> {
        self.dispatcher.cancel(task_uid).await
    }

    fn step_store(&self, claim: &Claim, step_group_name: &str) -> StepStoreProxy {
        StepStoreProxy::new(
            Arc::clone(&self.store),
            &claim.run_id,
            &claim.operation_name,
            step_group_name,
            claim.is_creating(),
            &claim.step_type,
        )
    }

    /// Persist one outcome; returns the state written, if any
    async fn record_outcome(
        &self,
        work: &WorkDescriptor,
        outcome: TaskOutcome,
    ) -> SchedulerResult<Option<(StepState, Option<String>)>> {
        let claim = &work.claim;
        let (group_index, group) = self
            .registry
            .locate_step(&claim.operation_name, &claim.step_type)?;

        let written = match outcome {
            TaskOutcome::Success(payload) if group.repeat_steps && claim.is_creating() => {
                let requeued = self
                    .repository
                    .requeue_step_after(claim, payload.as_ref(), group.wait_before_repeat)
                    .await?;
                if !requeued {
                    return Ok(None);
                }
                tracing::debug!(
                    "🔁 Repeating {} of group {} in {:?}",
                    claim.step_type,
                    group.get_step_group_name(group_index),
                    group.wait_before_repeat
                );
                (StepState::Ready, None)
            }
            TaskOutcome::Success(payload) => {
                self.repository.mark_step_succeeded(claim, payload.as_ref()).await?;
                (StepState::Success, None)
            }
            TaskOutcome::Failed(traceback) => {
                let step = self.registry.get_step(&claim.operation_name, &claim.step_type)?;
                let state = match step.failure_policy() {
                    FailurePolicy::Fail => {
                        self.repository.mark_step_failed(claim, &traceback).await?;
                        StepState::Failed
                    }
                    FailurePolicy::WaitManual => {
                        self.repository.mark_step_waiting_manual(claim, &traceback).await?;
                        StepState::WaitingManual
                    }
                    FailurePolicy::Abandon => {
                        self.repository.mark_step_abandoned(claim, &traceback).await?;
                        StepState::Abandoned
                    }
                };
                tracing::warn!("⚠️ Step {} of run {} -> {}", claim.step_type, claim.run_id, state);
                (state, Some(traceback))
            }
            TaskOutcome::Cancelled => {
                self.repository.mark_step_cancelled(claim).await?;
                (StepState::Cancelled, None)
            }
        };
        Ok(Some(written))
    }
}

#[async_trait]
impl CompletionSink for DeferredRunner {
    async fn on_complete(&self, work: WorkDescriptor, outcome: TaskOutcome) {
        let claim = &work.claim;
        match self.record_outcome(&work, outcome).await {
            Ok(Some((state, traceback))) => {
                let mirrored = self
                    .step_store(claim, &work.step_group_name)
                    .set_outcome(
                        state.as_str(),
                        traceback.as_deref(),
                        state == StepState::WaitingManual,
                    )
                    .await;
                if let Err(err) = mirrored {
                    tracing::warn!("⚠️ Could not mirror step {} outcome: {}", claim.step_id, err);
                }
            }
            Ok(None) => {}
            Err(SchedulerError::StaleClaim { step_id, attempt }) => {
                tracing::info!("🗑️ Dropped outcome of stale attempt {} of step {}", attempt, step_id);
                return;
            }
            Err(err) => {
                tracing::error!("❌ Could not record outcome of step {}: {}", claim.step_id, err);
                return;
            }
        }

        if let Err(err) = self.lifecycle.advance(&claim.run_id).await {
            tracing::error!("❌ Could not advance run {}: {}", claim.run_id, err);
        }

        // the run may have finished before this outcome was mirrored
        match self.repository.get_run(&claim.run_id).await {
            Ok(run) if run.state.is_terminal() => {
                if let Err(err) = self.step_store(claim, &work.step_group_name).remove().await {
                    tracing::warn!("⚠️ Could not drop hash of step {}: {}", claim.step_id, err);
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("⚠️ Could not read run {}: {}", claim.run_id, err),
        }
    }

    async fn on_heartbeat(&self, work: &WorkDescriptor) {
        match self.repository.heartbeat_step(&work.claim).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("💤 Heartbeat for step {} no longer owns it", work.claim.step_id),
            Err(err) => tracing::warn!("⚠️ Heartbeat for step {} failed: {}", work.claim.step_id, err),
        }
    }
}
