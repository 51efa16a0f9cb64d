/// Run lifecycle: from desired intent to finished runs
///
/// `request_desired` turns a node intent into a run and materialises its DAG
/// under the node lock. `advance` is called after every step outcome: it
/// promotes newly unblocked steps, finalizes the run, starts a rollback when a
/// forward step broke, and starts the next run when the intent moved on while
/// the previous one was in flight.

use crate::error::SchedulerResult;
use crate::operation::registry::OperationRegistry;
use crate::operation::template::DagTemplate;
use crate::repository::models::{
    DesiredState, Direction, ManualAction, Run, RunId, RunKind, RunState, StepExecution, StepState,
};
use crate::repository::Repository;
use crate::runtime::dispatch::TaskDispatcher;
use crate::store::{EphemeralStore, ScheduleDataProxy, StepStoreProxy};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Outcome of `request_desired`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredUpdate {
    pub generation: i64,
    /// Run started for this intent, if the node was idle
    pub started_run: Option<RunId>,
    /// Active run asked to cancel because the intent flipped direction
    pub cancelled_run: Option<RunId>,
}

pub struct RunLifecycle {
    repository: Repository,
    registry: Arc<OperationRegistry>,
    store: Arc<dyn EphemeralStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl RunLifecycle {
    pub fn new(
        repository: Repository,
        registry: Arc<OperationRegistry>,
        store: Arc<dyn EphemeralStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            repository,
            registry,
            store,
            dispatcher,
        }
    }

    /// Record a new intent for the node and start converging it
    pub async fn request_desired(
        &self,
        node_id: &str,
        operation_name: &str,
        desired: DesiredState,
        desired_spec: Value,
    ) -> SchedulerResult<DesiredUpdate> {
        // unknown operations are rejected before anything is written
        self.registry.get_operation(operation_name)?;

        let mut tx = self.repository.begin().await?;
        let node = self.repository.lock_node(node_id, &mut tx).await?;
        self.repository
            .set_node_operation(node_id, operation_name, &mut tx)
            .await?;
        let generation = self
            .repository
            .set_node_desired(node_id, desired, &desired_spec, &mut tx)
            .await?;

        let started_run = match node.active_run_id {
            None => Some(
                self.start_run(node_id, operation_name, generation, desired.run_kind(), &mut tx)
                    .await?,
            ),
            Some(_) => None,
        };
        tx.commit().await?;

        let mut cancelled_run = None;
        if let Some(active_run_id) = node.active_run_id {
            let active = self.repository.get_run(&active_run_id).await?;
            if active.kind != desired.run_kind() && self.cancel_run(&active_run_id).await? {
                cancelled_run = Some(active_run_id);
            } else {
                tracing::info!(
                    "⏳ Node {} busy with run {}, generation {} will follow",
                    node_id,
                    active_run_id,
                    generation
                );
            }
        }

        Ok(DesiredUpdate {
            generation,
            started_run,
            cancelled_run,
        })
    }

    /// Create, activate and materialise a run inside the node transaction
    async fn start_run(
        &self,
        node_id: &str,
        operation_name: &str,
        generation: i64,
        kind: RunKind,
        tx: &mut SqliteConnection,
    ) -> SchedulerResult<RunId> {
        let operation = self.registry.get_operation(operation_name)?;
        let run_id = self.repository.create_run(node_id, generation, kind, tx).await?;
        self.repository.set_active_run(node_id, &run_id, tx).await?;

        let template = DagTemplate::from_operation(operation_name, &operation);
        let (direction, template) = match kind {
            RunKind::Apply => (Direction::Do, template),
            RunKind::Revert => (Direction::Undo, template.reversed()),
        };
        self.repository
            .materialise(&run_id, direction, &template, tx)
            .await?;
        Ok(run_id)
    }

    /// Drive the run forward after a step changed state
    pub async fn advance(&self, run_id: &str) -> SchedulerResult<()> {
        let run = self.repository.get_run(run_id).await?;
        match run.state {
            RunState::Running => self.advance_running(&run).await,
            RunState::Reverting => self.advance_rollback(&run).await,
            RunState::Succeeded | RunState::Reverted | RunState::Failed => Ok(()),
        }
    }

    async fn advance_running(&self, run: &Run) -> SchedulerResult<()> {
        self.repository.promote_ready_steps(&run.run_id).await?;
        if self.repository.try_finalize_run(&run.run_id).await? {
            return self.after_finish(run).await;
        }

        let direction = run.kind.relevant_direction();
        let steps = self.repository.get_all_run_tracked_steps_states(&run.run_id).await?;
        let (broken, _) = tally(relevant(&steps, direction));

        if broken > 0 {
            // stop feeding the broken run; in-flight steps finish first
            self.repository
                .set_run_pending_steps_as_cancelled(&run.run_id, direction, RunState::Running)
                .await?;
            // nothing of this direction can be claimed any more
            let steps = self.repository.get_all_run_tracked_steps_states(&run.run_id).await?;
            let (_, running) = tally(relevant(&steps, direction));
            if running == 0 {
                match run.kind {
                    RunKind::Apply => self.rollback(run, &steps).await?,
                    RunKind::Revert => {
                        if self.repository.mark_run_failed(&run.run_id).await? {
                            return self.after_finish(run).await;
                        }
                    }
                }
            }
        }

        self.surface_problems(&run.run_id).await;
        Ok(())
    }

    /// Undo the forward steps that actually ran, in reverse group order
    async fn rollback(
        &self,
        run: &Run,
        steps: &HashMap<(String, bool), StepExecution>,
    ) -> SchedulerResult<()> {
        let operation_name = run.operation_name.as_deref().unwrap_or_default();
        let operation = self.registry.get_operation(operation_name)?;

        let claimed: BTreeSet<String> = steps
            .values()
            .filter(|step| !step.is_reverting && step.claimed_at.is_some())
            .map(|step| step.step_type.clone())
            .collect();
        let template = DagTemplate::from_operation(operation_name, &operation)
            .reversed()
            .restricted_to(&claimed);

        // undo steps exist before the run flips, so a concurrent advance never
        // sees a REVERTING run without them
        self.repository
            .insert_steps(&run.run_id, Direction::Undo, &template)
            .await?;
        self.repository
            .insert_deps(&run.run_id, Direction::Undo, &template)
            .await?;

        if !self.repository.begin_run_rollback(&run.run_id).await? {
            return Ok(());
        }
        self.surface_failure(run).await;

        let reverting = Run {
            state: RunState::Reverting,
            ..run.clone()
        };
        self.advance_rollback(&reverting).await
    }

    async fn advance_rollback(&self, run: &Run) -> SchedulerResult<()> {
        self.repository.promote_ready_steps(&run.run_id).await?;
        if self.repository.try_finalize_rollback(&run.run_id).await? {
            return self.after_finish(run).await;
        }

        let steps = self.repository.get_all_run_tracked_steps_states(&run.run_id).await?;
        let (broken, _) = tally(relevant(&steps, Direction::Undo));
        if broken > 0 {
            self.repository
                .set_run_pending_steps_as_cancelled(&run.run_id, Direction::Undo, RunState::Reverting)
                .await?;
            let steps = self.repository.get_all_run_tracked_steps_states(&run.run_id).await?;
            let (_, running) = tally(relevant(&steps, Direction::Undo));
            if running == 0 && self.repository.mark_run_failed(&run.run_id).await? {
                return self.after_finish(run).await;
            }
        }

        self.surface_problems(&run.run_id).await;
        Ok(())
    }

    /// Cancel an in-flight apply run and let it roll back
    ///
    /// Returns false for non-cancellable operations, revert runs and runs that
    /// are no longer `RUNNING`.
    pub async fn cancel_run(&self, run_id: &str) -> SchedulerResult<bool> {
        let run = self.repository.get_run(run_id).await?;
        if run.kind == RunKind::Revert {
            return Ok(false);
        }
        if let Some(operation_name) = run.operation_name.as_deref() {
            if !self.registry.get_operation(operation_name)?.is_cancellable {
                tracing::info!("🔒 Run {} of {} is not cancellable", run_id, operation_name);
                return Ok(false);
            }
        }
        if !self.repository.mark_run_cancel_requested(run_id).await? {
            return Ok(false);
        }

        let before = self.repository.get_all_run_tracked_steps_states(run_id).await?;
        let cancelled = self
            .repository
            .set_live_run_steps_as_cancelled(run_id, Direction::Do, RunState::Running)
            .await?;
        for step in before.values() {
            if step.is_reverting || !cancelled.contains(&step.step_id) {
                continue;
            }
            if let Some(task_uid) = step.deferred_task_uid.as_deref() {
                if let Err(err) = self.dispatcher.cancel(task_uid).await {
                    tracing::warn!("⚠️ Failed to cancel task {} of step {}: {}", task_uid, step.step_id, err);
                }
            }
        }

        tracing::info!("🛑 Run {} cancelled ({} steps)", run_id, cancelled.len());
        self.advance(run_id).await?;
        Ok(true)
    }

    /// Apply an operator decision and resume the run
    pub async fn resolve_manual(
        &self,
        run_id: &str,
        step_type: &str,
        is_reverting: bool,
        action: &ManualAction,
    ) -> SchedulerResult<bool> {
        let applied = self
            .repository
            .apply_manual_action(run_id, step_type, is_reverting, action)
            .await?;
        if applied {
            self.advance(run_id).await?;
        }
        Ok(applied)
    }

    /// Drop the run's hashes, then start the next run when the intent moved
    /// past the finished one
    async fn after_finish(&self, run: &Run) -> SchedulerResult<()> {
        self.forget_run(&run.run_id, run.operation_name.as_deref()).await;

        let node = self.repository.get_node(&run.node_id).await?;
        if node.generation <= run.generation {
            return Ok(());
        }
        let Some(operation_name) = node.operation_name else {
            return Ok(());
        };

        let mut tx = self.repository.begin().await?;
        let locked = self.repository.lock_node(&node.node_id, &mut tx).await?;
        if locked.active_run_id.is_some() {
            tx.commit().await?;
            return Ok(());
        }
        let run_id = self
            .start_run(
                &locked.node_id,
                &operation_name,
                locked.generation,
                locked.desired_state.run_kind(),
                &mut tx,
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            "🔄 Node {} moved to generation {}, started run {}",
            locked.node_id,
            locked.generation,
            run_id
        );
        Ok(())
    }

    /// Delete the schedule hash and every step hash of a finished run
    async fn forget_run(&self, run_id: &str, operation_name: Option<&str>) {
        let forgotten: SchedulerResult<usize> = async {
            let steps = self.repository.get_all_run_tracked_steps(run_id).await?;
            if let Some(operation_name) = operation_name {
                for (step_type, is_reverting) in &steps {
                    let (group_index, group) = self.registry.locate_step(operation_name, step_type)?;
                    StepStoreProxy::new(
                        Arc::clone(&self.store),
                        run_id,
                        operation_name,
                        &group.get_step_group_name(group_index),
                        !*is_reverting,
                        step_type,
                    )
                    .remove()
                    .await?;
                }
            }
            ScheduleDataProxy::new(Arc::clone(&self.store), run_id).remove().await?;
            Ok(steps.len())
        }
        .await;

        match forgotten {
            Ok(count) => tracing::debug!("🧽 Dropped store entries of run {} ({} steps)", run_id, count),
            Err(err) => tracing::warn!("⚠️ Could not drop store entries of run {}: {}", run_id, err),
        }
    }

    async fn surface_problems(&self, run_id: &str) {
        match self.repository.run_has_problems(run_id).await {
            Ok(true) => {
                let schedule = ScheduleDataProxy::new(Arc::clone(&self.store), run_id);
                if let Err(err) = schedule
                    .set_error("STEP_ISSUE", "a step requires manual intervention or was abandoned")
                    .await
                {
                    tracing::warn!("⚠️ Could not surface problems of run {}: {}", run_id, err);
                }
            }
            Ok(false) => {}
            Err(err) => tracing::warn!("⚠️ Could not check problems of run {}: {}", run_id, err),
        }
    }

    async fn surface_failure(&self, run: &Run) {
        let schedule = ScheduleDataProxy::new(Arc::clone(&self.store), &run.run_id);
        let message = format!("{} run of node {} did not complete", run.kind, run.node_id);
        if let Err(err) = schedule.set_error("RUN_FAILED", &message).await {
            tracing::warn!("⚠️ Could not surface failure of run {}: {}", run.run_id, err);
        }
    }
}

fn relevant(
    steps: &HashMap<(String, bool), StepExecution>,
    direction: Direction,
) -> impl Iterator<Item = &StepExecution> {
    steps
        .values()
        .filter(move |step| step.is_reverting == direction.is_reverting())
}

/// `(broken, running)` counts over the given steps
fn tally<'a>(steps: impl Iterator<Item = &'a StepExecution>) -> (usize, usize) {
    steps.fold((0, 0), |(broken, running), step| match step.state {
        StepState::Failed | StepState::Abandoned | StepState::Cancelled => (broken + 1, running),
        StepState::Running => (broken, running + 1),
        StepState::Created
        | StepState::Ready
        | StepState::Success
        | StepState::WaitingManual
        | StepState::Skipped => (broken, running),
    })
}
