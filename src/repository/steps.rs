/// Step executions: materialisation, the claim protocol and transitions
///
/// Every write made on behalf of a claim is guarded by the claim's
/// `(worker_id, attempt)` and by `state = 'RUNNING'`, so a late write from an
/// older attempt can never overwrite a newer state. Claiming is one atomic
/// `UPDATE ... RETURNING` statement; SQLite serialises writers and the
/// `state = 'READY'` re-check is the compare-and-swap.

use crate::error::{SchedulerError, SchedulerResult};
use crate::operation::template::DagTemplate;
use crate::repository::models::{
    ms_to_dt, now_ms, Claim, Direction, ManualAction, ManualActionKind, RunState, StepExecution,
    StepId, StepState,
};
use crate::repository::{Repository, SATISFIED_STATES_SQL};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Attempts a step may be retried with `retry_failed_step`
pub const DEFAULT_AVAILABLE_ATTEMPTS: i64 = 3;

/// Actor recorded for `manual_retry_step`/`manual_skip_step`
const OPERATOR: &str = "operator";

const STEP_COLUMNS: &str = "step_id, run_id, operation_name, step_type, is_reverting, state, \
     attempt, available_attempts, worker_id, claimed_at, deferred_task_uid, payload, \
     error_traceback, requires_manual_intervention";

impl Repository {
    /// Insert one step in `CREATED`; fails when the triple already exists
    pub async fn create_step(
        &self,
        run_id: &str,
        operation_name: &str,
        step_type: &str,
        is_reverting: bool,
    ) -> SchedulerResult<StepExecution> {
        let step_id = Uuid::new_v4().to_string();
        let now = now_ms();

        let inserted = sqlx::query(
            r#"
            INSERT INTO step_executions
                (step_id, run_id, operation_name, step_type, is_reverting, state,
                 available_attempts, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, 'CREATED', ?, ?, ?)
            "#,
        )
        .bind(&step_id)
        .bind(run_id)
        .bind(operation_name)
        .bind(step_type)
        .bind(is_reverting)
        .bind(DEFAULT_AVAILABLE_ATTEMPTS)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => self.get_step(&step_id).await,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(SchedulerError::StepAlreadyExists {
                    run_id: run_id.to_string(),
                    step_type: step_type.to_string(),
                    is_reverting,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Materialise the template nodes as `CREATED` steps of `run_id`
    ///
    /// Idempotent: nodes already materialised for the same direction are kept.
    /// `template.workflow_id` is stored as the operation name.
    pub async fn insert_steps(
        &self,
        run_id: &str,
        direction: Direction,
        template: &DagTemplate,
    ) -> SchedulerResult<()> {
        template.validate()?;
        let mut tx = self.pool.begin().await?;
        insert_steps_with(&mut tx, run_id, direction, template).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Materialise the template edges as dependency rows of `run_id`
    ///
    /// Edges are resolved to step ids within the same run and direction, so
    /// `insert_steps` must have run first.
    pub async fn insert_deps(
        &self,
        run_id: &str,
        direction: Direction,
        template: &DagTemplate,
    ) -> SchedulerResult<()> {
        template.validate()?;
        let mut tx = self.pool.begin().await?;
        insert_deps_with(&mut tx, run_id, direction, template).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Steps, edges and promotion of the first ready steps inside `tx`
    pub async fn materialise(
        &self,
        run_id: &str,
        direction: Direction,
        template: &DagTemplate,
        tx: &mut SqliteConnection,
    ) -> SchedulerResult<()> {
        template.validate()?;
        insert_steps_with(tx, run_id, direction, template).await?;
        insert_deps_with(tx, run_id, direction, template).await?;
        promote_ready_steps_with(tx, run_id).await?;
        Ok(())
    }

    /// Move `CREATED` steps whose dependencies are all satisfied to `READY`
    pub async fn promote_ready_steps(&self, run_id: &str) -> SchedulerResult<u64> {
        let mut conn = self.pool.acquire().await?;
        promote_ready_steps_with(&mut conn, run_id).await
    }

    /// Atomically claim one ready step across all runs
    ///
    /// Bumps the attempt token and stamps `worker_id`, `claimed_at` and the
    /// first heartbeat. Returns `None` when nothing is claimable.
    pub async fn claim_one_step(&self, worker_id: &str) -> SchedulerResult<Option<Claim>> {
        let now = now_ms();
        let sql = format!(
            r#"
            UPDATE step_executions
            SET state = 'RUNNING', worker_id = ?, attempt = attempt + 1,
                claimed_at = ?, heartbeat_at = ?, modified_at = ?
            WHERE step_id = (
                SELECT s.step_id FROM step_executions s
                WHERE s.state = 'READY' AND COALESCE(s.ready_at, 0) <= ?
                  AND NOT EXISTS (
                    SELECT 1 FROM step_deps d
                    JOIN step_executions p ON p.step_id = d.depends_on_step_id
                    WHERE d.step_id = s.step_id AND p.state NOT IN {SATISFIED_STATES_SQL}
                  )
                ORDER BY s.ready_at, s.created_at
                LIMIT 1
            )
            AND state = 'READY'
            RETURNING step_id, run_id, operation_name, step_type, is_reverting, attempt,
                      worker_id, claimed_at
            "#
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let claim = Claim {
                    step_id: row.try_get("step_id")?,
                    run_id: row.try_get("run_id")?,
                    operation_name: row.try_get("operation_name")?,
                    step_type: row.try_get("step_type")?,
                    is_reverting: row.try_get("is_reverting")?,
                    attempt: row.try_get("attempt")?,
                    worker_id: row.try_get("worker_id")?,
                    claimed_at: ms_to_dt(row.try_get("claimed_at")?),
                };
                tracing::debug!(
                    "🔒 Worker {} claimed step {} ({}) attempt {}",
                    worker_id,
                    claim.step_type,
                    claim.step_id,
                    claim.attempt
                );
                Ok(Some(claim))
            }
            None => Ok(None),
        }
    }

    pub async fn mark_step_succeeded(
        &self,
        claim: &Claim,
        payload: Option<&Value>,
    ) -> SchedulerResult<bool> {
        let payload = payload.map(serde_json::to_string).transpose()?;
        self.finish_claimed(claim, StepState::Success, None, payload, false).await
    }

    pub async fn mark_step_failed(&self, claim: &Claim, traceback: &str) -> SchedulerResult<bool> {
        self.finish_claimed(claim, StepState::Failed, Some(traceback), None, false)
            .await
    }

    pub async fn mark_step_waiting_manual(
        &self,
        claim: &Claim,
        error: &str,
    ) -> SchedulerResult<bool> {
        self.finish_claimed(claim, StepState::WaitingManual, Some(error), None, true)
            .await
    }

    pub async fn mark_step_abandoned(&self, claim: &Claim, error: &str) -> SchedulerResult<bool> {
        self.finish_claimed(claim, StepState::Abandoned, Some(error), None, false)
            .await
    }

    pub async fn mark_step_cancelled(&self, claim: &Claim) -> SchedulerResult<bool> {
        self.finish_claimed(claim, StepState::Cancelled, None, None, false).await
    }

    /// Terminal transition of a claimed step
    ///
    /// `Ok(true)` when this call moved the step, `Ok(false)` when the same
    /// claim already left it in `target` (repeated call), `StaleClaim` when the
    /// claim no longer owns the step.
    async fn finish_claimed(
        &self,
        claim: &Claim,
        target: StepState,
        error_traceback: Option<&str>,
        payload: Option<String>,
        requires_manual_intervention: bool,
    ) -> SchedulerResult<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET state = ?, error_traceback = ?, payload = COALESCE(?, payload),
                requires_manual_intervention = ?, finished_at = ?, modified_at = ?
            WHERE step_id = ? AND worker_id = ? AND attempt = ? AND state = 'RUNNING'
            "#,
        )
        .bind(target.as_str())
        .bind(error_traceback)
        .bind(payload)
        .bind(requires_manual_intervention)
        .bind(now)
        .bind(now)
        .bind(&claim.step_id)
        .bind(&claim.worker_id)
        .bind(claim.attempt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::debug!("📝 Step {} ({}) -> {}", claim.step_type, claim.step_id, target);
            return Ok(true);
        }

        let current = self.get_step(&claim.step_id).await?;
        let same_claim = current.worker_id.as_deref() == Some(claim.worker_id.as_str())
            && current.attempt == claim.attempt;
        if same_claim && current.state == target {
            return Ok(false);
        }

        tracing::warn!(
            "⚠️ Rejected {} for step {} attempt {}: step is {} at attempt {}",
            target,
            claim.step_id,
            claim.attempt,
            current.state,
            current.attempt
        );
        Err(SchedulerError::StaleClaim {
            step_id: claim.step_id.clone(),
            attempt: claim.attempt,
        })
    }

    /// Put a running step of a repeating group back in `READY` after `delay`
    pub async fn requeue_step_after(
        &self,
        claim: &Claim,
        payload: Option<&Value>,
        delay: Duration,
    ) -> SchedulerResult<bool> {
        let payload = payload.map(serde_json::to_string).transpose()?;
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET state = 'READY', ready_at = ?, payload = COALESCE(?, payload),
                heartbeat_at = NULL, modified_at = ?
            WHERE step_id = ? AND worker_id = ? AND attempt = ? AND state = 'RUNNING'
            "#,
        )
        .bind(now + delay.as_millis() as i64)
        .bind(payload)
        .bind(now)
        .bind(&claim.step_id)
        .bind(&claim.worker_id)
        .bind(claim.attempt)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Store the dispatched task handle against the claimed attempt
    ///
    /// Not gated on `RUNNING`: a fast task may already have completed.
    pub async fn record_deferred_task(&self, claim: &Claim, task_uid: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET deferred_task_uid = ?, modified_at = ?
            WHERE step_id = ? AND worker_id = ? AND attempt = ?
            "#,
        )
        .bind(task_uid)
        .bind(now_ms())
        .bind(&claim.step_id)
        .bind(&claim.worker_id)
        .bind(claim.attempt)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Refresh the lease of a running claim
    pub async fn heartbeat_step(&self, claim: &Claim) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET heartbeat_at = ?
            WHERE step_id = ? AND worker_id = ? AND attempt = ? AND state = 'RUNNING'
            "#,
        )
        .bind(now_ms())
        .bind(&claim.step_id)
        .bind(&claim.worker_id)
        .bind(claim.attempt)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Return `RUNNING` steps with an expired heartbeat to `READY`
    ///
    /// The next claim bumps the attempt, so writes from the lost attempt are
    /// rejected as stale.
    pub async fn requeue_stale_steps(&self, lease_timeout: Duration) -> SchedulerResult<Vec<StepId>> {
        let now = now_ms();
        let cutoff = now - lease_timeout.as_millis() as i64;
        let rows = sqlx::query(
            r#"
            UPDATE step_executions
            SET state = 'READY', worker_id = NULL, heartbeat_at = NULL,
                ready_at = ?, modified_at = ?
            WHERE state = 'RUNNING' AND COALESCE(heartbeat_at, claimed_at, 0) < ?
            RETURNING step_id
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("step_id").map_err(SchedulerError::from))
            .collect()
    }

    /// Move every cancellable step of the run to `CANCELLED`
    ///
    /// Returns the ids actually changed; terminal steps are untouched.
    pub async fn set_run_steps_as_cancelled(&self, run_id: &str) -> SchedulerResult<HashSet<StepId>> {
        self.cancel_steps_in(run_id, "('CREATED', 'READY', 'RUNNING')", None).await
    }

    /// Cancel the unfinished `direction` steps while the run is still in `run_state`
    ///
    /// Nothing changes once the run moved on, so a late caller cannot touch
    /// the steps of a rollback that already started.
    pub async fn set_live_run_steps_as_cancelled(
        &self,
        run_id: &str,
        direction: Direction,
        run_state: RunState,
    ) -> SchedulerResult<HashSet<StepId>> {
        self.cancel_steps_in(
            run_id,
            "('CREATED', 'READY', 'RUNNING')",
            Some((direction, run_state)),
        )
        .await
    }

    /// Like `set_live_run_steps_as_cancelled` but leaves `RUNNING` steps to finish
    pub async fn set_run_pending_steps_as_cancelled(
        &self,
        run_id: &str,
        direction: Direction,
        run_state: RunState,
    ) -> SchedulerResult<HashSet<StepId>> {
        self.cancel_steps_in(run_id, "('CREATED', 'READY')", Some((direction, run_state)))
            .await
    }

    async fn cancel_steps_in(
        &self,
        run_id: &str,
        states_sql: &str,
        guard: Option<(Direction, RunState)>,
    ) -> SchedulerResult<HashSet<StepId>> {
        let guard_sql = match guard {
            Some(_) => {
                r#"
              AND is_reverting = ?
              AND EXISTS (SELECT 1 FROM runs r WHERE r.run_id = step_executions.run_id AND r.state = ?)"#
            }
            None => "",
        };
        let now = now_ms();
        let sql = format!(
            r#"
            UPDATE step_executions
            SET state = 'CANCELLED', finished_at = ?, modified_at = ?
            WHERE run_id = ? AND state IN {states_sql}{guard_sql}
            RETURNING step_id
            "#
        );
        let mut query = sqlx::query(&sql).bind(now).bind(now).bind(run_id);
        if let Some((direction, run_state)) = guard {
            query = query.bind(direction.is_reverting()).bind(run_state.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| row.try_get("step_id").map_err(SchedulerError::from))
            .collect()
    }

    /// Declared step set of the run as `(step_type, is_reverting)` pairs
    pub async fn get_all_run_tracked_steps(
        &self,
        run_id: &str,
    ) -> SchedulerResult<HashSet<(String, bool)>> {
        let rows = sqlx::query("SELECT step_type, is_reverting FROM step_executions WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        let mut tracked = HashSet::new();
        for row in rows {
            tracked.insert((row.try_get("step_type")?, row.try_get("is_reverting")?));
        }
        Ok(tracked)
    }

    pub async fn get_all_run_tracked_steps_states(
        &self,
        run_id: &str,
    ) -> SchedulerResult<HashMap<(String, bool), StepExecution>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM step_executions WHERE run_id = ?");
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;

        let mut states = HashMap::new();
        for row in rows {
            let step = step_from_row(&row)?;
            states.insert((step.step_type.clone(), step.is_reverting), step);
        }
        Ok(states)
    }

    /// Whether any step of the run waits for an operator or was abandoned
    pub async fn run_has_problems(&self, run_id: &str) -> SchedulerResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM step_executions
                WHERE run_id = ? AND state IN ('WAITING_MANUAL', 'ABANDONED')
            ) AS has_problems
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("has_problems")?)
    }

    pub async fn get_step(&self, step_id: &str) -> SchedulerResult<StepExecution> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM step_executions WHERE step_id = ?");
        let row = sqlx::query(&sql)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => step_from_row(&row),
            None => Err(SchedulerError::StepNotFound(step_id.to_string())),
        }
    }

    /// Send a `FAILED` step back to `CREATED` for another attempt
    ///
    /// The failed attempt is appended to `step_fail_history`.
    pub async fn retry_failed_step(&self, step_id: &str) -> SchedulerResult<StepExecution> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let history = sqlx::query(
            r#"
            INSERT INTO step_fail_history (step_id, attempt, state, message, finished_at)
            SELECT step_id, attempt, state, error_traceback, finished_at
            FROM step_executions
            WHERE step_id = ? AND state = 'FAILED'
            "#,
        )
        .bind(step_id)
        .execute(&mut *tx)
        .await?;

        if history.rows_affected() == 0 {
            tx.rollback().await?;
            // distinguish a missing step from one in the wrong state
            self.get_step(step_id).await?;
            return Err(SchedulerError::StepNotInFailed(step_id.to_string()));
        }

        sqlx::query(
            r#"
            UPDATE step_executions
            SET state = 'CREATED', attempt = attempt + 1,
                available_attempts = MAX(available_attempts - 1, 0),
                worker_id = NULL, claimed_at = NULL, heartbeat_at = NULL, ready_at = NULL,
                finished_at = NULL, deferred_task_uid = NULL, error_traceback = NULL,
                modified_at = ?
            WHERE step_id = ?
            "#,
        )
        .bind(now)
        .bind(step_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!("🔁 Step {} sent back for retry", step_id);
        self.get_step(step_id).await
    }

    /// Apply an operator decision to a `WAITING_MANUAL` step
    ///
    /// `RETRY` makes the step claimable again, `SKIP` marks it `SKIPPED` which
    /// satisfies its dependants. Returns false when the step is not waiting.
    pub async fn apply_manual_action(
        &self,
        run_id: &str,
        step_type: &str,
        is_reverting: bool,
        action: &ManualAction,
    ) -> SchedulerResult<bool> {
        let row = sqlx::query(
            "SELECT step_id FROM step_executions WHERE run_id = ? AND step_type = ? AND is_reverting = ?",
        )
        .bind(run_id)
        .bind(step_type)
        .bind(is_reverting)
        .fetch_optional(&self.pool)
        .await?;

        let step_id: StepId = match row {
            Some(row) => row.try_get("step_id")?,
            None => {
                return Err(SchedulerError::StepNotFound(format!(
                    "{run_id}/{step_type}/{is_reverting}"
                )))
            }
        };
        self.apply_manual_action_to(&step_id, action).await
    }

    pub async fn manual_retry_step(&self, step_id: &str, reason: &str) -> SchedulerResult<bool> {
        let action = ManualAction {
            action: ManualActionKind::Retry,
            performed_by: OPERATOR.to_string(),
            reason: reason.to_string(),
        };
        self.apply_manual_action_to(step_id, &action).await
    }

    pub async fn manual_skip_step(&self, step_id: &str, reason: &str) -> SchedulerResult<bool> {
        let action = ManualAction {
            action: ManualActionKind::Skip,
            performed_by: OPERATOR.to_string(),
            reason: reason.to_string(),
        };
        self.apply_manual_action_to(step_id, &action).await
    }

    async fn apply_manual_action_to(
        &self,
        step_id: &str,
        action: &ManualAction,
    ) -> SchedulerResult<bool> {
        let target = match action.action {
            ManualActionKind::Retry => StepState::Ready,
            ManualActionKind::Skip => StepState::Skipped,
        };
        let now = now_ms();

        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET state = ?,
                error_traceback = CASE WHEN ? = 'READY' THEN NULL ELSE error_traceback END,
                requires_manual_intervention = 0, worker_id = NULL, heartbeat_at = NULL,
                ready_at = ?, manual_action = ?, manual_action_by = ?, manual_action_reason = ?,
                manual_action_at = ?, modified_at = ?
            WHERE step_id = ? AND state = 'WAITING_MANUAL'
            "#,
        )
        .bind(target.as_str())
        .bind(target.as_str())
        .bind(now)
        .bind(action.action.as_str())
        .bind(&action.performed_by)
        .bind(&action.reason)
        .bind(now)
        .bind(now)
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get_step(step_id).await?;
            return Ok(false);
        }

        tracing::info!(
            "🙋 {} applied {} to step {}: {}",
            action.performed_by,
            action.action,
            step_id,
            action.reason
        );
        Ok(true)
    }
}

async fn insert_steps_with(
    conn: &mut SqliteConnection,
    run_id: &str,
    direction: Direction,
    template: &DagTemplate,
) -> SchedulerResult<()> {
    let now = now_ms();
    for step_type in &template.nodes {
        sqlx::query(
            r#"
            INSERT INTO step_executions
                (step_id, run_id, operation_name, step_type, is_reverting, state,
                 available_attempts, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, 'CREATED', ?, ?, ?)
            ON CONFLICT (run_id, step_type, is_reverting) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(run_id)
        .bind(&template.workflow_id)
        .bind(step_type)
        .bind(direction.is_reverting())
        .bind(DEFAULT_AVAILABLE_ATTEMPTS)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    tracing::debug!(
        "🧩 Materialised {} steps for run {} ({:?})",
        template.nodes.len(),
        run_id,
        direction
    );
    Ok(())
}

async fn insert_deps_with(
    conn: &mut SqliteConnection,
    run_id: &str,
    direction: Direction,
    template: &DagTemplate,
) -> SchedulerResult<()> {
    for (depends_on, step_type) in &template.edges {
        sqlx::query(
            r#"
            INSERT INTO step_deps (run_id, step_id, depends_on_step_id)
            SELECT s.run_id, s.step_id, d.step_id
            FROM step_executions s
            JOIN step_executions d
              ON d.run_id = s.run_id AND d.is_reverting = s.is_reverting
            WHERE s.run_id = ? AND s.is_reverting = ? AND s.step_type = ? AND d.step_type = ?
            ON CONFLICT (step_id, depends_on_step_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(direction.is_reverting())
        .bind(step_type)
        .bind(depends_on)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn promote_ready_steps_with(conn: &mut SqliteConnection, run_id: &str) -> SchedulerResult<u64> {
    let now = now_ms();
    let sql = format!(
        r#"
        UPDATE step_executions
        SET state = 'READY', ready_at = ?, modified_at = ?
        WHERE run_id = ? AND state = 'CREATED'
          AND NOT EXISTS (
            SELECT 1 FROM step_deps d
            JOIN step_executions p ON p.step_id = d.depends_on_step_id
            WHERE d.step_id = step_executions.step_id
              AND p.state NOT IN {SATISFIED_STATES_SQL}
          )
        "#
    );
    let result = sqlx::query(&sql)
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn step_from_row(row: &SqliteRow) -> SchedulerResult<StepExecution> {
    let state: String = row.try_get("state")?;
    let claimed_at: Option<i64> = row.try_get("claimed_at")?;
    let payload: Option<String> = row.try_get("payload")?;

    Ok(StepExecution {
        step_id: row.try_get("step_id")?,
        run_id: row.try_get("run_id")?,
        operation_name: row.try_get("operation_name")?,
        step_type: row.try_get("step_type")?,
        is_reverting: row.try_get("is_reverting")?,
        state: StepState::parse(&state)?,
        attempt: row.try_get("attempt")?,
        available_attempts: row.try_get("available_attempts")?,
        worker_id: row.try_get("worker_id")?,
        claimed_at: claimed_at.map(ms_to_dt),
        deferred_task_uid: row.try_get("deferred_task_uid")?,
        payload: payload.map(|text| serde_json::from_str(&text)).transpose()?,
        error_traceback: row.try_get("error_traceback")?,
        requires_manual_intervention: row.try_get("requires_manual_intervention")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::database::memory_pool;
    use serde_json::json;
    use std::collections::BTreeSet;

    async fn repo() -> Repository {
        Repository::new(memory_pool().await)
    }

    fn template(nodes: &[&str], edges: &[(&str, &str)]) -> DagTemplate {
        DagTemplate::new(
            "wf",
            nodes.iter().map(|node| node.to_string()).collect(),
            edges
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect::<BTreeSet<_>>(),
        )
    }

    async fn materialise(repo: &Repository, run_id: &str, direction: Direction, tpl: &DagTemplate) {
        repo.insert_steps(run_id, direction, tpl).await.unwrap();
        repo.insert_deps(run_id, direction, tpl).await.unwrap();
        repo.promote_ready_steps(run_id).await.unwrap();
    }

    #[tokio::test]
    async fn create_step_rejects_duplicate_triple() {
        let repo = repo().await;
        let step = repo.create_step("r1", "start", "pull", false).await.unwrap();
        assert_eq!(step.state, StepState::Created);
        assert_eq!(step.attempt, 0);

        let err = repo.create_step("r1", "start", "pull", false).await.unwrap_err();
        assert!(matches!(err, SchedulerError::StepAlreadyExists { .. }));

        // the reverting instance is a different step
        repo.create_step("r1", "start", "pull", true).await.unwrap();
    }

    #[tokio::test]
    async fn template_roundtrip_in_both_directions() {
        let repo = repo().await;
        let tpl = template(&["s1"], &[]);

        repo.insert_steps("run-do", Direction::Do, &tpl).await.unwrap();
        repo.insert_deps("run-do", Direction::Do, &tpl).await.unwrap();
        let expected: HashSet<_> = [("s1".to_string(), false)].into_iter().collect();
        assert_eq!(repo.get_all_run_tracked_steps("run-do").await.unwrap(), expected);

        repo.insert_steps("run-undo", Direction::Undo, &tpl).await.unwrap();
        repo.insert_deps("run-undo", Direction::Undo, &tpl).await.unwrap();
        let expected: HashSet<_> = [("s1".to_string(), true)].into_iter().collect();
        assert_eq!(repo.get_all_run_tracked_steps("run-undo").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn dependencies_gate_promotion_and_claim() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a", "b"], &[("a", "b")])).await;

        let claim = repo.claim_one_step("w1").await.unwrap().unwrap();
        assert_eq!(claim.step_type, "a");
        assert_eq!(claim.attempt, 1);
        assert!(repo.claim_one_step("w2").await.unwrap().is_none());

        assert!(repo.mark_step_succeeded(&claim, Some(&json!({"port": 8080}))).await.unwrap());
        assert_eq!(repo.promote_ready_steps("r1").await.unwrap(), 1);

        let next = repo.claim_one_step("w2").await.unwrap().unwrap();
        assert_eq!(next.step_type, "b");
        assert_eq!(next.worker_id, "w2");

        let states = repo.get_all_run_tracked_steps_states("r1").await.unwrap();
        let a = &states[&("a".to_string(), false)];
        assert_eq!(a.state, StepState::Success);
        assert_eq!(a.payload, Some(json!({"port": 8080})));
        assert_eq!(a.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn terminal_marks_are_idempotent_and_reject_stale_claims() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a"], &[])).await;
        let claim = repo.claim_one_step("w1").await.unwrap().unwrap();

        assert!(repo.mark_step_waiting_manual(&claim, "needs a human").await.unwrap());
        assert!(!repo.mark_step_waiting_manual(&claim, "needs a human").await.unwrap());

        let err = repo.mark_step_succeeded(&claim, None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::StaleClaim { attempt: 1, .. }));

        let mut foreign = claim.clone();
        foreign.worker_id = "w2".to_string();
        assert!(repo.mark_step_abandoned(&foreign, "boom").await.is_err());

        let step = repo.get_step(&claim.step_id).await.unwrap();
        assert_eq!(step.state, StepState::WaitingManual);
        assert!(step.requires_manual_intervention);
        assert!(repo.run_has_problems("r1").await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_step_is_not_resurrected_by_late_completion() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a", "b"], &[("a", "b")])).await;
        let claim = repo.claim_one_step("w1").await.unwrap().unwrap();

        let cancelled = repo.set_run_steps_as_cancelled("r1").await.unwrap();
        assert_eq!(cancelled.len(), 2);

        assert!(repo.mark_step_succeeded(&claim, None).await.is_err());
        assert!(!repo.mark_step_cancelled(&claim).await.unwrap());
        assert_eq!(repo.get_step(&claim.step_id).await.unwrap().state, StepState::Cancelled);

        assert!(repo.set_run_steps_as_cancelled("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_leaves_terminal_steps_alone() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a", "b"], &[])).await;
        let first = repo.claim_one_step("w1").await.unwrap().unwrap();
        repo.mark_step_failed(&first, "trace").await.unwrap();

        let cancelled = repo.set_run_steps_as_cancelled("r1").await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert!(!cancelled.contains(&first.step_id));
        assert_eq!(repo.get_step(&first.step_id).await.unwrap().state, StepState::Failed);
    }

    #[tokio::test]
    async fn stale_running_steps_are_requeued_with_new_attempt() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a"], &[])).await;
        let lost = repo.claim_one_step("w1").await.unwrap().unwrap();

        assert!(repo.requeue_stale_steps(Duration::from_secs(60)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let requeued = repo.requeue_stale_steps(Duration::from_millis(1)).await.unwrap();
        assert_eq!(requeued, vec![lost.step_id.clone()]);

        let reclaimed = repo.claim_one_step("w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt, 2);
        assert!(!repo.heartbeat_step(&lost).await.unwrap());
        assert!(repo.heartbeat_step(&reclaimed).await.unwrap());
        assert!(repo.mark_step_failed(&lost, "late").await.is_err());
    }

    #[tokio::test]
    async fn requeue_after_delays_the_next_claim() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["poll"], &[])).await;
        let claim = repo.claim_one_step("w1").await.unwrap().unwrap();

        assert!(repo
            .requeue_step_after(&claim, None, Duration::from_secs(3600))
            .await
            .unwrap());
        assert!(repo.claim_one_step("w1").await.unwrap().is_none());
        assert_eq!(repo.get_step(&claim.step_id).await.unwrap().state, StepState::Ready);
    }

    #[tokio::test]
    async fn retry_failed_step_records_history() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a"], &[])).await;
        let claim = repo.claim_one_step("w1").await.unwrap().unwrap();

        let err = repo.retry_failed_step(&claim.step_id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::StepNotInFailed(_)));

        repo.mark_step_failed(&claim, "I failed").await.unwrap();
        let retried = repo.retry_failed_step(&claim.step_id).await.unwrap();
        assert_eq!(retried.state, StepState::Created);
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.available_attempts, DEFAULT_AVAILABLE_ATTEMPTS - 1);
        assert!(retried.error_traceback.is_none());

        let row = sqlx::query("SELECT COUNT(*) AS n, MAX(message) AS message FROM step_fail_history")
            .fetch_one(repo.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("n"), 1);
        assert_eq!(row.get::<String, _>("message"), "I failed");

        assert!(matches!(
            repo.retry_failed_step("missing").await,
            Err(SchedulerError::StepNotFound(_))
        ));
    }

    #[tokio::test]
    async fn manual_actions_only_apply_to_waiting_steps() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a", "b"], &[("a", "b")])).await;
        let claim = repo.claim_one_step("w1").await.unwrap().unwrap();

        assert!(!repo.manual_skip_step(&claim.step_id, "not yet").await.unwrap());

        repo.mark_step_waiting_manual(&claim, "disk full").await.unwrap();
        let action = ManualAction {
            action: ManualActionKind::Skip,
            performed_by: "alice".to_string(),
            reason: "cleaned up by hand".to_string(),
        };
        assert!(repo.apply_manual_action("r1", "a", false, &action).await.unwrap());
        assert!(!repo.run_has_problems("r1").await.unwrap());

        // a skipped step satisfies its dependants
        repo.promote_ready_steps("r1").await.unwrap();
        let next = repo.claim_one_step("w1").await.unwrap().unwrap();
        assert_eq!(next.step_type, "b");

        repo.mark_step_waiting_manual(&next, "flaky").await.unwrap();
        assert!(repo.manual_retry_step(&next.step_id, "try again").await.unwrap());
        let again = repo.claim_one_step("w1").await.unwrap().unwrap();
        assert_eq!(again.step_id, next.step_id);
        assert_eq!(again.attempt, next.attempt + 1);
    }

    #[tokio::test]
    async fn record_deferred_task_is_scoped_to_the_attempt() {
        let repo = repo().await;
        materialise(&repo, "r1", Direction::Do, &template(&["a"], &[])).await;
        let claim = repo.claim_one_step("w1").await.unwrap().unwrap();

        assert!(repo.record_deferred_task(&claim, "task-1").await.unwrap());
        let mut older = claim.clone();
        older.attempt -= 1;
        assert!(!repo.record_deferred_task(&older, "task-0").await.unwrap());

        let step = repo.get_step(&claim.step_id).await.unwrap();
        assert_eq!(step.deferred_task_uid.as_deref(), Some("task-1"));
        assert!(step.claimed_at.is_some());
    }
}
