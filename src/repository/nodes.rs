/// Nodes and runs: desired intent, the single active run and finalisation
///
/// Functions taking a `&mut SqliteConnection` run inside the caller's
/// transaction. `lock_node` must be its first statement: it writes the node
/// row, which takes SQLite's write lock until the transaction ends and so
/// serialises every intent change and run creation for the node.

use crate::error::{SchedulerError, SchedulerResult};
use crate::repository::models::{
    now_ms, DesiredState, Node, Run, RunId, RunKind, RunState,
};
use crate::repository::{Repository, SATISFIED_STATES_SQL};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use uuid::Uuid;

const NODE_COLUMNS: &str =
    "node_id, operation_name, desired_state, desired_spec, generation, active_run_id";

const RUN_COLUMNS: &str =
    "run_id, node_id, operation_name, generation, kind, state, cancel_requested_at";

impl Repository {
    /// Lock the node row for the enclosing transaction, creating it if needed
    ///
    /// New nodes start `ABSENT` at generation 0.
    pub async fn lock_node(&self, node_id: &str, tx: &mut SqliteConnection) -> SchedulerResult<Node> {
        let now = now_ms();
        let sql = format!(
            r#"
            INSERT INTO nodes (node_id, desired_state, desired_spec, generation, created_at, modified_at)
            VALUES (?, 'ABSENT', 'null', 0, ?, ?)
            ON CONFLICT (node_id) DO UPDATE SET modified_at = excluded.modified_at
            RETURNING {NODE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(node_id)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        node_from_row(&row)
    }

    /// Record new intent and return the bumped generation
    pub async fn set_node_desired(
        &self,
        node_id: &str,
        desired_state: DesiredState,
        desired_spec: &Value,
        tx: &mut SqliteConnection,
    ) -> SchedulerResult<i64> {
        let row = sqlx::query(
            r#"
            UPDATE nodes
            SET desired_state = ?, desired_spec = ?, generation = generation + 1, modified_at = ?
            WHERE node_id = ?
            RETURNING generation
            "#,
        )
        .bind(desired_state.as_str())
        .bind(serde_json::to_string(desired_spec)?)
        .bind(now_ms())
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                let generation: i64 = row.try_get("generation")?;
                tracing::info!(
                    "🎯 Node {} desired {} (generation {})",
                    node_id,
                    desired_state,
                    generation
                );
                Ok(generation)
            }
            None => Err(SchedulerError::NodeNotFound(node_id.to_string())),
        }
    }

    /// Bind the node to the operation its runs execute
    pub async fn set_node_operation(
        &self,
        node_id: &str,
        operation_name: &str,
        tx: &mut SqliteConnection,
    ) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE nodes SET operation_name = ?, modified_at = ? WHERE node_id = ?")
            .bind(operation_name)
            .bind(now_ms())
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::NodeNotFound(node_id.to_string()));
        }
        Ok(())
    }

    /// Create a `RUNNING` run of the node's operation under `generation`
    pub async fn create_run(
        &self,
        node_id: &str,
        generation: i64,
        kind: RunKind,
        tx: &mut SqliteConnection,
    ) -> SchedulerResult<RunId> {
        let run_id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO runs (run_id, node_id, operation_name, generation, kind, state, created_at)
            SELECT ?, node_id, operation_name, ?, ?, 'RUNNING', ?
            FROM nodes WHERE node_id = ?
            "#,
        )
        .bind(&run_id)
        .bind(generation)
        .bind(kind.as_str())
        .bind(now_ms())
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::NodeNotFound(node_id.to_string()));
        }
        tracing::info!("🚀 Created {} run {} for node {} (generation {})", kind, run_id, node_id, generation);
        Ok(run_id)
    }

    /// Point the node at `run_id`
    ///
    /// Fails with `ActiveRunConflict` when another run is active; setting the
    /// same run twice is a no-op.
    pub async fn set_active_run(
        &self,
        node_id: &str,
        run_id: &str,
        tx: &mut SqliteConnection,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE nodes SET active_run_id = ?, modified_at = ?
            WHERE node_id = ? AND (active_run_id IS NULL OR active_run_id = ?)
            "#,
        )
        .bind(run_id)
        .bind(now_ms())
        .bind(node_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let row = sqlx::query("SELECT active_run_id FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&mut *tx)
            .await?;
        match row {
            Some(row) => Err(SchedulerError::ActiveRunConflict {
                node_id: node_id.to_string(),
                active_run_id: row.try_get::<Option<String>, _>("active_run_id")?.unwrap_or_default(),
            }),
            None => Err(SchedulerError::NodeNotFound(node_id.to_string())),
        }
    }

    /// Clear the node's active run if it is still `run_id`
    pub async fn clear_active_run(
        &self,
        node_id: &str,
        run_id: &str,
        tx: &mut SqliteConnection,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET active_run_id = NULL, modified_at = ? WHERE node_id = ? AND active_run_id = ?",
        )
        .bind(now_ms())
        .bind(node_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_node(&self, node_id: &str) -> SchedulerResult<Node> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = ?");
        let row = sqlx::query(&sql)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => node_from_row(&row),
            None => Err(SchedulerError::NodeNotFound(node_id.to_string())),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> SchedulerResult<Run> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(SchedulerError::RunNotFound(run_id.to_string())),
        }
    }

    /// Flag a running run for cancellation; false when it is not `RUNNING`
    pub async fn mark_run_cancel_requested(&self, run_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET cancel_requested_at = COALESCE(cancel_requested_at, ?)
            WHERE run_id = ? AND state = 'RUNNING'
            "#,
        )
        .bind(now_ms())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get_run(run_id).await?;
            return Ok(false);
        }
        tracing::info!("🛑 Cancellation requested for run {}", run_id);
        Ok(true)
    }

    /// Mark the run `SUCCEEDED` once every step of its direction is satisfied
    ///
    /// A single compare-and-swap on `state = 'RUNNING'`: returns true exactly
    /// once per run, then clears the node's active run in the same
    /// transaction. Safe to call repeatedly and concurrently.
    pub async fn try_finalize_run(&self, run_id: &str) -> SchedulerResult<bool> {
        self.finalize(run_id, RunState::Running, RunState::Succeeded).await
    }

    /// `REVERTING -> REVERTED` once every undo step is satisfied
    pub async fn try_finalize_rollback(&self, run_id: &str) -> SchedulerResult<bool> {
        self.finalize(run_id, RunState::Reverting, RunState::Reverted).await
    }

    async fn finalize(&self, run_id: &str, from: RunState, to: RunState) -> SchedulerResult<bool> {
        // while rolling back, completion is decided by the undo steps
        let reverting_sql = match from {
            RunState::Reverting => "1",
            _ => "CASE runs.kind WHEN 'REVERT' THEN 1 ELSE 0 END",
        };
        let sql = format!(
            r#"
            UPDATE runs SET state = ?, finished_at = ?
            WHERE run_id = ? AND state = ?
              AND NOT EXISTS (
                SELECT 1 FROM step_executions s
                WHERE s.run_id = runs.run_id
                  AND s.is_reverting = {reverting_sql}
                  AND s.state NOT IN {SATISFIED_STATES_SQL}
              )
            RETURNING node_id
            "#
        );

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(now_ms())
            .bind(run_id)
            .bind(from.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let node_id: String = row.try_get("node_id")?;
        self.clear_active_run(&node_id, run_id, &mut tx).await?;
        tx.commit().await?;

        tracing::info!("🏁 Run {} {} (node {})", run_id, to, node_id);
        Ok(true)
    }

    /// `RUNNING -> REVERTING` for apply runs
    pub async fn begin_run_rollback(&self, run_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE runs SET state = 'REVERTING' WHERE run_id = ? AND state = 'RUNNING' AND kind = 'APPLY'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::warn!("↩️ Rolling back run {}", run_id);
        }
        Ok(result.rows_affected() == 1)
    }

    /// Give up on an unfinished run and release its node
    pub async fn mark_run_failed(&self, run_id: &str) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE runs SET state = 'FAILED', finished_at = ?
            WHERE run_id = ? AND state IN ('RUNNING', 'REVERTING')
            RETURNING node_id
            "#,
        )
        .bind(now_ms())
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let node_id: String = row.try_get("node_id")?;
        self.clear_active_run(&node_id, run_id, &mut tx).await?;
        tx.commit().await?;

        tracing::error!("❌ Run {} failed (node {})", run_id, node_id);
        Ok(true)
    }

    /// Whether the node's intent moved past the generation the run was created under
    pub async fn is_run_stale(&self, run_id: &str) -> SchedulerResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT r.generation < n.generation AS stale
            FROM runs r JOIN nodes n ON n.node_id = r.node_id
            WHERE r.run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("stale")?),
            None => Err(SchedulerError::RunNotFound(run_id.to_string())),
        }
    }
}

fn node_from_row(row: &SqliteRow) -> SchedulerResult<Node> {
    let desired_state: String = row.try_get("desired_state")?;
    let desired_spec: String = row.try_get("desired_spec")?;

    Ok(Node {
        node_id: row.try_get("node_id")?,
        operation_name: row.try_get("operation_name")?,
        desired_state: DesiredState::parse(&desired_state)?,
        desired_spec: serde_json::from_str(&desired_spec)?,
        generation: row.try_get("generation")?,
        active_run_id: row.try_get("active_run_id")?,
    })
}

fn run_from_row(row: &SqliteRow) -> SchedulerResult<Run> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let cancel_requested_at: Option<i64> = row.try_get("cancel_requested_at")?;

    Ok(Run {
        run_id: row.try_get("run_id")?,
        node_id: row.try_get("node_id")?,
        operation_name: row.try_get("operation_name")?,
        generation: row.try_get("generation")?,
        kind: RunKind::parse(&kind)?,
        state: RunState::parse(&state)?,
        cancel_requested: cancel_requested_at.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::template::DagTemplate;
    use crate::repository::database::memory_pool;
    use crate::repository::models::{Direction, StepState};
    use serde_json::json;

    async fn repo() -> Repository {
        Repository::new(memory_pool().await)
    }

    /// Node with an active APPLY run over `a -> b`
    async fn node_with_run(repo: &Repository) -> RunId {
        let mut tx = repo.begin().await.unwrap();
        repo.lock_node("n1", &mut tx).await.unwrap();
        repo.set_node_operation("n1", "start", &mut tx).await.unwrap();
        let generation = repo
            .set_node_desired("n1", DesiredState::Present, &json!({"image": "sleeper"}), &mut tx)
            .await
            .unwrap();
        let run_id = repo.create_run("n1", generation, RunKind::Apply, &mut tx).await.unwrap();
        repo.set_active_run("n1", &run_id, &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let template = DagTemplate::new(
            "start",
            ["a".to_string(), "b".to_string()].into_iter().collect(),
            [("a".to_string(), "b".to_string())].into_iter().collect(),
        );
        repo.insert_steps(&run_id, Direction::Do, &template).await.unwrap();
        repo.insert_deps(&run_id, Direction::Do, &template).await.unwrap();
        repo.promote_ready_steps(&run_id).await.unwrap();
        run_id
    }

    #[tokio::test]
    async fn desired_changes_bump_generation() {
        let repo = repo().await;
        let mut tx = repo.begin().await.unwrap();
        let node = repo.lock_node("n1", &mut tx).await.unwrap();
        assert_eq!(node.generation, 0);
        assert_eq!(node.desired_state, DesiredState::Absent);

        let first = repo
            .set_node_desired("n1", DesiredState::Present, &json!({}), &mut tx)
            .await
            .unwrap();
        let second = repo
            .set_node_desired("n1", DesiredState::Absent, &json!({}), &mut tx)
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));

        assert!(matches!(
            repo.set_node_desired("ghost", DesiredState::Present, &json!({}), &mut tx).await,
            Err(SchedulerError::NodeNotFound(_))
        ));
        tx.commit().await.unwrap();

        assert_eq!(repo.get_node("n1").await.unwrap().desired_state, DesiredState::Absent);
    }

    #[tokio::test]
    async fn second_active_run_is_a_conflict() {
        let repo = repo().await;
        let first = node_with_run(&repo).await;

        let mut tx = repo.begin().await.unwrap();
        let node = repo.lock_node("n1", &mut tx).await.unwrap();
        assert_eq!(node.active_run_id.as_deref(), Some(first.as_str()));

        let second = repo.create_run("n1", node.generation, RunKind::Apply, &mut tx).await.unwrap();
        repo.set_active_run("n1", &first, &mut tx).await.unwrap();
        let err = repo.set_active_run("n1", &second, &mut tx).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ActiveRunConflict { ref active_run_id, .. } if *active_run_id == first));
        tx.commit().await.unwrap();

        let run = repo.get_run(&second).await.unwrap();
        assert_eq!(run.operation_name.as_deref(), Some("start"));
        assert_eq!(run.state, RunState::Running);
    }

    #[tokio::test]
    async fn finalize_waits_for_every_step_and_fires_once() {
        let repo = repo().await;
        let run_id = node_with_run(&repo).await;

        let first = repo.claim_one_step("w1").await.unwrap().unwrap();
        repo.mark_step_succeeded(&first, None).await.unwrap();
        repo.promote_ready_steps(&run_id).await.unwrap();
        assert!(!repo.try_finalize_run(&run_id).await.unwrap());

        let second = repo.claim_one_step("w1").await.unwrap().unwrap();
        repo.mark_step_succeeded(&second, None).await.unwrap();
        assert!(repo.try_finalize_run(&run_id).await.unwrap());
        assert!(!repo.try_finalize_run(&run_id).await.unwrap());

        assert_eq!(repo.get_run(&run_id).await.unwrap().state, RunState::Succeeded);
        assert!(repo.get_node("n1").await.unwrap().active_run_id.is_none());
    }

    #[tokio::test]
    async fn rollback_finalizes_on_undo_steps() {
        let repo = repo().await;
        let run_id = node_with_run(&repo).await;

        let first = repo.claim_one_step("w1").await.unwrap().unwrap();
        repo.mark_step_failed(&first, "boom").await.unwrap();
        repo.set_run_steps_as_cancelled(&run_id).await.unwrap();

        assert!(repo.begin_run_rollback(&run_id).await.unwrap());
        assert!(!repo.begin_run_rollback(&run_id).await.unwrap());
        assert!(!repo.try_finalize_run(&run_id).await.unwrap());

        let undo = DagTemplate::new("start", ["a".to_string()].into_iter().collect(), Default::default());
        repo.insert_steps(&run_id, Direction::Undo, &undo).await.unwrap();
        repo.promote_ready_steps(&run_id).await.unwrap();
        assert!(!repo.try_finalize_rollback(&run_id).await.unwrap());

        let undo_claim = repo.claim_one_step("w1").await.unwrap().unwrap();
        assert!(undo_claim.is_reverting);
        repo.mark_step_succeeded(&undo_claim, None).await.unwrap();
        assert!(repo.try_finalize_rollback(&run_id).await.unwrap());

        assert_eq!(repo.get_run(&run_id).await.unwrap().state, RunState::Reverted);
        assert!(repo.get_node("n1").await.unwrap().active_run_id.is_none());
    }

    #[tokio::test]
    async fn pending_cancellation_lets_running_steps_finish() {
        let repo = repo().await;
        let run_id = node_with_run(&repo).await;
        let running = repo.claim_one_step("w1").await.unwrap().unwrap();

        let cancelled = repo
            .set_run_pending_steps_as_cancelled(&run_id, Direction::Do, RunState::Running)
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert!(!cancelled.contains(&running.step_id));
        assert!(repo.mark_step_succeeded(&running, None).await.unwrap());
    }

    #[tokio::test]
    async fn late_cancellation_leaves_a_started_rollback_alone() {
        let repo = repo().await;
        let run_id = node_with_run(&repo).await;
        let first = repo.claim_one_step("w1").await.unwrap().unwrap();
        repo.mark_step_failed(&first, "boom").await.unwrap();
        repo.set_run_pending_steps_as_cancelled(&run_id, Direction::Do, RunState::Running)
            .await
            .unwrap();

        let undo = DagTemplate::new("start", ["a".to_string()].into_iter().collect(), Default::default());
        repo.insert_steps(&run_id, Direction::Undo, &undo).await.unwrap();
        assert!(repo.begin_run_rollback(&run_id).await.unwrap());

        // an advance that still believes the run is RUNNING changes nothing
        for direction in [Direction::Do, Direction::Undo] {
            assert!(repo
                .set_run_pending_steps_as_cancelled(&run_id, direction, RunState::Running)
                .await
                .unwrap()
                .is_empty());
            assert!(repo
                .set_live_run_steps_as_cancelled(&run_id, direction, RunState::Running)
                .await
                .unwrap()
                .is_empty());
        }
        // forward cancellation never reaches undo steps
        assert!(repo
            .set_run_pending_steps_as_cancelled(&run_id, Direction::Do, RunState::Reverting)
            .await
            .unwrap()
            .is_empty());

        let undo_steps = repo.get_all_run_tracked_steps_states(&run_id).await.unwrap();
        assert_eq!(undo_steps[&("a".to_string(), true)].state, StepState::Created);
        let cancelled = repo
            .set_run_pending_steps_as_cancelled(&run_id, Direction::Undo, RunState::Reverting)
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
    }

    #[tokio::test]
    async fn cancel_request_and_failure_release_the_node() {
        let repo = repo().await;
        let run_id = node_with_run(&repo).await;

        assert!(repo.mark_run_cancel_requested(&run_id).await.unwrap());
        assert!(repo.get_run(&run_id).await.unwrap().cancel_requested);

        assert!(repo.mark_run_failed(&run_id).await.unwrap());
        assert!(!repo.mark_run_failed(&run_id).await.unwrap());
        assert!(!repo.mark_run_cancel_requested(&run_id).await.unwrap());
        assert!(repo.get_node("n1").await.unwrap().active_run_id.is_none());

        assert!(matches!(
            repo.mark_run_cancel_requested("ghost").await,
            Err(SchedulerError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn runs_become_stale_when_intent_moves_on() {
        let repo = repo().await;
        let run_id = node_with_run(&repo).await;
        assert!(!repo.is_run_stale(&run_id).await.unwrap());

        let mut tx = repo.begin().await.unwrap();
        repo.lock_node("n1", &mut tx).await.unwrap();
        repo.set_node_desired("n1", DesiredState::Absent, &json!({}), &mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(repo.is_run_stale(&run_id).await.unwrap());
        assert!(matches!(repo.is_run_stale("ghost").await, Err(SchedulerError::RunNotFound(_))));
    }
}
