/// Durable repository of nodes, runs and step executions
///
/// SQLite is the single source of truth for run and step state:
/// - `database`: pool bootstrap and schema
/// - `steps`: step materialisation, the claim protocol and step transitions
/// - `nodes`: node intent, run creation and run finalisation

use crate::error::SchedulerResult;
use sqlx::{sqlite::SqlitePool, Sqlite, Transaction};

pub mod database;
pub mod models;
pub mod nodes;
pub mod steps;

pub use models::{
    Claim, DesiredState, Direction, ManualAction, ManualActionKind, Node, Run, RunId, RunKind,
    RunState, StepExecution, StepId, StepState,
};

/// Repository handle shared by workers, the runner and the lifecycle
///
/// Cheap to clone; every clone shares the same connection pool.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction for the node-scoped operations
    pub async fn begin(&self) -> SchedulerResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

/// SQL list of the states that satisfy a dependency
pub(crate) const SATISFIED_STATES_SQL: &str = "('SUCCESS', 'SKIPPED')";
