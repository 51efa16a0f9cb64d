/// Error taxonomy for the orchestrator
///
/// Registry and inconsistency errors are fatal to the calling operation.
/// `KeyNotFoundInHash` is the only transient condition: the ephemeral store was
/// read before a concurrent writer populated it, and callers retry with backoff.

use crate::repository::models::{RunId, StepId};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("operation '{0}' is already registered")]
    OperationAlreadyRegistered(String),

    #[error("operation '{name}' not found, registered operations: {registered:?}")]
    OperationNotFound {
        name: String,
        registered: Vec<String>,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("step group index {index} out of range for operation '{operation}' ({len} groups)")]
    StepGroupOutOfRange {
        operation: String,
        index: usize,
        len: usize,
    },

    #[error("step '{step}' not found in operation '{operation}'")]
    StepNotFoundInOperation { operation: String, step: String },

    #[error("invalid DAG template '{workflow_id}': {reason}")]
    InvalidTemplate { workflow_id: String, reason: String },

    #[error("step '{step_type}' (reverting={is_reverting}) already exists for run {run_id}")]
    StepAlreadyExists {
        run_id: RunId,
        step_type: String,
        is_reverting: bool,
    },

    #[error("step {0} not found")]
    StepNotFound(StepId),

    #[error("step {0} is not in FAILED state")]
    StepNotInFailed(StepId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{node_id}' already has active run {active_run_id}")]
    ActiveRunConflict {
        node_id: String,
        active_run_id: RunId,
    },

    #[error("claim on step {step_id} (attempt {attempt}) no longer owns the step")]
    StaleClaim { step_id: StepId, attempt: i64 },

    #[error("key '{key}' has no field '{field}'")]
    KeyNotFoundInHash { key: String, field: String },

    #[error("unknown {kind} value '{value}'")]
    UnknownEnumValue { kind: &'static str, value: String },

    #[error("task dispatch failed: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Whether the caller should retry the read instead of giving up
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::KeyNotFoundInHash { .. })
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
