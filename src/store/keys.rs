/// Key layout of the ephemeral store
///
/// - schedule hash: `SCH:{run_id}`
/// - step hash: `SCH:{run_id}:STEPS:{operation}:{group}:{C|D}:{step}`

use crate::error::{SchedulerError, SchedulerResult};
use crate::store::EphemeralStore;
use serde_json::Value;
use std::sync::Arc;

pub fn schedule_key(run_id: &str) -> String {
    format!("SCH:{run_id}")
}

pub fn step_key(
    run_id: &str,
    operation_name: &str,
    step_group_name: &str,
    is_creating: bool,
    step_name: &str,
) -> String {
    let direction = if is_creating { "C" } else { "D" };
    format!("SCH:{run_id}:STEPS:{operation_name}:{step_group_name}:{direction}:{step_name}")
}

/// Typed access to the schedule-scoped hash of one run
#[derive(Clone)]
pub struct ScheduleDataProxy {
    store: Arc<dyn EphemeralStore>,
    key: String,
}

impl ScheduleDataProxy {
    pub fn new(store: Arc<dyn EphemeralStore>, run_id: &str) -> Self {
        Self {
            store,
            key: schedule_key(run_id),
        }
    }

    pub async fn set_progress(
        &self,
        operation_name: &str,
        group_index: usize,
        is_creating: bool,
    ) -> SchedulerResult<()> {
        self.store
            .hset(
                &self.key,
                vec![
                    ("operation_name".to_string(), Value::from(operation_name)),
                    ("group_index".to_string(), Value::from(group_index)),
                    ("is_creating".to_string(), Value::from(is_creating)),
                ],
            )
            .await
    }

    pub async fn set_error(&self, error_type: &str, error_message: &str) -> SchedulerResult<()> {
        self.store
            .hset(
                &self.key,
                vec![
                    ("error_type".to_string(), Value::from(error_type)),
                    ("error_message".to_string(), Value::from(error_message)),
                ],
            )
            .await
    }

    pub async fn operation_name(&self) -> SchedulerResult<String> {
        let value = self.store.hget(&self.key, "operation_name").await?;
        as_string(&self.key, "operation_name", value)
    }

    pub async fn group_index(&self) -> SchedulerResult<usize> {
        let value = self.store.hget(&self.key, "group_index").await?;
        value
            .as_u64()
            .map(|index| index as usize)
            .ok_or_else(|| missing(&self.key, "group_index"))
    }

    pub async fn is_creating(&self) -> SchedulerResult<bool> {
        let value = self.store.hget(&self.key, "is_creating").await?;
        value.as_bool().ok_or_else(|| missing(&self.key, "is_creating"))
    }

    pub async fn error_message(&self) -> SchedulerResult<String> {
        let value = self.store.hget(&self.key, "error_message").await?;
        as_string(&self.key, "error_message", value)
    }

    pub async fn remove(&self) -> SchedulerResult<()> {
        self.store.delete(&self.key).await
    }
}

/// Typed access to the hash of one step execution
#[derive(Clone)]
pub struct StepStoreProxy {
    store: Arc<dyn EphemeralStore>,
    key: String,
}

impl StepStoreProxy {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        run_id: &str,
        operation_name: &str,
        step_group_name: &str,
        is_creating: bool,
        step_name: &str,
    ) -> Self {
        Self {
            store,
            key: step_key(run_id, operation_name, step_group_name, is_creating, step_name),
        }
    }

    pub async fn set_deferred_task(&self, task_uid: &str) -> SchedulerResult<()> {
        self.store
            .hset(
                &self.key,
                vec![("deferred_task_uid".to_string(), Value::from(task_uid))],
            )
            .await
    }

    pub async fn set_outcome(
        &self,
        status: &str,
        error_traceback: Option<&str>,
        requires_manual_intervention: bool,
    ) -> SchedulerResult<()> {
        let mut fields = vec![
            ("status".to_string(), Value::from(status)),
            (
                "requires_manual_intervention".to_string(),
                Value::from(requires_manual_intervention),
            ),
        ];
        if let Some(traceback) = error_traceback {
            fields.push(("error_traceback".to_string(), Value::from(traceback)));
        }
        self.store.hset(&self.key, fields).await
    }

    pub async fn deferred_task_uid(&self) -> SchedulerResult<String> {
        let value = self.store.hget(&self.key, "deferred_task_uid").await?;
        as_string(&self.key, "deferred_task_uid", value)
    }

    pub async fn status(&self) -> SchedulerResult<String> {
        let value = self.store.hget(&self.key, "status").await?;
        as_string(&self.key, "status", value)
    }

    pub async fn remove(&self) -> SchedulerResult<()> {
        self.store.delete(&self.key).await
    }
}

fn as_string(key: &str, field: &str, value: Value) -> SchedulerResult<String> {
    match value {
        Value::String(text) => Ok(text),
        _ => Err(missing(key, field)),
    }
}

fn missing(key: &str, field: &str) -> SchedulerError {
    SchedulerError::KeyNotFoundInHash {
        key: key.to_string(),
        field: field.to_string(),
    }
}
