/// Operation registry backed by ArcSwap
///
/// Operations are registered once at bootstrap (or test setup) and read
/// concurrently by every worker. Reads are lock-free snapshot loads; writes
/// clone the map and swap the pointer, so they never block an executing step.

use crate::error::{SchedulerError, SchedulerResult};
use crate::operation::group::{GroupKind, StepGroup, MIN_PARALLEL_STEPS};
use crate::operation::step::{FailurePolicy, Step};
use arc_swap::ArcSwap;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// A named workflow: ordered step groups applied to converge a node
#[derive(Debug, Clone)]
pub struct Operation {
    pub step_groups: Vec<StepGroup>,
    /// When false, cancel requests against runs of this operation are ignored
    pub is_cancellable: bool,
}

impl Operation {
    pub fn new(step_groups: Vec<StepGroup>) -> Self {
        Self {
            step_groups,
            is_cancellable: true,
        }
    }

    pub fn not_cancellable(mut self) -> Self {
        self.is_cancellable = false;
        self
    }

    pub fn len(&self) -> usize {
        self.step_groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_groups.is_empty()
    }
}

/// Registered operation plus a step lookup table built at registration
#[derive(Debug)]
struct RegisteredOperation {
    operation: Operation,
    /// step reference -> group index
    step_index: HashMap<String, usize>,
}

/// Process-wide operation registry, owned by the composition root
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: ArcSwap<HashMap<String, Arc<RegisteredOperation>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store an operation under `name`
    pub fn register(&self, name: &str, operation: Operation) -> SchedulerResult<()> {
        let step_index = validate_operation(&operation)?;

        let current = self.operations.load();
        if current.contains_key(name) {
            return Err(SchedulerError::OperationAlreadyRegistered(name.to_string()));
        }

        let mut updated = (**current).clone();
        updated.insert(
            name.to_string(),
            Arc::new(RegisteredOperation {
                operation,
                step_index,
            }),
        );
        self.operations.store(Arc::new(updated));

        tracing::info!("📋 Registered operation '{}'", name);
        Ok(())
    }

    /// Remove an operation, used by tests and hot-reload
    pub fn unregister(&self, name: &str) -> SchedulerResult<()> {
        let current = self.operations.load();
        if !current.contains_key(name) {
            return Err(self.not_found(name));
        }

        let mut updated = (**current).clone();
        updated.remove(name);
        self.operations.store(Arc::new(updated));

        tracing::info!("🗑️ Unregistered operation '{}'", name);
        Ok(())
    }

    pub fn get_operation(&self, name: &str) -> SchedulerResult<Operation> {
        self.entry(name).map(|entry| entry.operation.clone())
    }

    /// Group at `index` of operation `name`
    pub fn get_step_group(&self, name: &str, index: usize) -> SchedulerResult<StepGroup> {
        let entry = self.entry(name)?;
        entry
            .operation
            .step_groups
            .get(index)
            .cloned()
            .ok_or_else(|| SchedulerError::StepGroupOutOfRange {
                operation: name.to_string(),
                index,
                len: entry.operation.step_groups.len(),
            })
    }

    pub fn get_step(&self, name: &str, step: &str) -> SchedulerResult<Arc<dyn Step>> {
        let (_, group) = self.locate_step(name, step)?;
        group
            .find_step(step)
            .ok_or_else(|| SchedulerError::StepNotFoundInOperation {
                operation: name.to_string(),
                step: step.to_string(),
            })
    }

    /// Group index and group holding `step` within operation `name`
    pub fn locate_step(&self, name: &str, step: &str) -> SchedulerResult<(usize, StepGroup)> {
        let entry = self.entry(name)?;
        let index = *entry.step_index.get(step).ok_or_else(|| {
            SchedulerError::StepNotFoundInOperation {
                operation: name.to_string(),
                step: step.to_string(),
            }
        })?;
        Ok((index, entry.operation.step_groups[index].clone()))
    }

    pub fn list_operation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.load().keys().cloned().collect();
        names.sort();
        names
    }

    fn entry(&self, name: &str) -> SchedulerResult<Arc<RegisteredOperation>> {
        self.operations
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(name))
    }

    fn not_found(&self, name: &str) -> SchedulerError {
        SchedulerError::OperationNotFound {
            name: name.to_string(),
            registered: self.list_operation_names(),
        }
    }
}

/// Check structural rules and build the step -> group index table
fn validate_operation(operation: &Operation) -> SchedulerResult<HashMap<String, usize>> {
    if operation.step_groups.is_empty() {
        return Err(SchedulerError::InvalidOperation(
            "operation should have at least 1 step group".to_string(),
        ));
    }

    let last = operation.step_groups.len() - 1;
    let mut seen: HashSet<String> = HashSet::new();
    let mut step_index = HashMap::new();

    for (index, group) in operation.step_groups.iter().enumerate() {
        if let GroupKind::Parallel(steps) = group.kind() {
            if steps.len() < MIN_PARALLEL_STEPS {
                return Err(SchedulerError::InvalidOperation(format!(
                    "parallel group at index {index} needs at least {MIN_PARALLEL_STEPS} steps, use a single group instead"
                )));
            }
        }

        if group.repeat_steps && index < last {
            return Err(SchedulerError::InvalidOperation(format!(
                "only the last step group can repeat, found repeat at index {index}"
            )));
        }

        for step in group.get_step_subgroup_to_run() {
            let reference = step.unique_reference().to_string();
            if !seen.insert(reference.clone()) {
                return Err(SchedulerError::InvalidOperation(format!(
                    "step '{reference}' is used more than once"
                )));
            }

            // a repeating group never finishes, a manual wait inside it would block forever
            if group.repeat_steps && step.failure_policy() == FailurePolicy::WaitManual {
                return Err(SchedulerError::InvalidOperation(format!(
                    "repeating group at index {index} cannot contain step '{reference}' which waits for manual intervention"
                )));
            }

            step_index.insert(reference, index);
        }
    }

    Ok(step_index)
}
