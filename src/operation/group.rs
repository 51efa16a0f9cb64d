/// Step groups: ordered execution phases of an operation
///
/// Groups run strictly one after another; the steps inside a group may run
/// concurrently on different workers.

use crate::operation::step::Step;
use std::{sync::Arc, time::Duration};

pub const DEFAULT_WAIT_BEFORE_REPEAT: Duration = Duration::from_secs(5);

/// Minimum number of steps a parallel group must hold
pub const MIN_PARALLEL_STEPS: usize = 2;

#[derive(Debug, Clone)]
pub enum GroupKind {
    Single(Arc<dyn Step>),
    Parallel(Vec<Arc<dyn Step>>),
}

/// One execution phase of an operation
#[derive(Debug, Clone)]
pub struct StepGroup {
    kind: GroupKind,
    /// When true the steps are executed again after each success, forever
    pub repeat_steps: bool,
    pub wait_before_repeat: Duration,
}

impl StepGroup {
    pub fn single(step: Arc<dyn Step>) -> Self {
        Self {
            kind: GroupKind::Single(step),
            repeat_steps: false,
            wait_before_repeat: DEFAULT_WAIT_BEFORE_REPEAT,
        }
    }

    pub fn parallel(steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            kind: GroupKind::Parallel(steps),
            repeat_steps: false,
            wait_before_repeat: DEFAULT_WAIT_BEFORE_REPEAT,
        }
    }

    /// Mark the group as repeating, waiting `wait` between rounds
    pub fn repeating(mut self, wait: Duration) -> Self {
        self.repeat_steps = true;
        self.wait_before_repeat = wait;
        self
    }

    pub fn kind(&self) -> &GroupKind {
        &self.kind
    }

    pub fn len(&self) -> usize {
        match &self.kind {
            GroupKind::Single(_) => 1,
            GroupKind::Parallel(steps) => steps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable name of the group at `index`, e.g. "0S", "2P", "3SR"
    pub fn get_step_group_name(&self, index: usize) -> String {
        let kind = match self.kind {
            GroupKind::Single(_) => 'S',
            GroupKind::Parallel(_) => 'P',
        };
        let repeat = if self.repeat_steps { "R" } else { "" };
        format!("{index}{kind}{repeat}")
    }

    /// Steps to run for this group, in declaration order
    pub fn get_step_subgroup_to_run(&self) -> Vec<Arc<dyn Step>> {
        match &self.kind {
            GroupKind::Single(step) => vec![Arc::clone(step)],
            GroupKind::Parallel(steps) => steps.clone(),
        }
    }

    /// Find a step of this group by its unique reference
    pub fn find_step(&self, reference: &str) -> Option<Arc<dyn Step>> {
        self.get_step_subgroup_to_run()
            .into_iter()
            .find(|step| step.unique_reference() == reference)
    }
}
