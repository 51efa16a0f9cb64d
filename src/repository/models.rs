/// Durable data model: nodes, runs, step executions and claims
///
/// Enum values are stored as upper-case text columns; `as_str`/`parse` are the
/// only conversion points between Rust and SQL.

use crate::error::{SchedulerError, SchedulerResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type RunId = String;
pub type StepId = String;

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> SchedulerResult<Self> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(SchedulerError::UnknownEnumValue {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Lifecycle of one step execution
///
/// `CREATED -> READY -> RUNNING -> {SUCCESS | FAILED | CANCELLED | WAITING_MANUAL | ABANDONED}`,
/// plus `SKIPPED` set by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Created,
    Ready,
    Running,
    Success,
    Failed,
    Cancelled,
    WaitingManual,
    Abandoned,
    Skipped,
}

text_enum!(StepState, "step state", {
    Created => "CREATED",
    Ready => "READY",
    Running => "RUNNING",
    Success => "SUCCESS",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
    WaitingManual => "WAITING_MANUAL",
    Abandoned => "ABANDONED",
    Skipped => "SKIPPED",
});

impl StepState {
    pub const ALL: [StepState; 9] = [
        StepState::Created,
        StepState::Ready,
        StepState::Running,
        StepState::Success,
        StepState::Failed,
        StepState::Cancelled,
        StepState::WaitingManual,
        StepState::Abandoned,
        StepState::Skipped,
    ];

    pub fn is_cancellable(&self) -> bool {
        matches!(self, StepState::Created | StepState::Ready | StepState::Running)
    }

    /// Counts as done for dependency gating and run completion
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepState::Success | StepState::Skipped)
    }

    pub fn is_problem(&self) -> bool {
        matches!(self, StepState::WaitingManual | StepState::Abandoned)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, StepState::Ready | StepState::Running)
    }
}

/// Which action of the step a row executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// forward, `create`
    Do,
    /// backward, `destroy`
    Undo,
}

impl Direction {
    pub fn is_reverting(&self) -> bool {
        matches!(self, Direction::Undo)
    }

    pub fn from_reverting(is_reverting: bool) -> Self {
        if is_reverting {
            Direction::Undo
        } else {
            Direction::Do
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunKind {
    Apply,
    Revert,
}

text_enum!(RunKind, "run kind", {
    Apply => "APPLY",
    Revert => "REVERT",
});

impl RunKind {
    /// Direction whose steps decide completion of the run
    pub fn relevant_direction(&self) -> Direction {
        match self {
            RunKind::Apply => Direction::Do,
            RunKind::Revert => Direction::Undo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    /// rolling back a failed or cancelled apply
    Reverting,
    Succeeded,
    Reverted,
    Failed,
}

text_enum!(RunState, "run state", {
    Running => "RUNNING",
    Reverting => "REVERTING",
    Succeeded => "SUCCEEDED",
    Reverted => "REVERTED",
    Failed => "FAILED",
});

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Reverted | RunState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    Present,
    Absent,
}

text_enum!(DesiredState, "desired state", {
    Present => "PRESENT",
    Absent => "ABSENT",
});

impl DesiredState {
    pub fn run_kind(&self) -> RunKind {
        match self {
            DesiredState::Present => RunKind::Apply,
            DesiredState::Absent => RunKind::Revert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualActionKind {
    Retry,
    Skip,
}

text_enum!(ManualActionKind, "manual action", {
    Retry => "RETRY",
    Skip => "SKIP",
});

/// Operator decision for a step waiting for manual intervention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAction {
    pub action: ManualActionKind,
    pub performed_by: String,
    pub reason: String,
}

/// Node converged by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub operation_name: Option<String>,
    pub desired_state: DesiredState,
    pub desired_spec: Value,
    pub generation: i64,
    pub active_run_id: Option<RunId>,
}

/// One execution attempt of an operation against a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub node_id: String,
    pub operation_name: Option<String>,
    pub generation: i64,
    pub kind: RunKind,
    pub state: RunState,
    pub cancel_requested: bool,
}

/// Step instance row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: StepId,
    pub run_id: RunId,
    pub operation_name: String,
    pub step_type: String,
    pub is_reverting: bool,
    pub state: StepState,
    /// claim token, bumped on every claim
    pub attempt: i64,
    pub available_attempts: i64,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub deferred_task_uid: Option<String>,
    pub payload: Option<Value>,
    pub error_traceback: Option<String>,
    pub requires_manual_intervention: bool,
}

/// Exclusive right of one worker to execute one step attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub step_id: StepId,
    pub run_id: RunId,
    pub operation_name: String,
    pub step_type: String,
    pub is_reverting: bool,
    pub attempt: i64,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    pub fn is_creating(&self) -> bool {
        !self.is_reverting
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip_for_every_step_state() {
        for state in StepState::ALL {
            assert_eq!(StepState::parse(state.as_str()).unwrap(), state);
        }
        assert!(matches!(
            StepState::parse("BOGUS"),
            Err(SchedulerError::UnknownEnumValue { kind: "step state", .. })
        ));
    }

    #[test]
    fn only_pre_terminal_states_are_cancellable() {
        let cancellable: Vec<StepState> = StepState::ALL.into_iter().filter(StepState::is_cancellable).collect();
        assert_eq!(cancellable, vec![StepState::Created, StepState::Ready, StepState::Running]);
    }

    #[test]
    fn problem_and_satisfied_sets() {
        assert!(StepState::WaitingManual.is_problem());
        assert!(StepState::Abandoned.is_problem());
        assert!(!StepState::Failed.is_problem());
        assert!(StepState::Skipped.is_satisfied());
        assert!(!StepState::Cancelled.is_satisfied());
    }

    #[test]
    fn desired_state_selects_run_kind_and_direction() {
        assert_eq!(DesiredState::Present.run_kind(), RunKind::Apply);
        assert_eq!(DesiredState::Absent.run_kind().relevant_direction(), Direction::Undo);
        assert!(Direction::from_reverting(true).is_reverting());
    }
}
