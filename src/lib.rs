/// Stepwright: durable step-based operation orchestrator
///
/// Converges nodes towards their desired state by running operations made of
/// ordered step groups. Step state lives in SQLite, workers claim steps
/// atomically, and broken runs roll back through the reverse step graph.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Operation model - steps, groups, registry and DAG templates
pub mod operation;

// Durable repository - nodes, runs and step executions on SQLite
pub mod repository;

// Ephemeral hash store for progress, task handles and error summaries
pub mod store;

// Runtime - workers, deferred runner, dispatcher and run lifecycle
pub mod runtime;

// Pure node status reconciliation
pub mod status;

// Service setup and initialization
pub mod service;

// Re-export commonly used types for external consumers
pub use error::{SchedulerError, SchedulerResult};
pub use operation::{DagTemplate, Operation, OperationRegistry, Step, StepContext, StepGroup};
pub use repository::{Claim, DesiredState, Repository, RunKind, RunState, StepState};
pub use runtime::{DeferredRunner, RunLifecycle, WorkerPool};
pub use service::{start_service, Scheduler};
pub use status::{node_status, ComponentPresence, NodeStatus, ServicesPresence};
