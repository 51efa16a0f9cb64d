/// Runtime: claiming, dispatching and converging runs
///
/// Workers claim READY steps from the repository and pass them to the
/// deferred runner, which dispatches them without waiting. Outcomes flow back
/// through the completion sink into the run lifecycle, which promotes the next
/// steps, rolls back broken runs and finalizes finished ones.

// Task-dispatch contract and the in-process tokio dispatcher
pub mod dispatch;

// Bridge between claims, the dispatcher and recorded outcomes
pub mod deferred;

// Run creation, advancement, rollback and cancellation
pub mod lifecycle;

// Claim loop and worker pool
pub mod worker;

// Stale-claim reclamation
pub mod sweeper;

// Re-export main types
pub use deferred::DeferredRunner;
pub use dispatch::{CompletionSink, LocalTaskDispatcher, TaskDispatcher, TaskOutcome, WorkDescriptor};
pub use lifecycle::{DesiredUpdate, RunLifecycle};
pub use worker::{Worker, WorkerPool};
