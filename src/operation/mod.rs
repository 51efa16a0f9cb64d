/// Operation model
///
/// This module declares what work exists, never how far it got:
/// - Step declarations with forward/backward actions and timeouts
/// - Step groups (single, parallel, repeating)
/// - The lock-free operation registry
/// - DAG templates derived from operations for materialisation

// Step trait and execution context
pub mod step;

// Ordered execution phases
pub mod group;

// ArcSwap-backed registry of named operations
pub mod registry;

// Step graphs handed to the repository
pub mod template;

pub use group::StepGroup;
pub use registry::{Operation, OperationRegistry};
pub use step::{FailurePolicy, Step, StepContext};
pub use template::DagTemplate;
