/// Step declarations
///
/// A step is a stateless declaration of one unit of work: a forward action
/// (`create`), a backward action (`destroy`), and a timeout for each. Execution
/// state never lives here, only in the repository.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default hard timeout for both directions
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// What happens to a step whose action returned an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record FAILED with the traceback; the run rolls back
    Fail,
    /// Park in WAITING_MANUAL until an operator retries or skips it
    WaitManual,
    /// Record ABANDONED; the run rolls back and is flagged as having problems
    Abandon,
}

/// Everything a step action gets to see while it runs
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub node_id: String,
    pub operation_name: String,
    pub step_group_name: String,
    pub step_name: String,
    pub is_creating: bool,
    /// Claim attempt this execution belongs to
    pub attempt: i64,
    /// Desired spec of the node at dispatch time
    pub desired_spec: Value,
    /// Cooperative cancellation signal, checked by long-running actions
    pub cancellation: CancellationToken,
}

impl StepContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A named unit of work with forward and backward actions
///
/// Implementations must be idempotent: `create` and `destroy` can be invoked
/// more than once for the same run after a crash or a lease expiry, and
/// `destroy` can follow a partial or missing `create`.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Stable identifier, unique within an operation
    fn unique_reference(&self) -> &str;

    fn apply_timeout(&self) -> Duration {
        DEFAULT_STEP_TIMEOUT
    }

    fn revert_timeout(&self) -> Duration {
        DEFAULT_STEP_TIMEOUT
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Fail
    }

    /// Forward action; the returned payload is persisted with the step
    async fn create(&self, ctx: StepContext) -> anyhow::Result<Option<Value>>;

    /// Backward action, no-op unless overridden
    async fn destroy(&self, ctx: StepContext) -> anyhow::Result<Option<Value>> {
        let _ = ctx;
        Ok(None)
    }
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Step").field(&self.unique_reference()).finish()
    }
}
