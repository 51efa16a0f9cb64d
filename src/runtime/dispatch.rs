/// Task-dispatch contract and the in-process dispatcher
///
/// The runner hands a `WorkDescriptor` to a `TaskDispatcher` and gets an opaque
/// task uid back immediately. Outcomes and heartbeats flow back through a
/// `CompletionSink`. The transport behind the contract is not the runner's
/// concern; `LocalTaskDispatcher` runs steps as tokio tasks in this process.

use crate::config::MIN_PERIOD;
use crate::error::SchedulerResult;
use crate::operation::registry::OperationRegistry;
use crate::operation::step::StepContext;
use crate::repository::models::Claim;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type TaskUid = String;

/// Everything needed to execute one claimed step attempt
#[derive(Debug, Clone)]
pub struct WorkDescriptor {
    pub claim: Claim,
    pub node_id: String,
    pub step_group_name: String,
    pub desired_spec: Value,
}

impl WorkDescriptor {
    pub fn is_creating(&self) -> bool {
        self.claim.is_creating()
    }
}

/// How a dispatched task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Option<Value>),
    /// Rendered error chain of the failed action
    Failed(String),
    Cancelled,
}

/// Receiver of task outcomes and liveness signals
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn on_complete(&self, work: WorkDescriptor, outcome: TaskOutcome);

    async fn on_heartbeat(&self, work: &WorkDescriptor);
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Start the work without waiting for it; returns the task uid
    async fn start(
        &self,
        work: WorkDescriptor,
        sink: Arc<dyn CompletionSink>,
    ) -> SchedulerResult<TaskUid>;

    /// Best-effort cancellation; false when the task is unknown or finished
    async fn cancel(&self, task_uid: &str) -> SchedulerResult<bool>;
}

/// Runs step actions as tokio tasks
///
/// The action gets a cancellation token through its `StepContext`. The task is
/// also dropped outright on cancel or when the step's timeout elapses, and in
/// both cases the outcome is reported to the sink.
pub struct LocalTaskDispatcher {
    registry: Arc<OperationRegistry>,
    heartbeat_interval: Duration,
    tasks: Arc<Mutex<HashMap<TaskUid, CancellationToken>>>,
}

impl LocalTaskDispatcher {
    pub fn new(registry: Arc<OperationRegistry>, heartbeat_interval: Duration) -> Self {
        Self {
            registry,
            heartbeat_interval: heartbeat_interval.max(MIN_PERIOD),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of tasks still executing
    pub async fn active_tasks(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl TaskDispatcher for LocalTaskDispatcher {
    async fn start(
        &self,
        work: WorkDescriptor,
        sink: Arc<dyn CompletionSink>,
    ) -> SchedulerResult<TaskUid> {
        let step = self
            .registry
            .get_step(&work.claim.operation_name, &work.claim.step_type)?;
        let is_creating = work.is_creating();
        let timeout = if is_creating {
            step.apply_timeout()
        } else {
            step.revert_timeout()
        };

        let task_uid = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.tasks.lock().await.insert(task_uid.clone(), token.clone());

        let ctx = StepContext {
            run_id: work.claim.run_id.clone(),
            node_id: work.node_id.clone(),
            operation_name: work.claim.operation_name.clone(),
            step_group_name: work.step_group_name.clone(),
            step_name: work.claim.step_type.clone(),
            is_creating,
            attempt: work.claim.attempt,
            desired_spec: work.desired_spec.clone(),
            cancellation: token.clone(),
        };

        let tasks = Arc::clone(&self.tasks);
        let heartbeat_interval = self.heartbeat_interval;
        let uid = task_uid.clone();

        tokio::spawn(async move {
            tracing::debug!(
                "▶️ Task {} running {} ({}) of run {}",
                uid,
                work.claim.step_type,
                if is_creating { "create" } else { "destroy" },
                work.claim.run_id
            );

            let mut action = if is_creating {
                step.create(ctx)
            } else {
                step.destroy(ctx)
            };
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the claim already stamped a first heartbeat
            heartbeat.tick().await;

            let outcome = loop {
                tokio::select! {
                    // a cancel observed together with the result wins
                    biased;
                    _ = token.cancelled() => break TaskOutcome::Cancelled,
                    result = &mut action => {
                        break match result {
                            Ok(payload) => TaskOutcome::Success(payload),
                            Err(err) => TaskOutcome::Failed(format!("{err:?}")),
                        };
                    }
                    _ = &mut deadline => {
                        token.cancel();
                        break TaskOutcome::Failed(format!(
                            "step '{}' timed out after {:?}",
                            work.claim.step_type, timeout
                        ));
                    }
                    _ = heartbeat.tick() => sink.on_heartbeat(&work).await,
                }
            };
            drop(action);

            tasks.lock().await.remove(&uid);
            tracing::debug!("⏹️ Task {} finished: {:?}", uid, outcome);
            sink.on_complete(work, outcome).await;
        });

        Ok(task_uid)
    }

    async fn cancel(&self, task_uid: &str) -> SchedulerResult<bool> {
        match self.tasks.lock().await.get(task_uid) {
            Some(token) => {
                tracing::info!("🛑 Cancelling task {}", task_uid);
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::group::StepGroup;
    use crate::operation::registry::Operation;
    use crate::operation::step::Step;
    use chrono::Utc;
    use tokio::sync::mpsc;

    struct Quick;

    #[async_trait]
    impl Step for Quick {
        fn unique_reference(&self) -> &str {
            "quick"
        }

        async fn create(&self, ctx: StepContext) -> anyhow::Result<Option<Value>> {
            Ok(Some(Value::from(ctx.attempt)))
        }

        async fn destroy(&self, _ctx: StepContext) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("I failed destroying")
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Step for Sleeper {
        fn unique_reference(&self) -> &str {
            "sleeper"
        }

        fn apply_timeout(&self) -> Duration {
            Duration::from_millis(200)
        }

        fn revert_timeout(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn create(&self, _ctx: StepContext) -> anyhow::Result<Option<Value>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn destroy(&self, ctx: StepContext) -> anyhow::Result<Option<Value>> {
            ctx.cancellation.cancelled().await;
            Ok(None)
        }
    }

    struct ChannelSink {
        outcomes: mpsc::UnboundedSender<TaskOutcome>,
        heartbeats: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl CompletionSink for ChannelSink {
        async fn on_complete(&self, _work: WorkDescriptor, outcome: TaskOutcome) {
            let _ = self.outcomes.send(outcome);
        }

        async fn on_heartbeat(&self, _work: &WorkDescriptor) {
            let _ = self.heartbeats.send(());
        }
    }

    fn dispatcher(heartbeat: Duration) -> LocalTaskDispatcher {
        let registry = Arc::new(OperationRegistry::new());
        registry
            .register(
                "op",
                Operation::new(vec![StepGroup::parallel(vec![Arc::new(Quick), Arc::new(Sleeper)])]),
            )
            .unwrap();
        LocalTaskDispatcher::new(registry, heartbeat)
    }

    fn work(step: &str, is_reverting: bool) -> WorkDescriptor {
        WorkDescriptor {
            claim: Claim {
                step_id: "s1".to_string(),
                run_id: "r1".to_string(),
                operation_name: "op".to_string(),
                step_type: step.to_string(),
                is_reverting,
                attempt: 3,
                worker_id: "w1".to_string(),
                claimed_at: Utc::now(),
            },
            node_id: "n1".to_string(),
            step_group_name: "0P".to_string(),
            desired_spec: Value::Null,
        }
    }

    fn sink() -> (
        Arc<dyn CompletionSink>,
        mpsc::UnboundedReceiver<TaskOutcome>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();
        let (heartbeats, heartbeat_rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { outcomes, heartbeats }), outcome_rx, heartbeat_rx)
    }

    #[tokio::test]
    async fn success_and_failure_are_reported() {
        let dispatcher = dispatcher(Duration::from_secs(60));
        let (sink, mut outcomes, _) = sink();

        dispatcher.start(work("quick", false), Arc::clone(&sink)).await.unwrap();
        assert_eq!(outcomes.recv().await.unwrap(), TaskOutcome::Success(Some(Value::from(3))));

        dispatcher.start(work("quick", true), sink).await.unwrap();
        match outcomes.recv().await.unwrap() {
            TaskOutcome::Failed(traceback) => assert!(traceback.contains("I failed")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_stops_a_running_task() {
        let dispatcher = dispatcher(Duration::from_secs(60));
        let (sink, mut outcomes, _) = sink();

        let uid = dispatcher.start(work("sleeper", true), sink).await.unwrap();
        assert_eq!(dispatcher.active_tasks().await, 1);
        assert!(dispatcher.cancel(&uid).await.unwrap());

        assert_eq!(outcomes.recv().await.unwrap(), TaskOutcome::Cancelled);
        assert_eq!(dispatcher.active_tasks().await, 0);
        assert!(!dispatcher.cancel(&uid).await.unwrap());
    }

    #[tokio::test]
    async fn timeout_fails_the_task_and_heartbeats_flow_meanwhile() {
        let dispatcher = dispatcher(Duration::from_millis(20));
        let (sink, mut outcomes, mut heartbeats) = sink();

        dispatcher.start(work("sleeper", false), sink).await.unwrap();
        match outcomes.recv().await.unwrap() {
            TaskOutcome::Failed(traceback) => assert!(traceback.contains("timed out")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(heartbeats.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unknown_step_is_rejected_before_spawning() {
        let dispatcher = dispatcher(Duration::from_secs(60));
        let (sink, _, _) = sink();
        assert!(dispatcher.start(work("ghost", false), sink).await.is_err());
        assert_eq!(dispatcher.active_tasks().await, 0);
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_still_reports() {
        let dispatcher = dispatcher(Duration::ZERO);
        let (sink, mut outcomes, _) = sink();

        dispatcher.start(work("quick", false), sink).await.unwrap();
        assert_eq!(outcomes.recv().await.unwrap(), TaskOutcome::Success(Some(Value::from(3))));
    }
}
