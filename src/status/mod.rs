/// Node status reconciliation
///
/// Folds the observed presence of a node's components into the single status
/// reported to the outside world. The mapping is total and side-effect free;
/// observing the presences is delegated to a `PresenceObserver`.

use crate::error::SchedulerResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Observed lifecycle phase of one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentPresence {
    Absent,
    Starting,
    Running,
    Failed,
}

impl ComponentPresence {
    pub const ALL: [ComponentPresence; 4] = [
        ComponentPresence::Absent,
        ComponentPresence::Starting,
        ComponentPresence::Running,
        ComponentPresence::Failed,
    ];
}

/// Presence of the service components backing a node
///
/// Legacy nodes run a single component; new-style nodes run a sidecar and a
/// proxy in front of the user services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServicesPresence {
    Legacy(ComponentPresence),
    NewStyle {
        dy_sidecar: ComponentPresence,
        dy_proxy: ComponentPresence,
    },
}

/// Externally reported node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    IsAbsent,
    IsPresent,
    TransitionToPresent,
    TransitionToAbsent,
    InError,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::IsAbsent => "IS_ABSENT",
            NodeStatus::IsPresent => "IS_PRESENT",
            NodeStatus::TransitionToPresent => "TRANSITION_TO_PRESENT",
            NodeStatus::TransitionToAbsent => "TRANSITION_TO_ABSENT",
            NodeStatus::InError => "IN_ERROR",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the status of a node from its observed components
///
/// `user_services` is `None` when the user services have not been observed
/// yet. An idle sidecar and proxy then read as absent, and a running pair as
/// still transitioning to present.
pub fn node_status(
    services: ServicesPresence,
    user_services: Option<ComponentPresence>,
) -> NodeStatus {
    use ComponentPresence::{Absent, Failed, Running, Starting};

    match services {
        ServicesPresence::Legacy(legacy) => match legacy {
            Absent => NodeStatus::IsAbsent,
            Starting => NodeStatus::TransitionToPresent,
            Running => NodeStatus::IsPresent,
            Failed => NodeStatus::InError,
        },
        ServicesPresence::NewStyle { dy_sidecar, dy_proxy } => match (dy_sidecar, dy_proxy) {
            (Failed, _) => NodeStatus::InError,

            (Absent, Absent) => match user_services {
                Some(Failed) => NodeStatus::InError,
                Some(Absent | Starting | Running) | None => NodeStatus::IsAbsent,
            },
            // a proxy without a sidecar
            (Absent, Starting | Running | Failed) => NodeStatus::InError,

            (Starting | Running, Failed) => NodeStatus::InError,
            (Starting | Running, Absent | Starting) => NodeStatus::TransitionToPresent,
            (Starting, Running) => NodeStatus::TransitionToPresent,
            (Running, Running) => match user_services {
                Some(Absent) => NodeStatus::TransitionToAbsent,
                Some(Starting) | None => NodeStatus::TransitionToPresent,
                Some(Running) => NodeStatus::IsPresent,
                Some(Failed) => NodeStatus::InError,
            },
        },
    }
}

/// Source of observed component presence
#[async_trait]
pub trait PresenceObserver: Send + Sync {
    async fn get_services_presence(&self, node_id: &str) -> SchedulerResult<ServicesPresence>;

    async fn get_user_services_presence(
        &self,
        node_id: &str,
    ) -> SchedulerResult<Option<ComponentPresence>>;
}

/// Observe a node and reduce it to its reported status
pub async fn observe_node_status(
    observer: &dyn PresenceObserver,
    node_id: &str,
) -> SchedulerResult<NodeStatus> {
    let services = observer.get_services_presence(node_id).await?;
    let user_services = observer.get_user_services_presence(node_id).await?;
    let status = node_status(services, user_services);
    tracing::debug!(
        "🔎 Node {} status {} (services {:?}, user services {:?})",
        node_id,
        status,
        services,
        user_services
    );
    Ok(status)
}
