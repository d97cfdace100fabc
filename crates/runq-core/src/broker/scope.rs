use serde::{Deserialize, Serialize};

use crate::broker::keys;

/// Deployment stage of an environment. Development environments are served by
/// the developer's own local workers; every other kind runs on shared workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Development,
    Preview,
    Staging,
    Production,
}

impl EnvironmentKind {
    pub fn is_development(self) -> bool {
        matches!(self, EnvironmentKind::Development)
    }
}

/// The tenant/environment a queue belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueScope {
    pub organization_id: String,
    pub environment_id: String,
    pub kind: EnvironmentKind,
}

impl QueueScope {
    pub fn new(
        organization_id: impl Into<String>,
        environment_id: impl Into<String>,
        kind: EnvironmentKind,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            environment_id: environment_id.into(),
            kind,
        }
    }

    /// The worker group that will drain queues in this scope.
    pub fn worker_group(&self) -> WorkerGroup {
        if self.kind.is_development() {
            WorkerGroup::Unmanaged {
                organization_id: self.organization_id.clone(),
                environment_id: self.environment_id.clone(),
            }
        } else {
            WorkerGroup::Managed
        }
    }
}

/// Who pulls work. Both variants share one dequeue contract and differ only in
/// which parent index they draw queues from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerGroup {
    /// Workers owned by one environment (local development workers).
    Unmanaged {
        organization_id: String,
        environment_id: String,
    },
    /// The shared worker fleet serving every deployed environment.
    Managed,
}

impl WorkerGroup {
    pub fn parent_queue_key(&self) -> String {
        match self {
            WorkerGroup::Unmanaged {
                organization_id,
                environment_id,
            } => keys::environment_parent_queue_key(organization_id, environment_id),
            WorkerGroup::Managed => keys::SHARED_QUEUE.to_string(),
        }
    }
}
