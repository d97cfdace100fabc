//! Trigger admission: entitlement, queue resolution, depth guard, run-chain
//! validation, run creation and finally the broker enqueue.

pub mod depth_guard;
pub mod memory;
pub mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, EnvironmentKind, QueueScope};
use crate::chain::{RunChainContext, RunChainState, RunChainTracker};
use crate::config::AdmissionConfig;
use crate::error::{StoreError, TriggerError};
use crate::message::{Message, Payload};
use crate::queue::QueueConfig;

pub use depth_guard::QueueDepthGuard;
pub use memory::{InMemoryQueueConfigStore, InMemoryRunStore, StaticEntitlements};
pub use store::{
    EntitlementCheck, QueueConfigStore, RunRecord, RunStatus, RunStore, RunUpdate,
};

/// The authenticated environment a trigger arrives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub organization_id: String,
    pub kind: EnvironmentKind,
    /// Environment-wide concurrency limit.
    pub maximum_concurrency_limit: u32,
}

impl Environment {
    pub fn scope(&self) -> QueueScope {
        QueueScope::new(&self.organization_id, &self.id, self.kind)
    }
}

#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub environment: Environment,
    pub task_identifier: String,
    pub payload: Payload,
    /// Defaults to the task's own queue, `task/<task_identifier>`.
    pub queue_name: Option<String>,
    pub concurrency_key: Option<String>,
    pub parent_run_id: Option<Uuid>,
    /// The parent blocks until this run completes.
    pub resume_parent_on_completion: bool,
    /// Overrides the parent queue's release-on-waitpoint setting.
    pub release_concurrency: Option<bool>,
    /// Earliest time (ms) the run may start.
    pub delay_until: Option<u64>,
}

impl TriggerRequest {
    pub fn new(environment: Environment, task_identifier: impl Into<String>, payload: Payload) -> Self {
        Self {
            environment,
            task_identifier: task_identifier.into(),
            payload,
            queue_name: None,
            concurrency_key: None,
            parent_run_id: None,
            resume_parent_on_completion: false,
            release_concurrency: None,
            delay_until: None,
        }
    }

    /// Make this a child of `parent`, optionally blocking the parent on it.
    pub fn child_of(mut self, parent: Uuid, wait: bool) -> Self {
        self.parent_run_id = Some(parent);
        self.resume_parent_on_completion = wait;
        self
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn queue_name(&self) -> String {
        self.queue_name
            .clone()
            .unwrap_or_else(|| format!("task/{}", self.task_identifier))
    }
}

/// What a successful trigger hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: Uuid,
    pub queue_name: String,
    pub depth: u32,
    pub run_chain_state: RunChainState,
}

/// Admits runs and hands them to the broker. A trigger either returns a
/// [`RunHandle`] with the run enqueued, or fails with one [`TriggerError`].
pub struct TriggerService {
    broker: Arc<Broker>,
    runs: Arc<dyn RunStore>,
    queues: Arc<dyn QueueConfigStore>,
    entitlement: Arc<dyn EntitlementCheck>,
    tracker: RunChainTracker,
    depth_guard: QueueDepthGuard,
}

impl TriggerService {
    pub fn new(
        config: &AdmissionConfig,
        broker: Arc<Broker>,
        runs: Arc<dyn RunStore>,
        queues: Arc<dyn QueueConfigStore>,
        entitlement: Arc<dyn EntitlementCheck>,
    ) -> Self {
        Self {
            tracker: RunChainTracker::new(
                Arc::clone(&queues),
                config.legacy_environment_accounting,
            ),
            depth_guard: QueueDepthGuard::new(config),
            broker,
            runs,
            queues,
            entitlement,
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    #[tracing::instrument(
        skip_all,
        fields(
            task = %request.task_identifier,
            environment = %request.environment.id,
            parent_run = ?request.parent_run_id,
        )
    )]
    pub fn trigger(&self, request: TriggerRequest) -> Result<RunHandle, TriggerError> {
        let result = self.admit(&request);
        if let Err(e) = &result {
            self.broker.metrics().record_admission_rejected(e.reason());
            warn!(reason = e.reason(), error = %e, "trigger rejected");
        }
        result
    }

    fn admit(&self, request: &TriggerRequest) -> Result<RunHandle, TriggerError> {
        let env = &request.environment;
        if !self.entitlement.has_access(&env.organization_id)? {
            return Err(TriggerError::Entitlement(env.organization_id.clone()));
        }

        let queue_name = request.queue_name();
        let locked_queue_id = self
            .queues
            .find_queue(&env.id, &queue_name)?
            .map(|q| q.id);
        let scope = env.scope();
        self.depth_guard.check(&self.broker, &scope, &queue_name, 1)?;

        let run_id = Message::new_id();
        let mut chain_state = RunChainState::default();
        let run = self.runs.create_run(request.parent_run_id.as_ref(), &mut |parent| {
            if let (Some(parent_id), None) = (request.parent_run_id, parent) {
                return Err(TriggerError::ParentRunNotFound(parent_id));
            }
            let state = self.tracker.validate_run_chain(
                request,
                RunChainContext {
                    parent_run: parent,
                    queue_name: &queue_name,
                    locked_queue_id: locked_queue_id.as_deref(),
                },
            )?;
            let serialized = state
                .to_json()
                .map_err(|e| StoreError(format!("failed to serialize run chain state: {e}")))?;
            chain_state = state;
            Ok(RunRecord {
                id: run_id,
                organization_id: env.organization_id.clone(),
                environment_id: env.id.clone(),
                task_identifier: request.task_identifier.clone(),
                queue_name: queue_name.clone(),
                locked_queue_id: locked_queue_id.clone(),
                parent_run_id: request.parent_run_id,
                depth: parent.map_or(0, |p| p.depth + 1),
                concurrency_key: request.concurrency_key.clone(),
                run_chain_state: Some(serialized),
                status: RunStatus::Pending,
            })
        })?;

        let timestamp = request
            .delay_until
            .unwrap_or_else(|| self.broker.clock().now_ms());
        if let Err(e) = self.broker.enqueue_at(
            &scope,
            &queue_name,
            run.id,
            request.payload.clone(),
            request.concurrency_key.as_deref(),
            timestamp,
        ) {
            error!(run_id = %run.id, error = %e, "enqueue failed after run was created, marking it failed");
            if let Err(update) = self
                .runs
                .update_run(&run.id, RunUpdate::status(RunStatus::SystemFailure))
            {
                error!(run_id = %run.id, error = %update, "failed to mark run as failed");
            }
            return Err(e.into());
        }

        self.depth_guard.record_admitted(&scope, &queue_name, 1);
        info!(run_id = %run.id, queue = %queue_name, depth = run.depth, "run triggered");
        Ok(RunHandle {
            id: run.id,
            queue_name,
            depth: run.depth,
            run_chain_state: chain_state,
        })
    }

    /// Store a queue's configuration and mirror its limit into the broker.
    #[tracing::instrument(skip_all, fields(queue = %queue.name, limit = ?queue.concurrency_limit))]
    pub fn sync_queue(&self, scope: &QueueScope, queue: QueueConfig) -> Result<(), TriggerError> {
        let name = queue.name.clone();
        let limit = queue.concurrency_limit;
        self.queues.put_queue(queue)?;
        match limit {
            Some(limit) => self.broker.update_queue_concurrency(scope, &name, limit)?,
            None => self.broker.remove_queue_concurrency(scope, &name)?,
        }
        Ok(())
    }
}
