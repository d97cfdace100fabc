//! Collaborators the admission path depends on but does not own: the durable
//! run store, the queue configuration store and the entitlement service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, TriggerError};
use crate::queue::QueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Executing,
    Completed,
    SystemFailure,
}

/// A persisted task run, as far as admission cares about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub organization_id: String,
    pub environment_id: String,
    pub task_identifier: String,
    pub queue_name: String,
    /// Queue the run was pinned to at admission, when the queue is known.
    pub locked_queue_id: Option<String>,
    pub parent_run_id: Option<Uuid>,
    /// Number of ancestors. Root runs are depth 0.
    pub depth: u32,
    pub concurrency_key: Option<String>,
    /// Serialized chain state, written once at creation.
    pub run_chain_state: Option<String>,
    pub status: RunStatus,
}

/// Partial update for [`RunStore::update_run`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub run_chain_state: Option<String>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(self, run: &mut RunRecord) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(state) = self.run_chain_state {
            run.run_chain_state = Some(state);
        }
    }
}

/// Builds the run to insert from the (locked) parent snapshot.
pub type BuildRun<'a> = dyn FnMut(Option<&RunRecord>) -> Result<RunRecord, TriggerError> + 'a;

pub trait RunStore: Send + Sync {
    fn find_run(&self, id: &Uuid) -> Result<Option<RunRecord>, StoreError>;

    /// Returns false if the run does not exist.
    fn update_run(&self, id: &Uuid, update: RunUpdate) -> Result<bool, StoreError>;

    /// Insert the run produced by `build` in one transaction. When `parent_id`
    /// is set the parent row is locked for the whole transaction and `build`
    /// receives it (or `None` if it does not exist), so concurrent siblings
    /// serialize on the parent. If `build` fails nothing is written.
    fn create_run(
        &self,
        parent_id: Option<&Uuid>,
        build: &mut BuildRun<'_>,
    ) -> Result<RunRecord, TriggerError>;
}

pub trait QueueConfigStore: Send + Sync {
    fn get_queue(&self, id: &str) -> Result<Option<QueueConfig>, StoreError>;

    fn find_queue(&self, environment_id: &str, name: &str) -> Result<Option<QueueConfig>, StoreError>;

    /// Insert or replace by `id`.
    fn put_queue(&self, queue: QueueConfig) -> Result<(), StoreError>;
}

pub trait EntitlementCheck: Send + Sync {
    fn has_access(&self, organization_id: &str) -> Result<bool, StoreError>;
}
