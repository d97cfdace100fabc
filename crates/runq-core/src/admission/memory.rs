use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::admission::store::{
    BuildRun, EntitlementCheck, QueueConfigStore, RunRecord, RunStore, RunUpdate,
};
use crate::error::{StoreError, TriggerError};
use crate::queue::QueueConfig;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run store held in memory. One mutex guards every row, so `create_run`
/// holds the strongest possible lock on the parent.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<Uuid, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.runs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored run, in no particular order.
    pub fn snapshot(&self) -> Vec<RunRecord> {
        lock(&self.runs).values().cloned().collect()
    }
}

impl RunStore for InMemoryRunStore {
    fn find_run(&self, id: &Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(lock(&self.runs).get(id).cloned())
    }

    fn update_run(&self, id: &Uuid, update: RunUpdate) -> Result<bool, StoreError> {
        let mut runs = lock(&self.runs);
        match runs.get_mut(id) {
            Some(run) => {
                update.apply(run);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn create_run(
        &self,
        parent_id: Option<&Uuid>,
        build: &mut BuildRun<'_>,
    ) -> Result<RunRecord, TriggerError> {
        let mut runs = lock(&self.runs);
        let parent = parent_id.and_then(|id| runs.get(id)).cloned();
        let run = build(parent.as_ref())?;
        if runs.contains_key(&run.id) {
            return Err(StoreError(format!("run {} already exists", run.id)).into());
        }
        runs.insert(run.id, run.clone());
        Ok(run)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryQueueConfigStore {
    queues: Mutex<HashMap<String, QueueConfig>>,
}

impl InMemoryQueueConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueConfigStore for InMemoryQueueConfigStore {
    fn get_queue(&self, id: &str) -> Result<Option<QueueConfig>, StoreError> {
        Ok(lock(&self.queues).get(id).cloned())
    }

    fn find_queue(&self, environment_id: &str, name: &str) -> Result<Option<QueueConfig>, StoreError> {
        Ok(lock(&self.queues)
            .values()
            .find(|q| q.environment_id == environment_id && q.name == name)
            .cloned())
    }

    fn put_queue(&self, queue: QueueConfig) -> Result<(), StoreError> {
        lock(&self.queues).insert(queue.id.clone(), queue);
        Ok(())
    }
}

/// Entitlement check backed by a deny list. Everyone not on it has access.
#[derive(Debug, Default)]
pub struct StaticEntitlements {
    denied: Mutex<HashSet<String>>,
}

impl StaticEntitlements {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny(&self, organization_id: impl Into<String>) {
        lock(&self.denied).insert(organization_id.into());
    }

    pub fn allow(&self, organization_id: &str) {
        lock(&self.denied).remove(organization_id);
    }
}

impl EntitlementCheck for StaticEntitlements {
    fn has_access(&self, organization_id: &str) -> Result<bool, StoreError> {
        Ok(!lock(&self.denied).contains(organization_id))
    }
}
