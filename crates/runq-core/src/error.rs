use uuid::Uuid;

/// Low-level storage errors (RocksDB, serialization).
/// This is the error type for the `Storage` trait; storage operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("write conflict not resolved after {0} attempts")]
    Conflict(u32),
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors from the broker façade. Operations on unknown or already-settled
/// messages are not errors; they report `false` / `None` instead.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to spawn sweeper thread: {0}")]
    SweeperSpawn(String),

    #[error("sweeper thread panicked")]
    SweeperPanicked,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Admission rejected because the run chain could never make progress.
///
/// Retrying with the same inputs fails the same way, so callers must surface
/// this instead of retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeadlockError {
    #[error(
        "deadlock detected: this run would need {required} concurrency slots in the \
         environment but its limit is {limit}; {holding} ancestor runs are holding \
         environment concurrency while waiting on their children"
    )]
    Environment {
        limit: u32,
        required: u32,
        holding: u32,
    },

    #[error(
        "deadlock detected: this run would need {required} concurrency slots on queue \
         '{queue}' but its limit is {limit}; {holding} ancestor runs in the chain are \
         holding slots on that queue while waiting on their children"
    )]
    Queue {
        queue: String,
        limit: u32,
        required: u32,
        holding: u32,
    },
}

/// Producer-side depth rejection. Safe to retry once the queue drains.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("queue '{queue}' is full: {depth} queued + {adding} new would exceed the maximum of {maximum}")]
pub struct CapacityError {
    pub queue: String,
    pub depth: u64,
    pub adding: u64,
    pub maximum: u64,
}

/// Failure reported by an external collaborator (run store, queue config store,
/// entitlement service).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Errors from run-chain validation.
#[derive(Debug, thiserror::Error)]
pub enum RunChainError {
    #[error(transparent)]
    Deadlock(#[from] DeadlockError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from triggering a run. Exactly one named reason per failure.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("organization {0} is not entitled to trigger runs")]
    Entitlement(String),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Deadlock(#[from] DeadlockError),

    #[error("parent run not found: {0}")]
    ParentRunNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl TriggerError {
    /// Short label for the rejection, used as a metrics attribute.
    pub fn reason(&self) -> &'static str {
        match self {
            TriggerError::Entitlement(_) => "entitlement",
            TriggerError::Capacity(_) => "capacity",
            TriggerError::Deadlock(_) => "deadlock",
            TriggerError::ParentRunNotFound(_) => "parent_not_found",
            TriggerError::Store(_) => "store",
            TriggerError::Broker(_) => "broker",
        }
    }
}

impl From<RunChainError> for TriggerError {
    fn from(err: RunChainError) -> Self {
        match err {
            RunChainError::Deadlock(e) => TriggerError::Deadlock(e),
            RunChainError::Store(e) => TriggerError::Store(e),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_message_names_queue_and_counts() {
        let err = DeadlockError::Queue {
            queue: "emails".to_string(),
            limit: 2,
            required: 3,
            holding: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("'emails'"), "{msg}");
        assert!(msg.contains("need 3"), "{msg}");
        assert!(msg.contains("limit is 2"), "{msg}");
    }

    #[test]
    fn run_chain_error_maps_to_trigger_variants() {
        let deadlock = RunChainError::Deadlock(DeadlockError::Environment {
            limit: 1,
            required: 2,
            holding: 1,
        });
        assert!(matches!(
            TriggerError::from(deadlock),
            TriggerError::Deadlock(DeadlockError::Environment { .. })
        ));

        let store = RunChainError::Store(StoreError("down".to_string()));
        assert!(matches!(TriggerError::from(store), TriggerError::Store(_)));
    }
}
