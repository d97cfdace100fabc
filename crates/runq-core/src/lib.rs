pub mod admission;
pub mod broker;
pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod storage;
pub mod telemetry;

pub use admission::{Environment, RunHandle, TriggerRequest, TriggerService};
pub use broker::{Broker, EnvironmentKind, QueueScope, WorkerGroup};
pub use chain::{RunChainState, RunChainTracker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RunqConfig;
pub use error::{
    BrokerError, BrokerResult, CapacityError, DeadlockError, RunChainError, StorageError,
    StorageResult, StoreError, TriggerError,
};
pub use message::{Message, Payload};
pub use queue::QueueConfig;
pub use storage::{RocksDbStorage, Storage, StorageRead, WriteBatchOp};
