use crate::error::StorageResult;
use crate::message::Message;
use uuid::Uuid;

/// Represents a single operation in an atomic write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteBatchOp {
    PutMessage { message: Message },
    DeleteMessage { id: Uuid },
    /// Insert `member` into sorted set `set`, or move it to `score` if present.
    ZAdd { set: String, member: String, score: u64 },
    ZRem { set: String, member: String },
    SAdd { set: String, member: String },
    SRem { set: String, member: String },
    PutValue { key: String, value: Vec<u8> },
    DeleteValue { key: String },
}

/// A read-then-write procedure executed by [`Storage::atomically`]. It reads
/// through the view it is given and returns the writes to commit. A script may
/// run more than once if its reads were invalidated before commit, so any
/// state it captures must be reset at the top of the closure.
pub type Script<'a> = dyn FnMut(&dyn StorageRead) -> StorageResult<Vec<WriteBatchOp>> + 'a;

/// Reads over the broker's sorted-set / set / key-value model.
pub trait StorageRead {
    // --- Message bodies ---

    /// Retrieve a message body by ID.
    fn get_message(&self, id: &Uuid) -> StorageResult<Option<Message>>;

    // --- Sorted sets ---

    /// Score of `member` in `set`, if present.
    fn zscore(&self, set: &str, member: &str) -> StorageResult<Option<u64>>;

    /// Members of `set` with score `<= max_score`, lowest score first, at most `limit`.
    fn zrange_by_score(
        &self,
        set: &str,
        max_score: u64,
        limit: usize,
    ) -> StorageResult<Vec<(String, u64)>>;

    /// Number of members in `set`.
    fn zcard(&self, set: &str) -> StorageResult<u64>;

    // --- Plain sets ---

    fn scard(&self, set: &str) -> StorageResult<u64>;

    fn sismember(&self, set: &str, member: &str) -> StorageResult<bool>;

    // --- Values ---

    fn get_value(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;
}

/// The backing store. Implementations must be thread-safe and must make every
/// batch and script atomic on their own; callers take no locks.
pub trait Storage: StorageRead + Send + Sync {
    // --- Writes ---

    /// Atomically apply a batch of write operations across column families.
    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()>;

    /// Run `script` and commit the ops it returns in one batch, as if no other
    /// write happened between the script's reads and the commit. If the script
    /// fails, nothing is written.
    fn atomically(&self, script: &mut Script<'_>) -> StorageResult<()>;

    /// Flush the write-ahead log to disk.
    fn flush(&self) -> StorageResult<()>;
}
