use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, MultiThreaded,
    OptimisticTransactionDB, Options, Transaction,
};
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::message::Message;
use crate::storage::keys;
use crate::storage::traits::{Script, Storage, StorageRead, WriteBatchOp};

const CF_MESSAGES: &str = "messages";
const CF_ZSETS: &str = "zsets";
const CF_ZSCORES: &str = "zscores";
const CF_SETS: &str = "sets";
const CF_KV: &str = "kv";
/// One key per sorted or plain set, rewritten whenever the set changes. Reads
/// of a set inside a transaction track this key, so a concurrent change to any
/// member (or a range scan's phantom) fails the commit.
const CF_VERSIONS: &str = "versions";

/// All column family names (excluding `default` which RocksDB creates automatically).
const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_ZSETS, CF_ZSCORES, CF_SETS, CF_KV, CF_VERSIONS];

const MAX_COMMIT_ATTEMPTS: u32 = 128;
/// Upper bound on the jittered pause before rerunning a conflicted script.
const MAX_BACKOFF_MICROS: u64 = 2_000;

type DB = OptimisticTransactionDB<MultiThreaded>;

/// RocksDB-backed storage implementation.
///
/// Sorted sets are stored twice: ordering keys `{set}:{score}:{member}` in
/// `zsets` for range scans, and `{set}:{member} -> score` in `zscores` for
/// point lookups and removal. Both are always written in the same transaction.
///
/// Every write goes through an optimistic transaction. Scripts read with
/// `get_for_update`; if anything they read changed before commit, RocksDB
/// rejects the commit and the script runs again.
pub struct RocksDbStorage {
    db: DB,
}

impl RocksDbStorage {
    /// Open or create a RocksDB database at the given path with all column families.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {name}")))
    }

    /// Stage `ops` on `txn`, bumping the version of every set they touch.
    fn stage(&self, txn: &Transaction<'_, DB>, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let messages = self.cf(CF_MESSAGES)?;
        let zsets = self.cf(CF_ZSETS)?;
        let zscores = self.cf(CF_ZSCORES)?;
        let sets = self.cf(CF_SETS)?;
        let kv = self.cf(CF_KV)?;
        let versions = self.cf(CF_VERSIONS)?;

        // Scores staged earlier in this transaction, so a ZAdd followed by a
        // ZRem of the same member removes the right ordering key.
        let mut staged_scores: HashMap<(String, String), Option<u64>> = HashMap::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for op in ops {
            match op {
                WriteBatchOp::PutMessage { message } => {
                    let value = serde_json::to_vec(&message)?;
                    txn.put_cf(&messages, message.id.as_bytes(), &value)?;
                }
                WriteBatchOp::DeleteMessage { id } => {
                    txn.delete_cf(&messages, id.as_bytes())?;
                }
                WriteBatchOp::ZAdd { set, member, score } => {
                    let current = match staged_scores.get(&(set.clone(), member.clone())) {
                        Some(staged) => *staged,
                        None => stored_score(txn, &zscores, &set, &member)?,
                    };
                    if let Some(old) = current {
                        txn.delete_cf(&zsets, keys::zset_entry_key(&set, old, &member)?)?;
                    }
                    txn.put_cf(&zsets, keys::zset_entry_key(&set, score, &member)?, b"")?;
                    txn.put_cf(
                        &zscores,
                        keys::member_key(&set, &member)?,
                        keys::encode_score(score),
                    )?;
                    staged_scores.insert((set.clone(), member), Some(score));
                    touched.insert(set);
                }
                WriteBatchOp::ZRem { set, member } => {
                    let current = match staged_scores.get(&(set.clone(), member.clone())) {
                        Some(staged) => *staged,
                        None => stored_score(txn, &zscores, &set, &member)?,
                    };
                    if let Some(old) = current {
                        txn.delete_cf(&zsets, keys::zset_entry_key(&set, old, &member)?)?;
                        txn.delete_cf(&zscores, keys::member_key(&set, &member)?)?;
                        touched.insert(set.clone());
                    }
                    staged_scores.insert((set, member), None);
                }
                WriteBatchOp::SAdd { set, member } => {
                    txn.put_cf(&sets, keys::member_key(&set, &member)?, b"")?;
                    touched.insert(set);
                }
                WriteBatchOp::SRem { set, member } => {
                    txn.delete_cf(&sets, keys::member_key(&set, &member)?)?;
                    touched.insert(set);
                }
                WriteBatchOp::PutValue { key, value } => {
                    txn.put_cf(&kv, key.as_bytes(), &value)?;
                }
                WriteBatchOp::DeleteValue { key } => {
                    txn.delete_cf(&kv, key.as_bytes())?;
                }
            }
        }

        for set in touched {
            txn.put_cf(&versions, keys::set_prefix(&set)?, b"")?;
        }
        Ok(())
    }
}

fn stored_score(
    txn: &Transaction<'_, DB>,
    zscores: &Arc<BoundColumnFamily<'_>>,
    set: &str,
    member: &str,
) -> StorageResult<Option<u64>> {
    match txn.get_for_update_cf(zscores, keys::member_key(set, member)?, true)? {
        Some(raw) => keys::decode_score(&raw)
            .map(Some)
            .ok_or_else(|| StorageError::CorruptData(format!("score for {member} in {set}"))),
        None => Ok(None),
    }
}

fn is_conflict(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

/// Where reads come from: committed state, or a transaction that tracks them.
trait Source {
    fn get(&self, cf: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Visit keys of `cf` starting with `prefix` in order until `visit`
    /// returns false.
    fn scan(
        &self,
        cf: &str,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8]) -> StorageResult<bool>,
    ) -> StorageResult<()>;

    /// Record that the caller's result depends on the whole of `set`.
    fn watch(&self, set: &str) -> StorageResult<()>;
}

impl Source for RocksDbStorage {
    fn get(&self, cf: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.db.get_cf(&self.cf(cf)?, key)?)
    }

    fn scan(
        &self,
        cf: &str,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8]) -> StorageResult<bool>,
    ) -> StorageResult<()> {
        let cf = self.cf(cf)?;
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) || !visit(&key)? {
                break;
            }
        }
        Ok(())
    }

    fn watch(&self, _set: &str) -> StorageResult<()> {
        Ok(())
    }
}

/// The view a script reads through.
struct TxnView<'v, 'db> {
    storage: &'db RocksDbStorage,
    txn: &'v Transaction<'db, DB>,
}

impl Source for TxnView<'_, '_> {
    fn get(&self, cf: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.txn.get_for_update_cf(&self.storage.cf(cf)?, key, true)?)
    }

    fn scan(
        &self,
        cf: &str,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8]) -> StorageResult<bool>,
    ) -> StorageResult<()> {
        let cf = self.storage.cf(cf)?;
        for item in self
            .txn
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) || !visit(&key)? {
                break;
            }
        }
        Ok(())
    }

    fn watch(&self, set: &str) -> StorageResult<()> {
        let versions = self.storage.cf(CF_VERSIONS)?;
        self.txn
            .get_for_update_cf(&versions, keys::set_prefix(set)?, true)?;
        Ok(())
    }
}

fn read_message(src: &impl Source, id: &Uuid) -> StorageResult<Option<Message>> {
    match src.get(CF_MESSAGES, id.as_bytes())? {
        Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
        None => Ok(None),
    }
}

fn read_zscore(src: &impl Source, set: &str, member: &str) -> StorageResult<Option<u64>> {
    src.watch(set)?;
    match src.get(CF_ZSCORES, &keys::member_key(set, member)?)? {
        Some(value) => keys::decode_score(&value)
            .map(Some)
            .ok_or_else(|| StorageError::CorruptData(format!("score for {member} in {set}"))),
        None => Ok(None),
    }
}

fn read_zrange(
    src: &impl Source,
    set: &str,
    max_score: u64,
    limit: usize,
) -> StorageResult<Vec<(String, u64)>> {
    src.watch(set)?;
    let prefix = keys::set_prefix(set)?;
    let bound = keys::zset_score_bound(set, max_score)?;
    let mut results = Vec::new();
    if limit == 0 {
        return Ok(results);
    }
    src.scan(CF_ZSETS, &prefix, &mut |key| {
        if key > bound.as_slice() {
            return Ok(false);
        }
        let (score, member) = keys::parse_zset_entry_key(key, prefix.len())
            .ok_or_else(|| StorageError::CorruptData(format!("sorted set entry in {set}")))?;
        results.push((member, score));
        Ok(results.len() < limit)
    })?;
    Ok(results)
}

fn count_members(src: &impl Source, cf: &str, set: &str) -> StorageResult<u64> {
    src.watch(set)?;
    let mut count = 0u64;
    src.scan(cf, &keys::set_prefix(set)?, &mut |_| {
        count += 1;
        Ok(true)
    })?;
    Ok(count)
}

fn read_sismember(src: &impl Source, set: &str, member: &str) -> StorageResult<bool> {
    src.watch(set)?;
    Ok(src.get(CF_SETS, &keys::member_key(set, member)?)?.is_some())
}

impl StorageRead for RocksDbStorage {
    fn get_message(&self, id: &Uuid) -> StorageResult<Option<Message>> {
        read_message(self, id)
    }

    fn zscore(&self, set: &str, member: &str) -> StorageResult<Option<u64>> {
        read_zscore(self, set, member)
    }

    fn zrange_by_score(
        &self,
        set: &str,
        max_score: u64,
        limit: usize,
    ) -> StorageResult<Vec<(String, u64)>> {
        read_zrange(self, set, max_score, limit)
    }

    fn zcard(&self, set: &str) -> StorageResult<u64> {
        count_members(self, CF_ZSCORES, set)
    }

    fn scard(&self, set: &str) -> StorageResult<u64> {
        count_members(self, CF_SETS, set)
    }

    fn sismember(&self, set: &str, member: &str) -> StorageResult<bool> {
        read_sismember(self, set, member)
    }

    fn get_value(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.get(CF_KV, key.as_bytes())
    }
}

impl StorageRead for TxnView<'_, '_> {
    fn get_message(&self, id: &Uuid) -> StorageResult<Option<Message>> {
        read_message(self, id)
    }

    fn zscore(&self, set: &str, member: &str) -> StorageResult<Option<u64>> {
        read_zscore(self, set, member)
    }

    fn zrange_by_score(
        &self,
        set: &str,
        max_score: u64,
        limit: usize,
    ) -> StorageResult<Vec<(String, u64)>> {
        read_zrange(self, set, max_score, limit)
    }

    fn zcard(&self, set: &str) -> StorageResult<u64> {
        count_members(self, CF_ZSCORES, set)
    }

    fn scard(&self, set: &str) -> StorageResult<u64> {
        count_members(self, CF_SETS, set)
    }

    fn sismember(&self, set: &str, member: &str) -> StorageResult<bool> {
        read_sismember(self, set, member)
    }

    fn get_value(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.get(CF_KV, key.as_bytes())
    }
}

impl Storage for RocksDbStorage {
    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.atomically(&mut |_: &dyn StorageRead| Ok(ops.clone()))
    }

    fn atomically(&self, script: &mut Script<'_>) -> StorageResult<()> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let txn = self.db.transaction();
            let ops = script(&TxnView {
                storage: self,
                txn: &txn,
            })?;
            if ops.is_empty() {
                return Ok(());
            }
            self.stage(&txn, ops)?;
            match txn.commit() {
                Ok(()) => return Ok(()),
                Err(e) if is_conflict(&e) => {
                    debug!(attempt, error = %e, "transaction conflict, rerunning script");
                    let ceiling = (u64::from(attempt) * 20).min(MAX_BACKOFF_MICROS);
                    std::thread::sleep(Duration::from_micros(
                        rand::rng().random_range(0..=ceiling),
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorageError::Conflict(MAX_COMMIT_ATTEMPTS))
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}
