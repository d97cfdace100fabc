use std::sync::Arc;

use uuid::Uuid;

use crate::broker::keys;
use crate::error::{StorageError, StorageResult};
use crate::message::{Message, Payload};
use crate::storage::keys::{decode_score, encode_score};
use crate::storage::{Storage, StorageRead, WriteBatchOp};

/// A message taken off its queue by [`LeaseStore::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: Uuid,
    /// The message's score at the moment it was leased.
    pub score: u64,
}

/// Inputs to one dequeue attempt against a single queue.
#[derive(Debug, Clone, Copy)]
pub struct DequeueArgs<'a> {
    pub queue: &'a str,
    pub parent_queue: &'a str,
    pub now: u64,
    pub lease_ms: u64,
    /// Limit applied when the queue has none configured. `None` is unlimited.
    pub default_limit: Option<u32>,
}

/// The broker's compound operations. Each one runs as a single
/// [`Storage::atomically`] script: it reads what it needs and commits every
/// index change (pending set, parent index, concurrency set, timeout index,
/// body) in one batch. Missing messages are never an error.
pub struct LeaseStore {
    storage: Arc<dyn Storage>,
}

impl LeaseStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Store the body, add the message to its queue at `message.timestamp`,
    /// and move the queue in its parent index to the new earliest score.
    pub fn enqueue(&self, message: &Message) -> StorageResult<()> {
        let member = message.id.to_string();
        let length_key = keys::queue_length_key(&message.queue);
        self.storage.atomically(&mut |s: &dyn StorageRead| {
            let head = head_after(s, &message.queue, Some(&member), Some(message.timestamp))?;
            let mut ops = vec![
                WriteBatchOp::PutMessage {
                    message: message.clone(),
                },
                WriteBatchOp::ZAdd {
                    set: message.queue.clone(),
                    member: member.clone(),
                    score: message.timestamp,
                },
                rebalance(&message.parent_queue, &message.queue, head),
            ];
            if s.zscore(&message.queue, &member)?.is_none() {
                ops.push(adjust_length(s, &length_key, 1)?);
            }
            Ok(ops)
        })
    }

    /// Lease the earliest due message of one queue, if the queue is under its
    /// concurrency limit. This is the only place a concurrency slot is taken.
    pub fn dequeue(&self, args: DequeueArgs<'_>) -> StorageResult<Option<Lease>> {
        let limit_key = keys::concurrency_limit_key(args.queue);
        let current_key = keys::current_concurrency_key(args.queue);
        let length_key = keys::queue_length_key(args.queue);
        let mut leased = None;

        self.storage.atomically(&mut |s: &dyn StorageRead| {
            leased = None;
            if let Some(limit) = read_limit(s, &limit_key)?.or(args.default_limit) {
                if s.scard(&current_key)? >= u64::from(limit) {
                    return Ok(Vec::new());
                }
            }

            let Some((member, score)) = s.zrange_by_score(args.queue, args.now, 1)?.pop() else {
                // Nothing due. Re-sync the parent entry so drained queues drop out.
                let head = head_after(s, args.queue, None, None)?;
                return Ok(vec![rebalance(args.parent_queue, args.queue, head)]);
            };
            let id = parse_member(&member)?;
            let head = head_after(s, args.queue, Some(&member), None)?;

            leased = Some(Lease { id, score });
            Ok(vec![
                WriteBatchOp::ZRem {
                    set: args.queue.to_string(),
                    member: member.clone(),
                },
                WriteBatchOp::ZAdd {
                    set: keys::TIMEOUT_INDEX.to_string(),
                    member: member.clone(),
                    score: args.now.saturating_add(args.lease_ms),
                },
                WriteBatchOp::SAdd {
                    set: current_key.clone(),
                    member,
                },
                WriteBatchOp::PutValue {
                    key: keys::lease_key(&id),
                    value: args.now.to_be_bytes().to_vec(),
                },
                rebalance(args.parent_queue, args.queue, head),
                adjust_length(s, &length_key, -1)?,
            ])
        })?;

        Ok(leased)
    }

    /// Delete the body and drop the message from every index. Returns whether
    /// a body existed. Idempotent.
    pub fn acknowledge(&self, id: &Uuid) -> StorageResult<bool> {
        let member = id.to_string();
        let mut existed = false;

        self.storage.atomically(&mut |s: &dyn StorageRead| {
            existed = false;
            let mut ops = release_ops(id, &member);
            let Some(message) = s.get_message(id)? else {
                return Ok(ops);
            };
            existed = true;

            ops.push(WriteBatchOp::DeleteMessage { id: *id });
            ops.push(WriteBatchOp::SRem {
                set: keys::current_concurrency_key(&message.queue),
                member: member.clone(),
            });
            if s.zscore(&message.queue, &member)?.is_some() {
                let head = head_after(s, &message.queue, Some(&member), None)?;
                ops.push(WriteBatchOp::ZRem {
                    set: message.queue.clone(),
                    member: member.clone(),
                });
                ops.push(rebalance(&message.parent_queue, &message.queue, head));
                ops.push(adjust_length(
                    s,
                    &keys::queue_length_key(&message.queue),
                    -1,
                )?);
            }
            Ok(ops)
        })?;

        Ok(existed)
    }

    /// Return a leased message to its queue at `retry_at`, or at its current
    /// score when `None`, freeing its concurrency slot and counting the attempt.
    /// Ignored unless the message is still in the timeout index, so a stale
    /// nack can never resurrect a message that was acked or already requeued.
    pub fn negative_acknowledge(&self, id: &Uuid, retry_at: Option<u64>) -> StorageResult<bool> {
        self.requeue(id, retry_at, None)
    }

    /// Requeue a leased message at its current score, but only if its lease
    /// is still expired at `now`. A heartbeat that landed after the caller
    /// found the lease expired keeps the lease alive.
    pub fn reclaim_expired(&self, id: &Uuid, now: u64) -> StorageResult<bool> {
        self.requeue(id, None, Some(now))
    }

    fn requeue(
        &self,
        id: &Uuid,
        retry_at: Option<u64>,
        expired_at: Option<u64>,
    ) -> StorageResult<bool> {
        let member = id.to_string();
        let mut requeued = false;

        self.storage.atomically(&mut |s: &dyn StorageRead| {
            requeued = false;
            let Some(expires_at) = s.zscore(keys::TIMEOUT_INDEX, &member)? else {
                return Ok(Vec::new());
            };
            if expired_at.is_some_and(|now| expires_at > now) {
                return Ok(Vec::new());
            }
            let mut ops = release_ops(id, &member);
            let Some(mut message) = s.get_message(id)? else {
                return Ok(ops);
            };

            let score = retry_at.unwrap_or(message.timestamp);
            message.timestamp = score;
            message.attempt += 1;
            let head = head_after(s, &message.queue, Some(&member), Some(score))?;

            ops.push(WriteBatchOp::SRem {
                set: keys::current_concurrency_key(&message.queue),
                member: member.clone(),
            });
            if s.zscore(&message.queue, &member)?.is_none() {
                ops.push(adjust_length(
                    s,
                    &keys::queue_length_key(&message.queue),
                    1,
                )?);
            }
            ops.push(WriteBatchOp::ZAdd {
                set: message.queue.clone(),
                member: member.clone(),
                score,
            });
            ops.push(rebalance(&message.parent_queue, &message.queue, head));
            ops.push(WriteBatchOp::PutMessage { message });
            requeued = true;
            Ok(ops)
        })?;

        Ok(requeued)
    }

    /// Push a lease's expiry out by `extend_ms`, never past `max_timeout_at`.
    /// Returns false if the message is not leased.
    pub fn heartbeat(&self, id: &Uuid, extend_ms: u64, max_timeout_at: u64) -> StorageResult<bool> {
        let member = id.to_string();
        let mut alive = false;

        self.storage.atomically(&mut |s: &dyn StorageRead| {
            alive = false;
            let Some(expires_at) = s.zscore(keys::TIMEOUT_INDEX, &member)? else {
                return Ok(Vec::new());
            };
            alive = true;
            let extended = expires_at.saturating_add(extend_ms).min(max_timeout_at);
            if extended <= expires_at {
                return Ok(Vec::new());
            }
            Ok(vec![WriteBatchOp::ZAdd {
                set: keys::TIMEOUT_INDEX.to_string(),
                member: member.clone(),
                score: extended,
            }])
        })?;

        Ok(alive)
    }

    /// Swap a message's payload and re-enqueue it at `timestamp` in one step:
    /// any lease is released, queue, parent queue and concurrency key are kept.
    /// Returns false if the message does not exist.
    pub fn replace(&self, id: &Uuid, payload: &Payload, timestamp: u64) -> StorageResult<bool> {
        let member = id.to_string();
        let mut replaced = false;

        self.storage.atomically(&mut |s: &dyn StorageRead| {
            replaced = false;
            let Some(mut message) = s.get_message(id)? else {
                return Ok(Vec::new());
            };
            message.payload = payload.clone();
            message.timestamp = timestamp;
            let head = head_after(s, &message.queue, Some(&member), Some(timestamp))?;

            let mut ops = release_ops(id, &member);
            ops.push(WriteBatchOp::SRem {
                set: keys::current_concurrency_key(&message.queue),
                member: member.clone(),
            });
            if s.zscore(&message.queue, &member)?.is_none() {
                ops.push(adjust_length(
                    s,
                    &keys::queue_length_key(&message.queue),
                    1,
                )?);
            }
            ops.push(WriteBatchOp::ZAdd {
                set: message.queue.clone(),
                member: member.clone(),
                score: timestamp,
            });
            ops.push(rebalance(&message.parent_queue, &message.queue, head));
            ops.push(WriteBatchOp::PutMessage { message });
            replaced = true;
            Ok(ops)
        })?;

        Ok(replaced)
    }

    /// Drop a timeout-index entry whose body no longer exists.
    pub fn forget(&self, id: &Uuid) -> StorageResult<()> {
        self.storage.write_batch(release_ops(id, &id.to_string()))
    }

    pub fn update_queue_concurrency(&self, queue: &str, limit: u32) -> StorageResult<()> {
        self.storage.write_batch(vec![WriteBatchOp::PutValue {
            key: keys::concurrency_limit_key(queue),
            value: limit.to_string().into_bytes(),
        }])
    }

    pub fn remove_queue_concurrency(&self, queue: &str) -> StorageResult<()> {
        self.storage.write_batch(vec![WriteBatchOp::DeleteValue {
            key: keys::concurrency_limit_key(queue),
        }])
    }

    // --- Reads ---

    pub fn message(&self, id: &Uuid) -> StorageResult<Option<Message>> {
        self.storage.get_message(id)
    }

    /// Pending messages in one concrete queue (one concurrency-key partition).
    pub fn queue_length(&self, queue: &str) -> StorageResult<u64> {
        self.storage.zcard(queue)
    }

    /// Pending messages across every partition of `queue`'s base queue.
    pub fn logical_queue_length(&self, queue: &str) -> StorageResult<u64> {
        read_length(self.storage.as_ref(), &keys::queue_length_key(queue))
    }

    pub fn current_concurrency(&self, queue: &str) -> StorageResult<u64> {
        self.storage.scard(&keys::current_concurrency_key(queue))
    }

    /// Configured limit for the queue's base name, if any.
    pub fn concurrency_limit(&self, queue: &str) -> StorageResult<Option<u32>> {
        read_limit(self.storage.as_ref(), &keys::concurrency_limit_key(queue))
    }

    pub fn oldest_message_score(&self, queue: &str) -> StorageResult<Option<u64>> {
        Ok(self
            .storage
            .zrange_by_score(queue, u64::MAX, 1)?
            .pop()
            .map(|(_, score)| score))
    }

    /// Queues in a parent index whose earliest message is due, oldest first.
    pub fn parent_candidates(
        &self,
        parent_queue: &str,
        now: u64,
        limit: usize,
    ) -> StorageResult<Vec<(String, u64)>> {
        self.storage.zrange_by_score(parent_queue, now, limit)
    }

    /// Leased messages whose visibility timeout is at or before `now`.
    pub fn expired(&self, now: u64, limit: usize) -> StorageResult<Vec<Uuid>> {
        self.storage
            .zrange_by_score(keys::TIMEOUT_INDEX, now, limit)?
            .into_iter()
            .map(|(member, _)| parse_member(&member))
            .collect()
    }

    /// Lease expiry of an in-flight message.
    pub fn lease_expiry(&self, id: &Uuid) -> StorageResult<Option<u64>> {
        self.storage.zscore(keys::TIMEOUT_INDEX, &id.to_string())
    }

    /// When the current lease on `id` was taken.
    pub fn lease_started_at(&self, id: &Uuid) -> StorageResult<Option<u64>> {
        match self.storage.get_value(&keys::lease_key(id))? {
            Some(raw) => decode_score(&raw)
                .map(Some)
                .ok_or_else(|| StorageError::CorruptData(format!("lease record for {id}"))),
            None => Ok(None),
        }
    }
}

/// Ops that end a lease regardless of what happens to the message next.
fn release_ops(id: &Uuid, member: &str) -> Vec<WriteBatchOp> {
    vec![
        WriteBatchOp::ZRem {
            set: keys::TIMEOUT_INDEX.to_string(),
            member: member.to_string(),
        },
        WriteBatchOp::DeleteValue {
            key: keys::lease_key(id),
        },
    ]
}

/// Earliest score `queue` will have once `removing` is taken out and a member
/// at `adding` is put in.
fn head_after<S: StorageRead + ?Sized>(
    s: &S,
    queue: &str,
    removing: Option<&str>,
    adding: Option<u64>,
) -> StorageResult<Option<u64>> {
    let head = s
        .zrange_by_score(queue, u64::MAX, 2)?
        .into_iter()
        .find(|(member, _)| Some(member.as_str()) != removing)
        .map(|(_, score)| score);
    Ok(match (head, adding) {
        (Some(h), Some(a)) => Some(h.min(a)),
        (h, a) => h.or(a),
    })
}

fn rebalance(parent_queue: &str, queue: &str, head: Option<u64>) -> WriteBatchOp {
    match head {
        Some(score) => WriteBatchOp::ZAdd {
            set: parent_queue.to_string(),
            member: queue.to_string(),
            score,
        },
        None => WriteBatchOp::ZRem {
            set: parent_queue.to_string(),
            member: queue.to_string(),
        },
    }
}

fn read_limit<S: StorageRead + ?Sized>(s: &S, limit_key: &str) -> StorageResult<Option<u32>> {
    let Some(raw) = s.get_value(limit_key)? else {
        return Ok(None);
    };
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .map(Some)
        .ok_or_else(|| StorageError::CorruptData(format!("concurrency limit at {limit_key}")))
}

fn read_length<S: StorageRead + ?Sized>(s: &S, length_key: &str) -> StorageResult<u64> {
    match s.get_value(length_key)? {
        Some(raw) => decode_score(&raw)
            .ok_or_else(|| StorageError::CorruptData(format!("queue length at {length_key}"))),
        None => Ok(0),
    }
}

/// Write the queue length moved by `delta`, clamped at zero.
fn adjust_length<S: StorageRead + ?Sized>(
    s: &S,
    length_key: &str,
    delta: i64,
) -> StorageResult<WriteBatchOp> {
    let length = read_length(s, length_key)?.saturating_add_signed(delta);
    Ok(WriteBatchOp::PutValue {
        key: length_key.to_string(),
        value: encode_score(length).to_vec(),
    })
}

fn parse_member(member: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(member)
        .map_err(|e| StorageError::CorruptData(format!("message id {member}: {e}")))
}
