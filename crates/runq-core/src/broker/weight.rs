//! Per-queue fairness weight: how long the queue's head has waited, blended
//! with how much of its concurrency limit is still free.

use crate::broker::keys;
use crate::broker::lease::LeaseStore;
use crate::error::StorageResult;

const AGE_FACTOR: f64 = 0.8;
const CAPACITY_FACTOR: f64 = 0.2;

/// A candidate queue and the weight it enters the draw with.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedQueue {
    pub queue: String,
    pub weight: f64,
}

/// Fraction of the limit still free, in `[0, 1]`. Unlimited queues are always
/// fully available.
pub fn capacity_weight(limit: Option<u32>, current: u64) -> f64 {
    match limit {
        None => 1.0,
        Some(limit) => {
            let free = u64::from(limit).saturating_sub(current);
            free as f64 / f64::from(limit.max(1))
        }
    }
}

pub fn weight(now: u64, oldest_score: u64, limit: Option<u32>, current: u64) -> f64 {
    let age = now.saturating_sub(oldest_score) as f64;
    age * AGE_FACTOR + capacity_weight(limit, current) * CAPACITY_FACTOR
}

/// Weigh `queue` using its limit (looked up on the base queue, so every
/// concurrency-key partition shares it) and its own leased count.
pub fn weigh_queue(
    store: &LeaseStore,
    queue: &str,
    oldest_score: u64,
    default_limit: Option<u32>,
    now: u64,
) -> StorageResult<WeightedQueue> {
    let limit = store
        .concurrency_limit(keys::base_queue_key(queue))?
        .or(default_limit);
    let current = store.current_concurrency(queue)?;
    Ok(WeightedQueue {
        queue: queue.to_string(),
        weight: weight(now, oldest_score, limit, current),
    })
}
