pub mod keys;
pub mod lease;
pub mod metrics;
pub mod scope;
pub mod selector;
pub mod stats;
pub mod sweeper;
pub mod weight;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{BrokerConfig, RunqConfig};
use crate::error::BrokerResult;
use crate::message::{Message, Payload};
use crate::storage::Storage;

pub use lease::{DequeueArgs, Lease, LeaseStore};
pub use metrics::Metrics;
pub use scope::{EnvironmentKind, QueueScope, WorkerGroup};
pub use stats::QueueStats;
pub use sweeper::{Sweeper, SweeperHandle};
pub use weight::WeightedQueue;
pub use worker::{Handler, Outcome, Worker, WorkerHandle};

/// The queue broker. Owns the lease store and the visibility sweeper threads.
///
/// Every state change goes through one atomic lease-store operation, so any
/// number of brokers (in this process or others) can share one store; there is
/// no coordinator. Dequeue never blocks: it returns `None` when nothing is
/// eligible and callers poll.
pub struct Broker {
    store: Arc<LeaseStore>,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
    metrics: Arc<Metrics>,
    sweeper: Arc<Sweeper>,
    sweeper_handle: Option<SweeperHandle>,
}

impl Broker {
    /// Create a broker on the system clock, spawning the configured sweepers.
    pub fn new(config: &RunqConfig, storage: Arc<dyn Storage>) -> BrokerResult<Self> {
        Self::with_clock(config, storage, Arc::new(SystemClock))
    }

    #[tracing::instrument(skip_all, fields(sweepers = config.sweeper.workers))]
    pub fn with_clock(
        config: &RunqConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> BrokerResult<Self> {
        let store = Arc::new(LeaseStore::new(storage));
        let metrics = Arc::new(Metrics::new());
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            config.sweeper.batch_size,
        ));

        let sweeper_handle = if config.sweeper.workers > 0 {
            Some(sweeper.spawn(
                config.sweeper.workers,
                Duration::from_millis(config.sweeper.interval_ms),
            )?)
        } else {
            None
        };

        info!("broker started");

        Ok(Self {
            store,
            clock,
            config: config.broker.clone(),
            metrics,
            sweeper,
            sweeper_handle,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Enqueue a message due now.
    pub fn enqueue(
        &self,
        scope: &QueueScope,
        queue_name: &str,
        id: Uuid,
        payload: Payload,
        concurrency_key: Option<&str>,
    ) -> BrokerResult<()> {
        let now = self.clock.now_ms();
        self.enqueue_at(scope, queue_name, id, payload, concurrency_key, now)
    }

    /// Enqueue a message that becomes eligible at `timestamp` (ms).
    #[tracing::instrument(skip_all, fields(queue = %queue_name, msg_id = %id, concurrency_key = ?concurrency_key))]
    pub fn enqueue_at(
        &self,
        scope: &QueueScope,
        queue_name: &str,
        id: Uuid,
        payload: Payload,
        concurrency_key: Option<&str>,
        timestamp: u64,
    ) -> BrokerResult<()> {
        let message = Message {
            id,
            queue: keys::queue_key(scope, queue_name, concurrency_key),
            parent_queue: scope.worker_group().parent_queue_key(),
            concurrency_key: concurrency_key.map(str::to_string),
            organization_id: scope.organization_id.clone(),
            environment_id: scope.environment_id.clone(),
            payload,
            timestamp,
            attempt: 0,
        };
        self.store.enqueue(&message)?;
        self.metrics.record_enqueue(&message.queue);
        debug!(parent_queue = %message.parent_queue, "message enqueued");
        Ok(())
    }

    /// Lease one message for `group`, or `None` if no queue it drains has an
    /// eligible message under its concurrency limit.
    ///
    /// Due queues are weighed and drawn at random; if the chosen queue turns
    /// out to be at capacity the draw is repeated over the rest.
    #[tracing::instrument(skip_all, fields(parent_queue = tracing::field::Empty))]
    pub fn dequeue(&self, group: &WorkerGroup) -> BrokerResult<Option<Message>> {
        let parent_queue = group.parent_queue_key();
        tracing::Span::current().record("parent_queue", parent_queue.as_str());
        let now = self.clock.now_ms();
        let default_limit = self.config.default_concurrency_limit;

        let mut candidates = self
            .store
            .parent_candidates(&parent_queue, now, self.config.parent_queue_selection_limit)?
            .into_iter()
            .map(|(queue, oldest)| {
                weight::weigh_queue(&self.store, &queue, oldest, default_limit, now)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rng = rand::rng();
        while let Some(i) = selector::select(&candidates, &mut rng) {
            let chosen = candidates.remove(i);
            let leased = self.store.dequeue(DequeueArgs {
                queue: &chosen.queue,
                parent_queue: &parent_queue,
                now,
                lease_ms: self.config.visibility_timeout_ms,
                default_limit,
            })?;
            let Some(lease) = leased else {
                debug!(queue = %chosen.queue, "queue at capacity or drained, redrawing");
                continue;
            };
            // Acked by someone else between the lease and this read.
            let Some(message) = self.store.message(&lease.id)? else {
                continue;
            };
            self.metrics.record_lease(&message.queue);
            debug!(
                queue = %message.queue,
                msg_id = %message.id,
                concurrency_key = ?message.concurrency_key,
                "message leased"
            );
            return Ok(Some(message));
        }
        Ok(None)
    }

    /// Dequeue for an environment's own (development) workers.
    pub fn dequeue_in_environment(
        &self,
        organization_id: &str,
        environment_id: &str,
    ) -> BrokerResult<Option<Message>> {
        self.dequeue(&WorkerGroup::Unmanaged {
            organization_id: organization_id.to_string(),
            environment_id: environment_id.to_string(),
        })
    }

    /// Dequeue for the shared worker fleet.
    pub fn dequeue_shared(&self) -> BrokerResult<Option<Message>> {
        self.dequeue(&WorkerGroup::Managed)
    }

    /// Complete a message. Returns false if it was already gone.
    #[tracing::instrument(skip_all, fields(msg_id = %id))]
    pub fn acknowledge(&self, id: &Uuid) -> BrokerResult<bool> {
        let message = self.store.message(id)?;
        let acked = self.store.acknowledge(id)?;
        if let Some(message) = message.filter(|_| acked) {
            self.metrics.record_ack(&message.queue);
            debug!(queue = %message.queue, "message acknowledged");
        }
        Ok(acked)
    }

    /// Return a leased message to its queue at `retry_at`, or at its original
    /// score. Returns false if the message is not currently leased.
    #[tracing::instrument(skip_all, fields(msg_id = %id, retry_at = ?retry_at))]
    pub fn negative_acknowledge(&self, id: &Uuid, retry_at: Option<u64>) -> BrokerResult<bool> {
        let requeued = self.store.negative_acknowledge(id, retry_at)?;
        if requeued {
            if let Some(message) = self.store.message(id)? {
                self.metrics.record_nack(&message.queue);
                debug!(queue = %message.queue, attempt = message.attempt, "message requeued");
            }
        }
        Ok(requeued)
    }

    /// Extend a lease by `seconds`, capped at the lease start plus the maximum
    /// visibility timeout. Returns false if the message is not leased.
    #[tracing::instrument(skip_all, fields(msg_id = %id, seconds = seconds))]
    pub fn heartbeat(&self, id: &Uuid, seconds: u64) -> BrokerResult<bool> {
        let Some(started_at) = self.store.lease_started_at(id)? else {
            return Ok(false);
        };
        let ceiling = started_at.saturating_add(self.config.max_visibility_timeout_ms);
        let alive = self
            .store
            .heartbeat(id, seconds.saturating_mul(1_000), ceiling)?;
        if alive {
            if let Some(message) = self.store.message(id)? {
                self.metrics.record_heartbeat(&message.queue);
            }
        }
        Ok(alive)
    }

    /// Swap a message's payload and put it back on its queue at `timestamp`
    /// (default now), releasing any lease. Returns false if it does not exist.
    #[tracing::instrument(skip_all, fields(msg_id = %id, timestamp = ?timestamp))]
    pub fn replace(&self, id: &Uuid, payload: Payload, timestamp: Option<u64>) -> BrokerResult<bool> {
        let timestamp = timestamp.unwrap_or_else(|| self.clock.now_ms());
        Ok(self.store.replace(id, &payload, timestamp)?)
    }

    #[tracing::instrument(skip_all, fields(queue = %queue_name, limit = limit))]
    pub fn update_queue_concurrency(
        &self,
        scope: &QueueScope,
        queue_name: &str,
        limit: u32,
    ) -> BrokerResult<()> {
        self.store
            .update_queue_concurrency(&keys::queue_key(scope, queue_name, None), limit)?;
        info!("queue concurrency limit updated");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(queue = %queue_name))]
    pub fn remove_queue_concurrency(&self, scope: &QueueScope, queue_name: &str) -> BrokerResult<()> {
        self.store
            .remove_queue_concurrency(&keys::queue_key(scope, queue_name, None))?;
        info!("queue concurrency limit removed");
        Ok(())
    }

    /// Pending messages in a queue (the base queue when `concurrency_key` is
    /// `None`). Also refreshes the depth and in-flight gauges.
    pub fn queue_stats(
        &self,
        scope: &QueueScope,
        queue_name: &str,
        concurrency_key: Option<&str>,
    ) -> BrokerResult<QueueStats> {
        let queue = keys::queue_key(scope, queue_name, concurrency_key);
        let now = self.clock.now_ms();
        let stats = QueueStats {
            depth: self.store.queue_length(&queue)?,
            in_flight: self.store.current_concurrency(&queue)?,
            concurrency_limit: self.store.concurrency_limit(&queue)?,
            oldest_message_age_ms: self
                .store
                .oldest_message_score(&queue)?
                .map(|score| now.saturating_sub(score)),
            queue,
        };
        self.metrics.set_queue_depth(&stats.queue, stats.depth);
        self.metrics.set_leases_active(&stats.queue, stats.in_flight);
        Ok(stats)
    }

    /// Pending messages in a logical queue, summed over all of its
    /// concurrency-key partitions.
    pub fn queue_depth(&self, scope: &QueueScope, queue_name: &str) -> BrokerResult<u64> {
        Ok(self
            .store
            .logical_queue_length(&keys::queue_key(scope, queue_name, None))?)
    }

    pub fn read_message(&self, id: &Uuid) -> BrokerResult<Option<Message>> {
        Ok(self.store.message(id)?)
    }

    /// Run one sweep pass now, independent of the background workers.
    pub fn sweep_expired(&self) -> u64 {
        self.sweeper.sweep_once()
    }

    /// Stop the sweeper threads and flush the store.
    #[tracing::instrument(skip_all)]
    pub fn shutdown(mut self) -> BrokerResult<()> {
        info!("initiating broker shutdown");
        if let Some(mut handle) = self.sweeper_handle.take() {
            handle.stop()?;
        }
        self.store.storage().flush()?;
        info!("broker shutdown complete");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(mut handle) = self.sweeper_handle.take() {
            let _ = handle.stop();
        }
    }
}
