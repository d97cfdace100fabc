use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::lease::LeaseStore;
use crate::broker::metrics::Metrics;
use crate::clock::Clock;
use crate::error::{BrokerError, BrokerResult};

/// Returns leases whose visibility timeout has passed to their queue.
///
/// A reclaimed message keeps its original score, so it is redelivered ahead of
/// anything enqueued after it. This is the only path by which work held by a
/// crashed or stalled worker is recovered.
pub struct Sweeper {
    store: Arc<LeaseStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    batch_size: usize,
}

impl Sweeper {
    pub fn new(
        store: Arc<LeaseStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            batch_size,
        }
    }

    /// Run one pass over at most `batch_size` expired leases. Returns how many
    /// messages were put back on their queue.
    pub fn sweep_once(&self) -> u64 {
        let now = self.clock.now_ms();
        let expired = match self.store.expired(now, self.batch_size) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to scan visibility timeouts");
                return 0;
            }
        };

        let mut reclaimed = 0u64;
        for id in &expired {
            let message = match self.store.message(id) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(msg_id = %id, "expired lease has no body, dropping it");
                    if let Err(e) = self.store.forget(id) {
                        warn!(error = %e, msg_id = %id, "failed to drop orphaned timeout entry");
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, msg_id = %id, "failed to read message for expired lease");
                    continue;
                }
            };

            match self.store.reclaim_expired(id, now) {
                Ok(true) => {
                    debug!(msg_id = %id, queue = %message.queue, "lease expired, message requeued");
                    self.metrics.record_reclaim(&message.queue);
                    reclaimed += 1;
                }
                // Acked, or heartbeated past now, since the scan.
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, msg_id = %id, "failed to requeue expired lease");
                }
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "reclaimed expired leases");
        }
        reclaimed
    }

    /// Start `workers` sweeper threads ticking every `interval`.
    pub fn spawn(
        self: &Arc<Self>,
        workers: usize,
        interval: Duration,
    ) -> BrokerResult<SweeperHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let mut handle = SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            threads: Vec::with_capacity(workers),
        };

        for n in 0..workers {
            let sweeper = Arc::clone(self);
            let rx = shutdown_rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("runq-sweeper-{n}"))
                .spawn(move || {
                    debug!(worker = n, "sweeper started");
                    loop {
                        match rx.recv_timeout(interval) {
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                                sweeper.sweep_once();
                            }
                            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                                break;
                            }
                        }
                    }
                    debug!(worker = n, "sweeper stopped");
                });
            match spawned {
                Ok(thread) => handle.threads.push(thread),
                Err(e) => {
                    // Don't leak the workers that did start.
                    let _ = handle.stop();
                    return Err(BrokerError::SweeperSpawn(e.to_string()));
                }
            }
        }

        Ok(handle)
    }
}

/// Running sweeper threads. Stopping closes the shared shutdown channel, which
/// wakes every worker out of its tick wait.
pub struct SweeperHandle {
    shutdown_tx: Option<crossbeam_channel::Sender<()>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) -> BrokerResult<()> {
        drop(self.shutdown_tx.take());
        let mut panicked = false;
        for thread in self.threads.drain(..) {
            panicked |= thread.join().is_err();
        }
        if panicked {
            return Err(BrokerError::SweeperPanicked);
        }
        Ok(())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
