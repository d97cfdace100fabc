use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::{Broker, WorkerGroup};
use crate::error::{BrokerError, BrokerResult};
use crate::message::Message;

/// How a handler settled a leased message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// Put it back, at `retry_at` or at its current score.
    Nack { retry_at: Option<u64> },
}

/// Processes one leased message. Called from worker threads.
pub trait Handler: Send + Sync {
    fn handle(&self, message: &Message) -> Outcome;
}

/// Polls a worker group for leased messages and settles each with a handler.
pub struct Worker {
    broker: Arc<Broker>,
    group: WorkerGroup,
    handler: Arc<dyn Handler>,
}

impl Worker {
    pub fn new(broker: Arc<Broker>, group: WorkerGroup, handler: Arc<dyn Handler>) -> Self {
        Self {
            broker,
            group,
            handler,
        }
    }

    /// Lease one message, hand it to the handler and settle it. Returns
    /// whether anything was leased.
    pub fn poll_once(&self) -> BrokerResult<bool> {
        let Some(message) = self.broker.dequeue(&self.group)? else {
            return Ok(false);
        };
        match self.handler.handle(&message) {
            Outcome::Ack => {
                self.broker.acknowledge(&message.id)?;
            }
            Outcome::Nack { retry_at } => {
                debug!(msg_id = %message.id, ?retry_at, "handler declined message");
                self.broker.negative_acknowledge(&message.id, retry_at)?;
            }
        }
        Ok(true)
    }

    /// Start `threads` worker threads. Each polls without pause while work is
    /// available and waits `poll_interval` once the group is empty.
    pub fn spawn(self: &Arc<Self>, threads: usize, poll_interval: Duration) -> BrokerResult<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let mut handle = WorkerHandle {
            shutdown_tx: Some(shutdown_tx),
            threads: Vec::with_capacity(threads),
        };

        for n in 0..threads {
            let worker = Arc::clone(self);
            let rx = shutdown_rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("runq-worker-{n}"))
                .spawn(move || {
                    debug!(worker = n, "worker started");
                    let mut wait = Duration::ZERO;
                    loop {
                        match rx.recv_timeout(wait) {
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                                break;
                            }
                        }
                        wait = match worker.poll_once() {
                            Ok(true) => Duration::ZERO,
                            Ok(false) => poll_interval,
                            Err(e) => {
                                warn!(worker = n, error = %e, "worker poll failed");
                                poll_interval
                            }
                        };
                    }
                    debug!(worker = n, "worker stopped");
                });
            match spawned {
                Ok(thread) => handle.threads.push(thread),
                Err(e) => {
                    let _ = handle.stop();
                    return Err(BrokerError::WorkerSpawn(e.to_string()));
                }
            }
        }

        Ok(handle)
    }
}

/// Running worker threads. A worker finishes the message it holds before it
/// sees the shutdown.
pub struct WorkerHandle {
    shutdown_tx: Option<crossbeam_channel::Sender<()>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stop(&mut self) -> BrokerResult<()> {
        drop(self.shutdown_tx.take());
        let mut panicked = false;
        for thread in self.threads.drain(..) {
            panicked |= thread.join().is_err();
        }
        if panicked {
            return Err(BrokerError::WorkerPanicked);
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
