use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::broker::{keys, Broker, EnvironmentKind, QueueScope};
use crate::config::{AdmissionConfig, DepthLimits};
use crate::error::{BrokerResult, CapacityError, TriggerError};

#[derive(Debug, Clone, Copy)]
struct CachedDepth {
    depth: u64,
    fetched_at: u64,
}

/// Coarse producer-side cap on queue depth.
///
/// Depths are cached for `depth_cache_ttl_ms`; within one TTL the cached value
/// only sees what this guard admitted, not what other producers enqueued.
pub struct QueueDepthGuard {
    development: Option<u64>,
    deployed: Option<u64>,
    organizations: HashMap<String, DepthLimits>,
    ttl_ms: u64,
    cache: Mutex<HashMap<String, CachedDepth>>,
}

impl QueueDepthGuard {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            development: config.max_queue_depth_development,
            deployed: config.max_queue_depth_deployed,
            organizations: config.organization_max_queue_depth.clone(),
            ttl_ms: config.depth_cache_ttl_ms,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The cap for one queue in this kind of environment. `None` is unbounded.
    pub fn maximum_depth(&self, organization_id: &str, kind: EnvironmentKind) -> Option<u64> {
        let org = self.organizations.get(organization_id);
        if kind.is_development() {
            org.and_then(|l| l.development).or(self.development)
        } else {
            org.and_then(|l| l.deployed).or(self.deployed)
        }
    }

    /// Reject if `adding` more messages would push the queue past its cap.
    pub fn check(
        &self,
        broker: &Broker,
        scope: &QueueScope,
        queue_name: &str,
        adding: u64,
    ) -> Result<(), TriggerError> {
        let Some(maximum) = self.maximum_depth(&scope.organization_id, scope.kind) else {
            return Ok(());
        };
        let depth = self.cached_depth(broker, scope, queue_name)?;
        if depth.saturating_add(adding) > maximum {
            return Err(CapacityError {
                queue: queue_name.to_string(),
                depth,
                adding,
                maximum,
            }
            .into());
        }
        Ok(())
    }

    /// Count messages admitted since the cached depth was read, so a burst
    /// within one TTL still runs into the cap.
    pub fn record_admitted(&self, scope: &QueueScope, queue_name: &str, added: u64) {
        let key = keys::queue_key(scope, queue_name, None);
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = cache.get_mut(&key) {
            cached.depth = cached.depth.saturating_add(added);
        }
    }

    fn cached_depth(&self, broker: &Broker, scope: &QueueScope, queue_name: &str) -> BrokerResult<u64> {
        let key = keys::queue_key(scope, queue_name, None);
        let now = broker.clock().now_ms();
        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(cached) = cache.get(&key) {
                if now.saturating_sub(cached.fetched_at) < self.ttl_ms {
                    return Ok(cached.depth);
                }
            }
        }

        let depth = broker.queue_depth(scope, queue_name)?;
        debug!(queue = %key, depth, "queue depth refreshed");
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, CachedDepth { depth, fetched_at: now });
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RunqConfig;
    use crate::message::{Message, Payload};
    use crate::storage::RocksDbStorage;
    use std::sync::Arc;

    fn broker() -> (Broker, Arc<ManualClock>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        let mut config = RunqConfig::default();
        config.sweeper.workers = 0;
        let broker = Broker::with_clock(&config, storage, clock.clone()).unwrap();
        (broker, clock, dir)
    }

    fn admission(dev: Option<u64>, deployed: Option<u64>) -> AdmissionConfig {
        AdmissionConfig {
            max_queue_depth_development: dev,
            max_queue_depth_deployed: deployed,
            depth_cache_ttl_ms: 5_000,
            ..Default::default()
        }
    }

    fn fill(broker: &Broker, scope: &QueueScope, n: usize) {
        for _ in 0..n {
            broker
                .enqueue(scope, "q", Message::new_id(), Payload::json(b"{}".to_vec()), None)
                .unwrap();
        }
    }

    #[test]
    fn maximum_depends_on_kind_and_organization() {
        let mut config = admission(Some(10), Some(1_000));
        config.organization_max_queue_depth.insert(
            "big".to_string(),
            DepthLimits {
                development: None,
                deployed: Some(50_000),
            },
        );
        let guard = QueueDepthGuard::new(&config);

        assert_eq!(guard.maximum_depth("o1", EnvironmentKind::Development), Some(10));
        assert_eq!(guard.maximum_depth("o1", EnvironmentKind::Staging), Some(1_000));
        assert_eq!(guard.maximum_depth("big", EnvironmentKind::Production), Some(50_000));
        assert_eq!(
            guard.maximum_depth("big", EnvironmentKind::Development),
            Some(10),
            "no org override for development falls back to the default"
        );
        assert_eq!(
            QueueDepthGuard::new(&AdmissionConfig::default())
                .maximum_depth("o1", EnvironmentKind::Production),
            None
        );
    }

    #[test]
    fn rejects_past_maximum() {
        let (broker, _clock, _dir) = broker();
        let scope = QueueScope::new("o1", "e1", EnvironmentKind::Production);
        fill(&broker, &scope, 3);
        let guard = QueueDepthGuard::new(&admission(None, Some(4)));

        guard.check(&broker, &scope, "q", 1).unwrap();
        let err = guard.check(&broker, &scope, "q", 2).unwrap_err();
        match err {
            TriggerError::Capacity(e) => {
                assert_eq!((e.depth, e.adding, e.maximum), (3, 2, 4));
            }
            other => panic!("expected capacity error, got {other}"),
        }
    }

    #[test]
    fn depth_is_cached_until_ttl() {
        let (broker, clock, _dir) = broker();
        let scope = QueueScope::new("o1", "e1", EnvironmentKind::Production);
        let guard = QueueDepthGuard::new(&admission(None, Some(2)));

        guard.check(&broker, &scope, "q", 1).unwrap();
        fill(&broker, &scope, 5);
        // Stale cached depth of 0 still admits.
        guard.check(&broker, &scope, "q", 1).unwrap();

        clock.advance(5_000);
        assert!(matches!(
            guard.check(&broker, &scope, "q", 1),
            Err(TriggerError::Capacity(_))
        ));
    }

    #[test]
    fn admitted_messages_count_against_cached_depth() {
        let (broker, _clock, _dir) = broker();
        let scope = QueueScope::new("o1", "e1", EnvironmentKind::Production);
        let guard = QueueDepthGuard::new(&admission(None, Some(2)));

        guard.check(&broker, &scope, "q", 1).unwrap();
        guard.record_admitted(&scope, "q", 1);
        guard.check(&broker, &scope, "q", 1).unwrap();
        guard.record_admitted(&scope, "q", 1);
        assert!(matches!(
            guard.check(&broker, &scope, "q", 1),
            Err(TriggerError::Capacity(_))
        ));
    }

    #[test]
    fn unbounded_never_reads_depth() {
        let (broker, _clock, _dir) = broker();
        let scope = QueueScope::new("o1", "dev", EnvironmentKind::Development);
        fill(&broker, &scope, 3);
        let guard = QueueDepthGuard::new(&admission(None, Some(1)));
        guard.check(&broker, &scope, "q", 100).unwrap();
    }
}
