//! End-to-end triggering: admission, run-chain validation and the broker
//! working together the way a worker process drives them.
//!
//!   cargo test -p runq-core --test trigger_chain

use std::sync::Arc;

use runq_core::admission::{
    InMemoryQueueConfigStore, InMemoryRunStore, RunStatus, RunStore, StaticEntitlements,
};
use runq_core::config::AdmissionConfig;
use runq_core::{
    Broker, Clock, DeadlockError, Environment, EnvironmentKind, ManualClock, Payload, QueueConfig,
    RocksDbStorage, RunChainState, RunqConfig, TriggerError, TriggerRequest, TriggerService,
};

struct Platform {
    service: TriggerService,
    runs: Arc<InMemoryRunStore>,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

fn platform(admission: AdmissionConfig) -> Platform {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
    let clock = Arc::new(ManualClock::new(10_000));
    let mut config = RunqConfig::default();
    config.sweeper.workers = 0;
    let broker = Arc::new(Broker::with_clock(&config, storage, clock.clone()).unwrap());
    let runs = Arc::new(InMemoryRunStore::new());
    let service = TriggerService::new(
        &admission,
        broker,
        runs.clone(),
        Arc::new(InMemoryQueueConfigStore::new()),
        Arc::new(StaticEntitlements::allow_all()),
    );
    Platform {
        service,
        runs,
        clock,
        _dir: dir,
    }
}

fn environment(max: u32) -> Environment {
    Environment {
        id: "env_prod".to_string(),
        organization_id: "org_acme".to_string(),
        kind: EnvironmentKind::Production,
        maximum_concurrency_limit: max,
    }
}

fn request(task: &str, max: u32) -> TriggerRequest {
    TriggerRequest::new(environment(max), task, Payload::json(b"{}".to_vec()))
}

#[test]
fn recursive_wait_on_limited_queue_is_caught_at_third_generation() {
    let p = platform(AdmissionConfig::default());
    let scope = environment(100).scope();
    p.service
        .sync_queue(
            &scope,
            QueueConfig::new("queue_render", "render", "env_prod").with_concurrency_limit(2),
        )
        .unwrap();

    let root = p
        .service
        .trigger(request("render", 100).on_queue("render"))
        .unwrap();
    assert_eq!(root.run_chain_state, RunChainState::default());

    let c1 = p
        .service
        .trigger(request("render", 100).on_queue("render").child_of(root.id, true))
        .unwrap();
    assert_eq!(c1.run_chain_state.queue_holding("queue_render"), 1);

    let c2 = p
        .service
        .trigger(request("render", 100).on_queue("render").child_of(c1.id, true))
        .unwrap();
    assert_eq!(c2.run_chain_state.queue_holding("queue_render"), 2);
    assert_eq!(c2.depth, 2);

    let err = p
        .service
        .trigger(request("render", 100).on_queue("render").child_of(c2.id, true))
        .unwrap_err();
    match err {
        TriggerError::Deadlock(DeadlockError::Queue {
            limit, holding, ..
        }) => assert_eq!((limit, holding), (2, 2)),
        other => panic!("expected queue deadlock, got {other}"),
    }
    assert_eq!(p.runs.len(), 3);
    assert_eq!(
        p.service.broker().queue_depth(&scope, "render").unwrap(),
        3,
        "the rejected run never reached the broker"
    );
}

#[test]
fn fire_and_forget_children_never_deadlock() {
    let p = platform(AdmissionConfig::default());
    let scope = environment(1).scope();
    p.service
        .sync_queue(
            &scope,
            QueueConfig::new("queue_fan", "fan", "env_prod").with_concurrency_limit(1),
        )
        .unwrap();

    let mut parent = p
        .service
        .trigger(request("fan", 1).on_queue("fan"))
        .unwrap()
        .id;
    for generation in 1..=5 {
        let child = p
            .service
            .trigger(request("fan", 1).on_queue("fan").child_of(parent, false))
            .unwrap();
        assert_eq!(child.depth, generation);
        assert_eq!(child.run_chain_state, RunChainState::default());
        parent = child.id;
    }
}

#[test]
fn worker_drains_triggered_runs_in_order() {
    let p = platform(AdmissionConfig::default());
    let broker = p.service.broker();

    let first = p.service.trigger(request("email", 10)).unwrap();
    p.clock.advance(5);
    let second = p.service.trigger(request("email", 10)).unwrap();
    let mut delayed = request("email", 10);
    delayed.delay_until = Some(p.clock.now_ms() + 60_000);
    let later = p.service.trigger(delayed).unwrap();

    p.clock.advance(5);
    let mut drained = Vec::new();
    while let Some(m) = broker.dequeue_shared().unwrap() {
        assert!(broker.acknowledge(&m.id).unwrap());
        drained.push(m.id);
    }
    assert_eq!(drained, [first.id, second.id]);

    p.clock.advance(60_000);
    assert_eq!(broker.dequeue_shared().unwrap().unwrap().id, later.id);
    assert_eq!(
        p.runs.find_run(&later.id).unwrap().unwrap().status,
        RunStatus::Pending
    );
}

#[test]
fn depth_limit_rejects_before_any_run_exists() {
    let p = platform(AdmissionConfig {
        max_queue_depth_deployed: Some(2),
        ..Default::default()
    });
    p.service.trigger(request("sync", 10)).unwrap();
    p.service.trigger(request("sync", 10)).unwrap();
    let err = p.service.trigger(request("sync", 10)).unwrap_err();
    assert_eq!(err.reason(), "capacity");
    assert_eq!(p.runs.len(), 2);
}
