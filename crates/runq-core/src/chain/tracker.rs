use std::sync::Arc;

use tracing::{debug, error};

use crate::admission::store::{QueueConfigStore, RunRecord};
use crate::admission::TriggerRequest;
use crate::chain::RunChainState;
use crate::error::{DeadlockError, RunChainError};
use crate::queue::QueueConfig;

/// Where the new run is going and who triggered it.
#[derive(Debug, Clone, Copy)]
pub struct RunChainContext<'a> {
    pub parent_run: Option<&'a RunRecord>,
    pub queue_name: &'a str,
    pub locked_queue_id: Option<&'a str>,
}

/// Decides at admission whether a child run could deadlock its ancestor chain.
///
/// The check is closed-form: the parent's persisted state already sums what
/// every ancestor holds per queue, so one read of the parent is enough no
/// matter how deep the chain is.
pub struct RunChainTracker {
    queues: Arc<dyn QueueConfigStore>,
    legacy_environment_accounting: bool,
}

impl RunChainTracker {
    pub fn new(queues: Arc<dyn QueueConfigStore>, legacy_environment_accounting: bool) -> Self {
        Self {
            queues,
            legacy_environment_accounting,
        }
    }

    /// Compute the chain state to persist on the new run, or reject it.
    #[tracing::instrument(
        skip_all,
        fields(queue = %ctx.queue_name, parent_run = ?ctx.parent_run.map(|p| p.id))
    )]
    pub fn validate_run_chain(
        &self,
        request: &TriggerRequest,
        ctx: RunChainContext<'_>,
    ) -> Result<RunChainState, RunChainError> {
        let Some(parent) = ctx.parent_run else {
            return Ok(RunChainState::default());
        };
        let inherited = parent_state(parent);

        // The parent isn't waiting on this child, so it holds nothing extra.
        if !request.resume_parent_on_completion {
            return Ok(inherited);
        }

        let parent_queue = self.parent_queue(parent)?;
        let releases = releases_while_waiting(request.release_concurrency, parent_queue.as_ref());
        let unlimited = parent_queue
            .as_ref()
            .map_or(true, |q| q.concurrency_limit.is_none());
        let environment = u32::from((self.legacy_environment_accounting && !releases) || unlimited);

        let state = inherited.with_added(
            parent_queue
                .as_ref()
                .map(|q| (q.id.as_str(), q.name.as_str(), u32::from(!releases))),
            environment,
        );

        self.check(request, &inherited, ctx)?;

        debug!(
            releases,
            environment = state.environment_holding(),
            "run chain validated"
        );
        Ok(state)
    }

    fn check(
        &self,
        request: &TriggerRequest,
        inherited: &RunChainState,
        ctx: RunChainContext<'_>,
    ) -> Result<(), RunChainError> {
        let holding = inherited.environment_holding();
        let limit = request.environment.maximum_concurrency_limit;
        if holding + 1 > limit {
            return Err(DeadlockError::Environment {
                limit,
                required: holding + 1,
                holding,
            }
            .into());
        }

        let queue = match ctx.locked_queue_id {
            Some(id) => self.queues.get_queue(id)?,
            None => self
                .queues
                .find_queue(&request.environment.id, ctx.queue_name)?,
        };
        let Some((queue, limit)) = queue.and_then(|q| q.concurrency_limit.map(|l| (q, l))) else {
            return Ok(());
        };
        let holding = inherited.queue_holding(&queue.id);
        if holding + 1 > limit {
            return Err(DeadlockError::Queue {
                queue: queue.name,
                limit,
                required: holding + 1,
                holding,
            }
            .into());
        }
        Ok(())
    }

    fn parent_queue(&self, parent: &RunRecord) -> Result<Option<QueueConfig>, RunChainError> {
        let queue = match parent.locked_queue_id.as_deref() {
            Some(id) => self.queues.get_queue(id)?,
            None => self
                .queues
                .find_queue(&parent.environment_id, &parent.queue_name)?,
        };
        Ok(queue)
    }
}

/// Corrupt state never blocks admission; it only weakens detection.
fn parent_state(parent: &RunRecord) -> RunChainState {
    let Some(raw) = parent.run_chain_state.as_deref() else {
        return RunChainState::default();
    };
    RunChainState::parse(raw).unwrap_or_else(|e| {
        error!(parent_run = %parent.id, error = %e, "unparseable run chain state on parent, treating as empty");
        RunChainState::default()
    })
}

/// Whether the parent gives its queue slot back while it waits.
fn releases_while_waiting(requested: Option<bool>, queue: Option<&QueueConfig>) -> bool {
    if let Some(release) = requested {
        return release;
    }
    match queue {
        Some(q) if q.release_concurrency_on_waitpoint => true,
        Some(q) => q.concurrency_limit.is_none(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::memory::InMemoryQueueConfigStore;
    use crate::admission::store::RunStatus;
    use crate::admission::Environment;
    use crate::broker::EnvironmentKind;
    use crate::message::Payload;
    use uuid::Uuid;

    const ENV: &str = "env_1";

    fn environment(max: u32) -> Environment {
        Environment {
            id: ENV.to_string(),
            organization_id: "org_1".to_string(),
            kind: EnvironmentKind::Production,
            maximum_concurrency_limit: max,
        }
    }

    fn tracker_with(queues: Vec<QueueConfig>, legacy: bool) -> RunChainTracker {
        let store = InMemoryQueueConfigStore::new();
        for q in queues {
            store.put_queue(q).unwrap();
        }
        RunChainTracker::new(Arc::new(store), legacy)
    }

    fn waiting_request(max: u32) -> TriggerRequest {
        let mut r = TriggerRequest::new(environment(max), "child", Payload::json(b"{}".to_vec()));
        r.resume_parent_on_completion = true;
        r
    }

    fn run_on(queue: &QueueConfig, state: &RunChainState) -> RunRecord {
        RunRecord {
            id: Uuid::now_v7(),
            organization_id: "org_1".to_string(),
            environment_id: ENV.to_string(),
            task_identifier: "task".to_string(),
            queue_name: queue.name.clone(),
            locked_queue_id: Some(queue.id.clone()),
            parent_run_id: None,
            depth: 0,
            concurrency_key: None,
            run_chain_state: Some(state.to_json().unwrap()),
            status: RunStatus::Executing,
        }
    }

    fn ctx<'a>(parent: &'a RunRecord, queue: &'a QueueConfig) -> RunChainContext<'a> {
        RunChainContext {
            parent_run: Some(parent),
            queue_name: &queue.name,
            locked_queue_id: Some(&queue.id),
        }
    }

    /// Trigger-and-wait down a chain on one queue until rejected; returns the
    /// holding count of every admitted generation and the rejection.
    fn chain_until_rejected(
        tracker: &RunChainTracker,
        queue: &QueueConfig,
        max_env: u32,
        generations: usize,
    ) -> (Vec<RunChainState>, Option<DeadlockError>) {
        let request = waiting_request(max_env);
        let mut states = Vec::new();
        let mut parent = run_on(queue, &RunChainState::default());
        for _ in 0..generations {
            match tracker.validate_run_chain(&request, ctx(&parent, queue)) {
                Ok(state) => {
                    parent = run_on(queue, &state);
                    states.push(state);
                }
                Err(RunChainError::Deadlock(e)) => return (states, Some(e)),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        (states, None)
    }

    #[test]
    fn root_run_gets_empty_state() {
        let tracker = tracker_with(vec![], false);
        let state = tracker
            .validate_run_chain(
                &waiting_request(1),
                RunChainContext {
                    parent_run: None,
                    queue_name: "task/root",
                    locked_queue_id: None,
                },
            )
            .unwrap();
        assert_eq!(state, RunChainState::default());
    }

    #[test]
    fn non_releasing_queue_deadlocks_on_third_generation() {
        let q = QueueConfig::new("q_1", "shared-q", ENV).with_concurrency_limit(2);
        let tracker = tracker_with(vec![q.clone()], false);

        let (states, rejection) = chain_until_rejected(&tracker, &q, 100, 10);

        let holdings: Vec<u32> = states.iter().map(|s| s.queue_holding("q_1")).collect();
        assert_eq!(holdings, vec![1, 2]);
        assert_eq!(
            rejection,
            Some(DeadlockError::Queue {
                queue: "shared-q".to_string(),
                limit: 2,
                required: 3,
                holding: 2,
            })
        );
        assert!(states.iter().all(|s| s.environment_holding() == 0));
    }

    #[test]
    fn releasing_queue_never_accumulates() {
        let q = QueueConfig::new("q_1", "shared-q", ENV)
            .with_concurrency_limit(1)
            .releasing_on_waitpoint();
        let tracker = tracker_with(vec![q.clone()], false);

        let (states, rejection) = chain_until_rejected(&tracker, &q, 100, 25);
        assert!(rejection.is_none());
        assert_eq!(states.len(), 25);
        assert!(states.iter().all(|s| s.queue_holding("q_1") == 0));
        assert!(states.iter().all(|s| s.environment_holding() == 0));
    }

    #[test]
    fn unlimited_queue_falls_back_to_environment_accounting() {
        let q = QueueConfig::new("q_1", "open-q", ENV);
        let tracker = tracker_with(vec![q.clone()], false);

        let (states, rejection) = chain_until_rejected(&tracker, &q, 3, 10);

        // No holding on the queue itself, one environment slot per waiting ancestor.
        assert!(states.iter().all(|s| s.queue_holding("q_1") == 0));
        let env: Vec<u32> = states.iter().map(|s| s.environment_holding()).collect();
        assert_eq!(env, vec![1, 2, 3]);
        assert_eq!(
            rejection,
            Some(DeadlockError::Environment {
                limit: 3,
                required: 4,
                holding: 3,
            })
        );
    }

    #[test]
    fn legacy_accounting_charges_environment_for_holding_parents() {
        let q = QueueConfig::new("q_1", "shared-q", ENV).with_concurrency_limit(10);
        let tracker = tracker_with(vec![q.clone()], true);

        let (states, rejection) = chain_until_rejected(&tracker, &q, 2, 10);
        let env: Vec<u32> = states.iter().map(|s| s.environment_holding()).collect();
        assert_eq!(env, vec![1, 2]);
        assert!(matches!(rejection, Some(DeadlockError::Environment { limit: 2, .. })));
    }

    #[test]
    fn legacy_accounting_skips_releasing_parents() {
        let q = QueueConfig::new("q_1", "shared-q", ENV)
            .with_concurrency_limit(10)
            .releasing_on_waitpoint();
        let tracker = tracker_with(vec![q.clone()], true);
        let (states, rejection) = chain_until_rejected(&tracker, &q, 2, 5);
        assert!(rejection.is_none());
        assert!(states.iter().all(|s| s.environment_holding() == 0));
    }

    #[test]
    fn request_override_beats_queue_flag() {
        let q = QueueConfig::new("q_1", "shared-q", ENV)
            .with_concurrency_limit(1)
            .releasing_on_waitpoint();
        let tracker = tracker_with(vec![q.clone()], false);
        let parent = run_on(&q, &RunChainState::default());

        let mut request = waiting_request(100);
        request.release_concurrency = Some(false);
        let state = tracker.validate_run_chain(&request, ctx(&parent, &q)).unwrap();
        assert_eq!(state.queue_holding("q_1"), 1);

        let grandparent = run_on(&q, &state);
        let err = tracker
            .validate_run_chain(&request, ctx(&grandparent, &q))
            .unwrap_err();
        assert!(matches!(err, RunChainError::Deadlock(DeadlockError::Queue { .. })));

        // And the other way round: an explicit release on a holding queue.
        let holding_q = QueueConfig::new("q_2", "strict-q", ENV).with_concurrency_limit(1);
        let tracker = tracker_with(vec![holding_q.clone()], false);
        request.release_concurrency = Some(true);
        let parent = run_on(&holding_q, &RunChainState::default());
        let state = tracker
            .validate_run_chain(&request, ctx(&parent, &holding_q))
            .unwrap();
        assert_eq!(state.queue_holding("q_2"), 0);
    }

    #[test]
    fn holdings_merge_by_queue_across_distance() {
        let a = QueueConfig::new("q_a", "a", ENV).with_concurrency_limit(2);
        let b = QueueConfig::new("q_b", "b", ENV).with_concurrency_limit(5);
        let tracker = tracker_with(vec![a.clone(), b.clone()], false);
        let request = waiting_request(100);

        // A -> B -> A -> B: the two A ancestors are not adjacent.
        let root = run_on(&a, &RunChainState::default());
        let s1 = tracker.validate_run_chain(&request, ctx(&root, &b)).unwrap();
        let on_b = run_on(&b, &s1);
        let s2 = tracker.validate_run_chain(&request, ctx(&on_b, &a)).unwrap();
        let on_a = run_on(&a, &s2);
        let s3 = tracker.validate_run_chain(&request, ctx(&on_a, &b)).unwrap();

        assert_eq!(s3.queue_holding("q_a"), 2);
        assert_eq!(s3.queue_holding("q_b"), 1);
        assert_eq!(s3.concurrency.as_ref().unwrap().queues.len(), 2);

        // A third run on A would need a slot held by two waiting ancestors.
        let on_b = run_on(&b, &s3);
        let err = tracker.validate_run_chain(&request, ctx(&on_b, &a)).unwrap_err();
        assert!(matches!(
            err,
            RunChainError::Deadlock(DeadlockError::Queue { limit: 2, holding: 2, .. })
        ));
    }

    #[test]
    fn fire_and_forget_child_inherits_parent_state_unchanged() {
        let q = QueueConfig::new("q_1", "shared-q", ENV).with_concurrency_limit(1);
        let tracker = tracker_with(vec![q.clone()], false);
        let inherited = RunChainState::default().with_added(Some(("q_1", "shared-q", 1)), 0);
        let parent = run_on(&q, &inherited);

        let mut request = waiting_request(100);
        request.resume_parent_on_completion = false;
        let state = tracker.validate_run_chain(&request, ctx(&parent, &q)).unwrap();
        assert_eq!(state, inherited);
    }

    #[test]
    fn corrupt_parent_state_is_treated_as_empty() {
        let q = QueueConfig::new("q_1", "shared-q", ENV).with_concurrency_limit(2);
        let tracker = tracker_with(vec![q.clone()], false);
        let mut parent = run_on(&q, &RunChainState::default());
        parent.run_chain_state = Some("{not json".to_string());

        let state = tracker
            .validate_run_chain(&waiting_request(100), ctx(&parent, &q))
            .unwrap();
        assert_eq!(state.queue_holding("q_1"), 1);
    }

    #[test]
    fn queue_is_resolved_by_name_when_not_locked() {
        let q = QueueConfig::new("q_1", "by-name", ENV).with_concurrency_limit(1);
        let tracker = tracker_with(vec![q.clone()], false);
        let held = RunChainState::default().with_added(Some(("q_1", "by-name", 1)), 0);
        let mut parent = run_on(&q, &held);
        parent.locked_queue_id = None;

        let err = tracker
            .validate_run_chain(
                &waiting_request(100),
                RunChainContext {
                    parent_run: Some(&parent),
                    queue_name: "by-name",
                    locked_queue_id: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, RunChainError::Deadlock(DeadlockError::Queue { .. })));
    }

    #[test]
    fn unknown_parent_queue_charges_environment_only() {
        let child_q = QueueConfig::new("q_child", "child-q", ENV).with_concurrency_limit(1);
        let tracker = tracker_with(vec![child_q.clone()], false);
        let mut parent = run_on(&child_q, &RunChainState::default());
        parent.locked_queue_id = Some("q_deleted".to_string());

        let state = tracker
            .validate_run_chain(&waiting_request(100), ctx(&parent, &child_q))
            .unwrap();
        assert!(state.concurrency.as_ref().unwrap().queues.is_empty());
        assert_eq!(state.environment_holding(), 1);
    }
}
