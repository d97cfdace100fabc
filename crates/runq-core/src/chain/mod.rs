//! Run-chain concurrency accounting.
//!
//! Every run records how many concurrency slots its ancestors are holding
//! while they wait on it. The record is computed once at admission from the
//! parent's record and never mutated afterwards.

mod tracker;

use serde::{Deserialize, Serialize};

pub use tracker::{RunChainContext, RunChainTracker};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunChainState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyState {
    /// One entry per distinct queue across the whole ancestor chain.
    #[serde(default)]
    pub queues: Vec<QueueHolding>,
    /// Slots held at the environment level.
    #[serde(default)]
    pub environment: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHolding {
    pub id: String,
    pub name: String,
    pub holding: u32,
}

impl RunChainState {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn environment_holding(&self) -> u32 {
        self.concurrency.as_ref().map_or(0, |c| c.environment)
    }

    pub fn queue(&self, id: &str) -> Option<&QueueHolding> {
        self.concurrency
            .as_ref()
            .and_then(|c| c.queues.iter().find(|q| q.id == id))
    }

    pub fn queue_holding(&self, id: &str) -> u32 {
        self.queue(id).map_or(0, |q| q.holding)
    }

    /// A copy with `holding` more slots on queue `id` (merged by id) and
    /// `environment` more at the environment level.
    pub(crate) fn with_added(
        &self,
        queue: Option<(&str, &str, u32)>,
        environment: u32,
    ) -> RunChainState {
        let mut state = self.concurrency.clone().unwrap_or_default();
        if let Some((id, name, holding)) = queue {
            match state.queues.iter_mut().find(|q| q.id == id) {
                Some(entry) => entry.holding += holding,
                None => state.queues.push(QueueHolding {
                    id: id.to_string(),
                    name: name.to_string(),
                    holding,
                }),
            }
        }
        state.environment += environment;
        RunChainState {
            concurrency: Some(state),
        }
    }
}
