use serde::{Deserialize, Serialize};

/// Queue configuration as held by the queue config store. The broker mirrors
/// `concurrency_limit` into its own limit key; this record stays authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    pub id: String,
    pub name: String,
    pub environment_id: String,
    /// `None` means unlimited.
    pub concurrency_limit: Option<u32>,
    /// Whether a run on this queue gives its slot back while it waits on a child.
    pub release_concurrency_on_waitpoint: bool,
}

impl QueueConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            environment_id: environment_id.into(),
            concurrency_limit: None,
            release_concurrency_on_waitpoint: false,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn releasing_on_waitpoint(mut self) -> Self {
        self.release_concurrency_on_waitpoint = true;
        self
    }
}
