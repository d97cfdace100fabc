/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: String,
    /// Pending (not leased) messages.
    pub depth: u64,
    /// Messages currently leased from this queue.
    pub in_flight: u64,
    /// Configured limit on the base queue. `None` is unlimited.
    pub concurrency_limit: Option<u32>,
    /// How long the earliest pending message has been due. Zero while it is
    /// still scheduled in the future.
    pub oldest_message_age_ms: Option<u64>,
}
