//! Names of the sets and values the broker keeps in storage.
//!
//! Queue keys look like `{org:<org>}:{env:<env>}:queue:<name>`, with a
//! `:ck:<key>` suffix for concurrency-key sub-partitions. Sub-partitions share
//! the base queue's limit but each keeps its own current-concurrency set.
//!
//! Identifiers are escaped (`%` as `%25`, `:` as `%3A`) before they are placed
//! in a key, so a name can never contain a segment separator.

use uuid::Uuid;

use crate::broker::scope::QueueScope;

/// Global parent index drained by managed worker groups.
pub const SHARED_QUEUE: &str = "sharedQueue";

/// Sorted set of in-flight message IDs scored by lease expiry (ms).
pub const TIMEOUT_INDEX: &str = "visibility:timeouts";

const QUEUE_SEGMENT: &str = ":queue:";
const CONCURRENCY_KEY_SEGMENT: &str = ":ck:";

fn escape(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3A")
}

fn unescape(segment: &str) -> String {
    segment.replace("%3A", ":").replace("%25", "%")
}

fn environment_prefix(organization_id: &str, environment_id: &str) -> String {
    format!(
        "{{org:{}}}:{{env:{}}}",
        escape(organization_id),
        escape(environment_id)
    )
}

pub fn queue_key(scope: &QueueScope, queue_name: &str, concurrency_key: Option<&str>) -> String {
    let base = format!(
        "{}{QUEUE_SEGMENT}{}",
        environment_prefix(&scope.organization_id, &scope.environment_id),
        escape(queue_name)
    );
    match concurrency_key {
        Some(ck) => format!("{base}{CONCURRENCY_KEY_SEGMENT}{ck}"),
        None => base,
    }
}

/// Strip a `:ck:<key>` suffix, leaving the logical queue the limit is kept on.
pub fn base_queue_key(queue_key: &str) -> &str {
    let search_from = queue_key
        .find(QUEUE_SEGMENT)
        .map(|i| i + QUEUE_SEGMENT.len())
        .unwrap_or(0);
    match queue_key[search_from..].find(CONCURRENCY_KEY_SEGMENT) {
        Some(i) => &queue_key[..search_from + i],
        None => queue_key,
    }
}

/// The logical queue name embedded in a queue key, without any concurrency key.
pub fn queue_name(queue_key: &str) -> String {
    let base = base_queue_key(queue_key);
    match base.find(QUEUE_SEGMENT) {
        Some(i) => unescape(&base[i + QUEUE_SEGMENT.len()..]),
        None => base.to_string(),
    }
}

pub fn concurrency_limit_key(queue_key: &str) -> String {
    format!("{}:concurrency", base_queue_key(queue_key))
}

/// Value key counting pending messages across every partition of a queue.
pub fn queue_length_key(queue_key: &str) -> String {
    format!("{}:length", base_queue_key(queue_key))
}

pub fn current_concurrency_key(queue_key: &str) -> String {
    format!("{queue_key}:currentConcurrency")
}

/// Parent index for one environment, drained by its unmanaged workers.
pub fn environment_parent_queue_key(organization_id: &str, environment_id: &str) -> String {
    format!(
        "{}:{SHARED_QUEUE}",
        environment_prefix(organization_id, environment_id)
    )
}

/// Value key holding a leased message's lease start (ms).
pub fn lease_key(id: &Uuid) -> String {
    format!("lease:{id}")
}
