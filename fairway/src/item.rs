//! Item and partition records and their wire format.
//!
//! Records are stored as JSON hash values. The field names below are read by
//! other processes and must stay stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::ids;

/// Highest priority. Lower numeric value wins.
pub const PRIORITY_MAX: u32 = 0;
/// Priority assigned when no finder is configured.
pub const PRIORITY_DEFAULT: u32 = 5;
/// Lowest priority accepted by the queue.
pub const PRIORITY_MIN: u32 = 9;

/// Hard cap on the number of items a single peek may return.
pub const QUEUE_PEEK_MAX: i64 = 1000;
/// Items returned when a peek is called with a non-positive limit.
pub const QUEUE_PEEK_DEFAULT: i64 = 250;
/// Hard cap on the number of partitions a single partition peek may return.
pub const PARTITION_PEEK_MAX: i64 = 1000;
/// Partitions returned when a partition peek is called with a non-positive
/// limit.
pub const PARTITION_PEEK_DEFAULT: i64 = 30;

/// A single unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique, lexicographically sortable ID. Deterministic when the caller
    /// supplied an idempotency key at enqueue.
    pub id: Ulid,

    /// The partition this item belongs to.
    #[serde(rename = "workflowID")]
    pub workflow_id: Uuid,

    /// Current lease token, if any. The token's embedded timestamp is the
    /// lease expiry; an expired token is left in place until the next
    /// transition overwrites it.
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,

    /// Opaque payload. The queue only hands it to the priority finder.
    pub data: serde_json::Value,

    /// Ready-to-run time in milliseconds since epoch; always equals the
    /// item's score in the partition's ready index.
    #[serde(rename = "atMS", default)]
    pub at_ms: i64,
}

impl QueueItem {
    /// Whether this item currently holds a live lease.
    pub fn leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_id
            .as_ref()
            .is_some_and(|id| !ids::lease_expired(id, now))
    }
}

/// A logical group of items with a priority and a next-ready time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePartition {
    #[serde(rename = "workflowID")]
    pub workflow_id: Uuid,

    /// Priority in `[PRIORITY_MAX, PRIORITY_MIN]`; cached from the priority
    /// finder at enqueue, overridden by reprioritize.
    #[serde(default)]
    pub priority: u32,

    /// Next-ready time in seconds since epoch: the earliest ready item, or
    /// the lease expiry while leased. Always equals the partition's score in
    /// the partition index.
    #[serde(rename = "atS", default)]
    pub at_s: i64,

    /// Token of the worker currently draining this partition, if any.
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,

    /// Seconds since epoch of the most recent partition lease.
    #[serde(default)]
    pub last: i64,
}

impl QueuePartition {
    /// Sampling weight: lower numeric priority (= higher priority) weighs
    /// more. Out-of-range records degrade to the smallest weight.
    pub(crate) fn peek_weight(&self) -> f64 {
        (PRIORITY_MIN + 1).saturating_sub(self.priority).max(1) as f64
    }
}
