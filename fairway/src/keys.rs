use ulid::Ulid;
use uuid::Uuid;

/// Derives every store key from a configurable prefix.
///
/// This is the single source of truth for the key layout; other processes
/// read these keys directly, so the shapes below are a compatibility
/// contract.
///
/// | key | shape |
/// |---|---|
/// | `{prefix}:queue:item` | hash: item ID -> encoded item |
/// | `{prefix}:queue:sorted:<workflowID>` | zset: item ID scored by ready time (ms) |
/// | `{prefix}:partition:item` | hash: workflow ID -> encoded partition |
/// | `{prefix}:partition:sorted` | zset: workflow ID scored by next-ready time (s) |
/// | `{prefix}:partition:meta:<workflowID>` | hash: field `n` = in-progress count |
/// | `{prefix}:queue:idempotency:<itemID>` | string with TTL |
/// | `{prefix}:queue:sequential` | string holding the sequential lease token |
#[derive(Debug, Clone)]
pub struct KeyGen {
    prefix: String,
}

impl KeyGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash of all queue items, keyed by item ID.
    pub fn queue_item(&self) -> String {
        format!("{}:queue:item", self.prefix)
    }

    /// Per-partition ready index, scored by ready time in milliseconds.
    pub fn queue_index(&self, workflow_id: &Uuid) -> String {
        format!("{}:queue:sorted:{}", self.prefix, workflow_id)
    }

    /// Hash of all partition records, keyed by workflow ID.
    pub fn partition_item(&self) -> String {
        format!("{}:partition:item", self.prefix)
    }

    /// Global partition index, scored by next-ready time in seconds.
    pub fn partition_index(&self) -> String {
        format!("{}:partition:sorted", self.prefix)
    }

    /// Per-partition bookkeeping; field `n` counts in-progress leases.
    pub fn partition_meta(&self, workflow_id: &Uuid) -> String {
        format!("{}:partition:meta:{}", self.prefix, workflow_id)
    }

    /// Idempotency gate for a deterministic item ID.
    pub fn idempotency(&self, item_id: &Ulid) -> String {
        format!("{}:queue:idempotency:{}", self.prefix, item_id)
    }

    /// Singleton sequential-scanner lease.
    pub fn sequential(&self) -> String {
        format!("{}:queue:sequential", self.prefix)
    }
}
