//! Persistent, partitioned, priority-fair job queue backed by Redis.
//!
//! Items belong to partitions keyed by workflow ID; each partition carries a
//! priority and a next-ready time. Workers peek partitions (earliest-first
//! or weighted-random by priority), lease one, drain its ready items under
//! item leases, and hand the partition back. Every state transition runs as
//! a single Lua script, so the store layout stays consistent under any
//! number of concurrent workers, and leases encode their own expiry inside
//! the token.
//!
//! ```ignore
//! let client = redis::Client::open("redis://127.0.0.1:6379")?;
//! let conn = redis::aio::ConnectionManager::new(client).await?;
//! let queue = Queue::new(conn).with_prefix("jobs");
//!
//! let item = queue
//!     .enqueue(EnqueueRequest { workflow_id, data, ..Default::default() }, Utc::now())
//!     .await?;
//! let lease = queue.lease(item.workflow_id, item.id, Duration::from_secs(30)).await?;
//! // ... work ...
//! queue.dequeue(&item).await?;
//! ```

pub mod error;
pub mod ids;
pub mod item;
pub mod keys;
mod queue;
mod sampling;
mod scripts;

pub use error::{QueueError, Result};
pub use ids::{Clock, lease_expired, lease_expiry, system_clock};
pub use item::{
    PARTITION_PEEK_DEFAULT, PARTITION_PEEK_MAX, PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN,
    QUEUE_PEEK_DEFAULT, QUEUE_PEEK_MAX, QueueItem, QueuePartition,
};
pub use keys::KeyGen;
pub use queue::{
    DEFAULT_IDEMPOTENCY_TTL, DEFAULT_PREFIX, EnqueueRequest, PriorityFinder, Queue,
};
