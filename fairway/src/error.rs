use thiserror::Error;

/// Failures surfaced by queue operations.
///
/// Lease and idempotency conflicts are ordinary outcomes for concurrent
/// workers and carry no payload; callers match on the variant. Store and
/// codec failures wrap the underlying error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue item already exists")]
    ItemExists,

    #[error("queue item not found")]
    ItemNotFound,

    #[error("queue item already leased")]
    ItemAlreadyLeased,

    #[error("queue item lease does not match")]
    ItemLeaseMismatch,

    #[error("queue item is not leased")]
    ItemNotLeased,

    #[error("partition not found")]
    PartitionNotFound,

    #[error("partition already leased")]
    PartitionAlreadyLeased,

    #[error("partition garbage collected")]
    PartitionGarbageCollected,

    #[error("priority is below the minimum allowed")]
    PriorityTooLow,

    #[error("sequential lease already held")]
    SequentialAlreadyLeased,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A transition script replied with a status code the client does not
    /// know about. Indicates a client/script version skew.
    #[error("unexpected status {status} from {script} script")]
    UnexpectedStatus { script: &'static str, status: i64 },
}

pub type Result<T> = std::result::Result<T, QueueError>;
