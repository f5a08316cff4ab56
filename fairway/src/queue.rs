//! The queue handle and its operations.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::ids::{self, Clock};
use crate::item::{
    PARTITION_PEEK_DEFAULT, PARTITION_PEEK_MAX, PRIORITY_DEFAULT, PRIORITY_MIN,
    QUEUE_PEEK_DEFAULT, QUEUE_PEEK_MAX, QueueItem, QueuePartition,
};
use crate::keys::KeyGen;
use crate::sampling;
use crate::scripts;

/// Default key namespace.
pub const DEFAULT_PREFIX: &str = "fairway";

/// Default idempotency window armed on dequeue.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Maps an item payload to its partition's priority at enqueue time. Results
/// outside `[PRIORITY_MAX, PRIORITY_MIN]` are clamped.
pub type PriorityFinder = Arc<dyn Fn(&serde_json::Value) -> u32 + Send + Sync>;

/// The fields a producer supplies when enqueueing.
///
/// Everything else on [`QueueItem`] is filled in by [`Queue::enqueue`]. An
/// `idempotency_key` makes the generated item ID deterministic, so repeat
/// enqueues within the configured TTL window are rejected.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub workflow_id: Uuid,
    pub data: serde_json::Value,
    pub idempotency_key: Option<String>,
}

/// Handle to a partitioned, priority-fair queue in a Redis keyspace.
///
/// The handle is cheap to clone and safe to share across workers; every
/// mutation runs as a single store-side script, so no in-process locking is
/// needed beyond the connection manager.
#[derive(Clone)]
pub struct Queue {
    conn: ConnectionManager,
    kg: KeyGen,
    idempotency_ttl: Duration,
    priority_finder: PriorityFinder,
    clock: Clock,
    rng: Arc<Mutex<StdRng>>,
    peek_max: i64,
    partition_peek_max: i64,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("keys", &self.kg)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .finish()
    }
}

impl Queue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            kg: KeyGen::new(DEFAULT_PREFIX),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            priority_finder: Arc::new(|_| PRIORITY_DEFAULT),
            clock: ids::system_clock(),
            rng: Arc::new(Mutex::new(StdRng::from_os_rng())),
            peek_max: QUEUE_PEEK_MAX,
            partition_peek_max: PARTITION_PEEK_MAX,
        }
    }

    /// Key namespace shared with sibling processes reading the same queue.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.kg = KeyGen::new(prefix);
        self
    }

    /// Window during which a dequeued idempotency key blocks re-enqueues.
    /// Zero disables the gate.
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_priority_finder(
        mut self,
        finder: impl Fn(&serde_json::Value) -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.priority_finder = Arc::new(finder);
        self
    }

    /// Overrides the time source. Every operation reads it exactly once.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Seeds the randomness behind ID generation and weighted peeks.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    pub fn with_peek_max(mut self, max: i64) -> Self {
        self.peek_max = max.clamp(1, QUEUE_PEEK_MAX);
        self
    }

    pub fn with_partition_peek_max(mut self, max: i64) -> Self {
        self.partition_peek_max = max.clamp(1, PARTITION_PEEK_MAX);
        self
    }

    /// The key layout this queue reads and writes.
    pub fn keys(&self) -> &KeyGen {
        &self.kg
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn mint_item_id(&self, now_ms: i64) -> Ulid {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        ids::new_item_id(now_ms, &mut *rng)
    }

    fn mint_lease_id(&self, expiry_ms: i64) -> Ulid {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        ids::new_lease_id(expiry_ms, &mut *rng)
    }

    /// Enqueues an item to run at `at`, creating or updating its partition.
    ///
    /// Returns the fully populated item. Fails with
    /// [`QueueError::ItemExists`] when the request carries an idempotency
    /// key whose deterministic ID is already present or still gated.
    pub async fn enqueue(&self, request: EnqueueRequest, at: DateTime<Utc>) -> Result<QueueItem> {
        let now = self.now();
        let id = match &request.idempotency_key {
            Some(key) => ids::hashed_item_id(key),
            None => self.mint_item_id(now.timestamp_millis()),
        };

        let mut priority = (self.priority_finder)(&request.data);
        if priority > PRIORITY_MIN {
            warn!(priority, "priority finder returned a value below the floor, clamping");
            priority = PRIORITY_MIN;
        }

        let item = QueueItem {
            id,
            workflow_id: request.workflow_id,
            lease_id: None,
            data: request.data,
            at_ms: at.timestamp_millis(),
        };
        let partition = QueuePartition {
            workflow_id: request.workflow_id,
            priority,
            at_s: at.timestamp(),
            lease_id: None,
            last: 0,
        };

        let encoded_item = serde_json::to_string(&item)?;
        let encoded_partition = serde_json::to_string(&partition)?;

        let mut conn = self.conn.clone();
        let status = scripts::enqueue()
            .key(self.kg.queue_item())
            .key(self.kg.queue_index(&item.workflow_id))
            .key(self.kg.partition_item())
            .key(self.kg.partition_index())
            .key(self.kg.idempotency(&item.id))
            .arg(item.id.to_string())
            .arg(encoded_item)
            .arg(item.at_ms)
            .arg(item.workflow_id.to_string())
            .arg(encoded_partition)
            .arg(partition.at_s)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => {
                debug!(item = %item.id, workflow = %item.workflow_id, at_ms = item.at_ms, "enqueued item");
                Ok(item)
            }
            1 => Err(QueueError::ItemExists),
            other => Err(unexpected("enqueue", other)),
        }
    }

    /// Returns up to `limit` items in `workflow_id` ready at or before
    /// `until`, earliest first. Items under a live lease are excluded; items
    /// whose lease has expired reappear.
    pub async fn peek(
        &self,
        workflow_id: Uuid,
        until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        let limit = clamp_limit(limit, QUEUE_PEEK_DEFAULT, self.peek_max);
        let now = self.now();

        let mut conn = self.conn.clone();
        let rows = scripts::peek()
            .key(self.kg.queue_index(&workflow_id))
            .key(self.kg.queue_item())
            .arg(until.timestamp_millis())
            .arg(limit)
            .invoke_async::<Vec<Option<String>>>(&mut conn)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows.into_iter().flatten() {
            let item: QueueItem = serde_json::from_str(&row)?;
            if item.leased(now) {
                continue;
            }
            items.push(item);
        }
        Ok(items)
    }

    /// Claims `item_id` for `duration`, returning the lease token. The
    /// token's embedded timestamp is the expiry; keep extending before then.
    pub async fn lease(
        &self,
        workflow_id: Uuid,
        item_id: Ulid,
        duration: Duration,
    ) -> Result<Ulid> {
        let now_ms = self.now().timestamp_millis();
        let expiry_ms = now_ms + duration.as_millis() as i64;
        let lease_id = self.mint_lease_id(expiry_ms);

        let mut conn = self.conn.clone();
        let status = scripts::lease()
            .key(self.kg.queue_item())
            .key(self.kg.queue_index(&workflow_id))
            .key(self.kg.partition_meta(&workflow_id))
            .arg(item_id.to_string())
            .arg(lease_id.to_string())
            .arg(expiry_ms)
            .arg(now_ms)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => {
                debug!(item = %item_id, lease = %lease_id, "leased item");
                Ok(lease_id)
            }
            1 => Err(QueueError::ItemNotFound),
            2 => Err(QueueError::ItemAlreadyLeased),
            other => Err(unexpected("lease", other)),
        }
    }

    /// Renews the lease on `item`, trading the caller's current token for a
    /// fresh one expiring `duration` from now.
    pub async fn extend_lease(
        &self,
        item: &QueueItem,
        lease_id: Ulid,
        duration: Duration,
    ) -> Result<Ulid> {
        let now_ms = self.now().timestamp_millis();
        let expiry_ms = now_ms + duration.as_millis() as i64;
        let next_id = self.mint_lease_id(expiry_ms);

        let mut conn = self.conn.clone();
        let status = scripts::extend_lease()
            .key(self.kg.queue_item())
            .key(self.kg.queue_index(&item.workflow_id))
            .arg(item.id.to_string())
            .arg(lease_id.to_string())
            .arg(next_id.to_string())
            .arg(expiry_ms)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => {
                debug!(item = %item.id, lease = %next_id, "extended lease");
                Ok(next_id)
            }
            1 => Err(QueueError::ItemNotFound),
            2 => Err(QueueError::ItemNotLeased),
            3 => Err(QueueError::ItemLeaseMismatch),
            other => Err(unexpected("extend_lease", other)),
        }
    }

    /// Removes `item` permanently and arms its idempotency gate. Dequeueing
    /// an item that is already gone succeeds, so deletes are safe to retry.
    pub async fn dequeue(&self, item: &QueueItem) -> Result<()> {
        let now_ms = self.now().timestamp_millis();

        let mut conn = self.conn.clone();
        let status = scripts::dequeue()
            .key(self.kg.queue_item())
            .key(self.kg.queue_index(&item.workflow_id))
            .key(self.kg.partition_meta(&item.workflow_id))
            .key(self.kg.idempotency(&item.id))
            .arg(item.id.to_string())
            .arg(self.idempotency_ttl.as_secs() as i64)
            .arg(now_ms)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => {
                debug!(item = %item.id, workflow = %item.workflow_id, "dequeued item");
                Ok(())
            }
            other => Err(unexpected("dequeue", other)),
        }
    }

    /// Returns `item` to its partition with a new ready time, clearing any
    /// lease. The partition's next-ready time then tracks its earliest
    /// remaining item, so requeueing a partition's only item reschedules the
    /// partition itself.
    pub async fn requeue(&self, item: &QueueItem, at: DateTime<Utc>) -> Result<()> {
        let now_ms = self.now().timestamp_millis();

        let mut updated = item.clone();
        updated.lease_id = None;
        updated.at_ms = at.timestamp_millis();
        let encoded = serde_json::to_string(&updated)?;

        let mut conn = self.conn.clone();
        let status = scripts::requeue()
            .key(self.kg.queue_item())
            .key(self.kg.queue_index(&item.workflow_id))
            .key(self.kg.partition_item())
            .key(self.kg.partition_index())
            .key(self.kg.partition_meta(&item.workflow_id))
            .arg(item.id.to_string())
            .arg(encoded)
            .arg(updated.at_ms)
            .arg(item.workflow_id.to_string())
            .arg(now_ms)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => {
                debug!(item = %item.id, at_ms = updated.at_ms, "requeued item");
                Ok(())
            }
            1 => Err(QueueError::ItemNotFound),
            other => Err(unexpected("requeue", other)),
        }
    }

    /// Returns up to `limit` partitions ready at or before `until`.
    ///
    /// Sequential mode returns them earliest first and is meant for the
    /// single holder of the sequential lease. Otherwise the result is a
    /// weighted random permutation favouring higher-priority partitions, so
    /// concurrent workers fan out instead of stampeding the head.
    pub async fn partition_peek(
        &self,
        sequential: bool,
        until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuePartition>> {
        let limit = clamp_limit(limit, PARTITION_PEEK_DEFAULT, self.partition_peek_max);

        let mut conn = self.conn.clone();
        let rows = scripts::peek()
            .key(self.kg.partition_index())
            .key(self.kg.partition_item())
            .arg(until.timestamp())
            .arg(limit)
            .invoke_async::<Vec<Option<String>>>(&mut conn)
            .await?;

        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows.into_iter().flatten() {
            partitions.push(serde_json::from_str::<QueuePartition>(&row)?);
        }

        if sequential {
            return Ok(partitions);
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sampling::weighted_permutation(
            &mut *rng,
            partitions,
            QueuePartition::peek_weight,
        ))
    }

    /// Claims `workflow_id` so one worker may drain it. The partition's
    /// index score advances to the lease expiry, parking it behind every
    /// ready partition until then.
    pub async fn partition_lease(&self, workflow_id: Uuid, duration: Duration) -> Result<Ulid> {
        let now = self.now();
        let now_ms = now.timestamp_millis();
        let expiry_ms = now_ms + duration.as_millis() as i64;
        let lease_id = self.mint_lease_id(expiry_ms);

        let mut conn = self.conn.clone();
        let status = scripts::partition_lease()
            .key(self.kg.partition_item())
            .key(self.kg.partition_index())
            .arg(workflow_id.to_string())
            .arg(lease_id.to_string())
            .arg(expiry_ms / 1000)
            .arg(now_ms)
            .arg(now.timestamp())
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => {
                debug!(workflow = %workflow_id, lease = %lease_id, "leased partition");
                Ok(lease_id)
            }
            1 => Err(QueueError::PartitionNotFound),
            2 => Err(QueueError::PartitionAlreadyLeased),
            other => Err(unexpected("partition_lease", other)),
        }
    }

    /// Releases `workflow_id` after a worker iteration, rescheduling it for
    /// its earliest unleased item, or for `at` when everything is leased.
    ///
    /// An empty partition (no indexed items, no in-progress leases) is
    /// deleted outright and reported as
    /// [`QueueError::PartitionGarbageCollected`], which callers treat as a
    /// successful end state.
    pub async fn partition_requeue(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let now_ms = self.now().timestamp_millis();

        let mut conn = self.conn.clone();
        let status = scripts::partition_requeue()
            .key(self.kg.partition_item())
            .key(self.kg.partition_index())
            .key(self.kg.partition_meta(&workflow_id))
            .key(self.kg.queue_index(&workflow_id))
            .key(self.kg.queue_item())
            .arg(workflow_id.to_string())
            .arg(at.timestamp())
            .arg(now_ms)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => {
                debug!(workflow = %workflow_id, "requeued partition");
                Ok(())
            }
            1 => Err(QueueError::PartitionNotFound),
            2 => {
                debug!(workflow = %workflow_id, "garbage collected empty partition");
                Err(QueueError::PartitionGarbageCollected)
            }
            other => Err(unexpected("partition_requeue", other)),
        }
    }

    /// Overrides the cached priority for `workflow_id`. Rejects values below
    /// the floor with [`QueueError::PriorityTooLow`].
    pub async fn partition_reprioritize(&self, workflow_id: Uuid, priority: u32) -> Result<()> {
        if priority > PRIORITY_MIN {
            return Err(QueueError::PriorityTooLow);
        }

        let mut conn = self.conn.clone();
        let status = scripts::partition_reprioritize()
            .key(self.kg.partition_item())
            .arg(workflow_id.to_string())
            .arg(priority)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => Ok(()),
            1 => Err(QueueError::PartitionNotFound),
            other => Err(unexpected("partition_reprioritize", other)),
        }
    }

    /// Claims or renews the process-wide sequential-scanner lease. Passing
    /// the currently held token extends it; otherwise the call fails with
    /// [`QueueError::SequentialAlreadyLeased`] while a live lease is held
    /// elsewhere.
    pub async fn lease_sequential(
        &self,
        duration: Duration,
        existing: Option<Ulid>,
    ) -> Result<Ulid> {
        let now_ms = self.now().timestamp_millis();
        let expiry_ms = now_ms + duration.as_millis() as i64;
        let lease_id = self.mint_lease_id(expiry_ms);

        let mut conn = self.conn.clone();
        let status = scripts::lease_sequential()
            .key(self.kg.sequential())
            .arg(lease_id.to_string())
            .arg(existing.map(|id| id.to_string()).unwrap_or_default())
            .arg(now_ms)
            .invoke_async::<i64>(&mut conn)
            .await?;

        match status {
            0 => Ok(lease_id),
            1 => Err(QueueError::SequentialAlreadyLeased),
            other => Err(unexpected("lease_sequential", other)),
        }
    }
}

fn unexpected(script: &'static str, status: i64) -> QueueError {
    QueueError::UnexpectedStatus { script, status }
}

fn clamp_limit(limit: i64, default: i64, max: i64) -> i64 {
    if limit <= 0 { default } else { limit.min(max) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(0, 250, 1000), 250);
        assert_eq!(clamp_limit(-5, 250, 1000), 250);
        assert_eq!(clamp_limit(10, 250, 1000), 10);
        assert_eq!(clamp_limit(5000, 250, 1000), 1000);
    }
}
