//! Store-side scripts implementing each state transition.
//!
//! Every multi-key mutation in the queue happens inside exactly one of these
//! scripts, so each transition is all-or-nothing and a single round-trip.
//! Scripts reply with a small integer status; the caller maps non-zero
//! statuses onto [`crate::QueueError`] variants.
//!
//! Lease tokens are ULID strings, so liveness checks inside Lua decode the
//! first ten Crockford-base32 characters into the embedded millisecond
//! timestamp. 48-bit values are exact in Lua's doubles.

use redis::Script;

const DECODE_ULID_TIME: &str = r#"
local function decode_ulid_time(s)
    if type(s) ~= "string" or #s < 10 then
        return 0
    end
    local encoding = "0123456789ABCDEFGHJKMNPQRSTVWXYZ"
    local ms = 0
    for i = 1, 10 do
        local idx = string.find(encoding, string.sub(s, i, i), 1, true)
        if idx == nil then
            return 0
        end
        ms = ms * 32 + (idx - 1)
    end
    return ms
end

local function lease_live(lease_id, now_ms)
    return lease_id ~= nil and lease_id ~= cjson.null
        and decode_ulid_time(lease_id) > now_ms
end
"#;

fn with_ulid_helpers(body: &str) -> Script {
    Script::new(&format!("{DECODE_ULID_TIME}\n{body}"))
}

/// Enqueue an item and upsert its partition.
///
/// KEYS: item hash, partition ready index, partition hash, partition index,
/// idempotency key. ARGV: item ID, encoded item, ready time (ms), workflow
/// ID, encoded fresh partition, ready time (s).
///
/// Replies `1` when the item already exists or its idempotency gate is set.
/// The partition's next-ready time only ever moves earlier here; existing
/// priority, lease, and last-leased fields are preserved.
pub fn enqueue() -> Script {
    Script::new(
        r#"
        if redis.call("HEXISTS", KEYS[1], ARGV[1]) == 1 then
            return 1
        end
        if redis.call("EXISTS", KEYS[5]) == 1 then
            return 1
        end

        redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
        redis.call("ZADD", KEYS[2], tonumber(ARGV[3]), ARGV[1])

        local at_s = tonumber(ARGV[6])
        local existing = redis.call("HGET", KEYS[3], ARGV[4])
        if existing == false then
            redis.call("HSET", KEYS[3], ARGV[4], ARGV[5])
            redis.call("ZADD", KEYS[4], at_s, ARGV[4])
            return 0
        end

        local current = redis.call("ZSCORE", KEYS[4], ARGV[4])
        if current == false or at_s < tonumber(current) then
            local partition = cjson.decode(existing)
            partition.atS = at_s
            redis.call("HSET", KEYS[3], ARGV[4], cjson.encode(partition))
            redis.call("ZADD", KEYS[4], at_s, ARGV[4])
        end
        return 0
        "#,
    )
}

/// Read up to ARGV[2] members of the zset KEYS[1] scored at or below ARGV[1]
/// and return their encoded records from the hash KEYS[2], in score order.
///
/// Shared by item peek and partition peek; members deleted between the range
/// read and the hash read come back as nil and are dropped by the caller.
pub fn peek() -> Script {
    Script::new(
        r#"
        local ids = redis.call(
            "ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[2]))
        if #ids == 0 then
            return {}
        end
        return redis.call("HMGET", KEYS[2], unpack(ids))
        "#,
    )
}

/// Lease an item for exclusive processing.
///
/// KEYS: item hash, partition ready index, partition meta hash. ARGV: item
/// ID, new lease token, new index score (ms, = lease expiry), now (ms).
///
/// Replies `1` when the item is missing and `2` when a live lease exists.
/// The in-progress counter bumps only for a first lease; re-leasing after
/// expiry leaves it alone, since the expired lease already counted. The
/// score bump keeps peeks cheap; the lease field on the item stays the
/// authoritative exclusion.
pub fn lease() -> Script {
    with_ulid_helpers(
        r#"
        local encoded = redis.call("HGET", KEYS[1], ARGV[1])
        if encoded == false then
            return 1
        end
        local item = cjson.decode(encoded)
        local fresh = true
        if item.leaseID ~= nil and item.leaseID ~= cjson.null then
            if lease_live(item.leaseID, tonumber(ARGV[4])) then
                return 2
            end
            fresh = false
        end
        item.leaseID = ARGV[2]
        redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(item))
        redis.call("ZADD", KEYS[2], tonumber(ARGV[3]), ARGV[1])
        if fresh then
            redis.call("HINCRBY", KEYS[3], "n", 1)
        end
        return 0
        "#,
    )
}

/// Swap an item's lease token for a later one.
///
/// KEYS: item hash, partition ready index. ARGV: item ID, expected current
/// token, new token, new index score (ms).
///
/// Replies `1` missing, `2` not leased, `3` token mismatch. Expiry of the
/// current token is deliberately not checked: the holder may renew late as
/// long as nobody else claimed the item in between.
pub fn extend_lease() -> Script {
    Script::new(
        r#"
        local encoded = redis.call("HGET", KEYS[1], ARGV[1])
        if encoded == false then
            return 1
        end
        local item = cjson.decode(encoded)
        if item.leaseID == nil or item.leaseID == cjson.null then
            return 2
        end
        if item.leaseID ~= ARGV[2] then
            return 3
        end
        item.leaseID = ARGV[3]
        redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(item))
        redis.call("ZADD", KEYS[2], tonumber(ARGV[4]), ARGV[1])
        return 0
        "#,
    )
}

/// Remove an item permanently.
///
/// KEYS: item hash, partition ready index, partition meta hash, idempotency
/// key. ARGV: item ID, idempotency TTL (s, 0 disables), now (ms).
///
/// Deletes are safe to retry: a missing item is a no-op success, and the
/// idempotency gate is (re)armed either way. The in-progress counter drops
/// only when a live lease is being retired, and never below zero.
pub fn dequeue() -> Script {
    with_ulid_helpers(
        r#"
        local encoded = redis.call("HGET", KEYS[1], ARGV[1])
        if encoded ~= false then
            local item = cjson.decode(encoded)
            if lease_live(item.leaseID, tonumber(ARGV[3])) then
                if redis.call("HINCRBY", KEYS[3], "n", -1) < 0 then
                    redis.call("HSET", KEYS[3], "n", 0)
                end
            end
            redis.call("HDEL", KEYS[1], ARGV[1])
            redis.call("ZREM", KEYS[2], ARGV[1])
        end
        local ttl = tonumber(ARGV[2])
        if ttl > 0 then
            redis.call("SET", KEYS[4], "", "EX", ttl)
        end
        return 0
        "#,
    )
}

/// Return an item to the queue at a new ready time, clearing its lease.
///
/// KEYS: item hash, partition ready index, partition hash, partition index,
/// partition meta hash. ARGV: item ID, re-encoded item (lease cleared, new
/// ready time), ready time (ms), workflow ID, now (ms).
///
/// Replies `1` when the item is missing. The partition then follows the
/// earliest entry left in its ready index, so requeueing the sole item of a
/// partition into the future moves the whole partition out with it.
pub fn requeue() -> Script {
    with_ulid_helpers(
        r#"
        local encoded = redis.call("HGET", KEYS[1], ARGV[1])
        if encoded == false then
            return 1
        end
        local item = cjson.decode(encoded)
        if lease_live(item.leaseID, tonumber(ARGV[5])) then
            if redis.call("HINCRBY", KEYS[5], "n", -1) < 0 then
                redis.call("HSET", KEYS[5], "n", 0)
            end
        end
        redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
        redis.call("ZADD", KEYS[2], tonumber(ARGV[3]), ARGV[1])

        local head = redis.call("ZRANGE", KEYS[2], 0, 0, "WITHSCORES")
        if head[2] ~= nil then
            local at_s = math.floor(tonumber(head[2]) / 1000)
            local existing = redis.call("HGET", KEYS[3], ARGV[4])
            if existing ~= false then
                local partition = cjson.decode(existing)
                partition.atS = at_s
                redis.call("HSET", KEYS[3], ARGV[4], cjson.encode(partition))
            end
            redis.call("ZADD", KEYS[4], at_s, ARGV[4])
        end
        return 0
        "#,
    )
}

/// Claim a partition for a single worker.
///
/// KEYS: partition hash, partition index. ARGV: workflow ID, new lease
/// token, lease expiry (s), now (ms), now (s).
///
/// Replies `1` missing, `2` live lease held elsewhere. On success the
/// partition's score advances to the lease expiry, pushing it behind every
/// partition that is actually ready.
pub fn partition_lease() -> Script {
    with_ulid_helpers(
        r#"
        local encoded = redis.call("HGET", KEYS[1], ARGV[1])
        if encoded == false then
            return 1
        end
        local partition = cjson.decode(encoded)
        if lease_live(partition.leaseID, tonumber(ARGV[4])) then
            return 2
        end
        partition.leaseID = ARGV[2]
        partition.atS = tonumber(ARGV[3])
        partition.last = tonumber(ARGV[5])
        redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(partition))
        redis.call("ZADD", KEYS[2], tonumber(ARGV[3]), ARGV[1])
        return 0
        "#,
    )
}

/// Release a partition after a worker iteration.
///
/// KEYS: partition hash, partition index, partition meta hash, partition
/// ready index, item hash. ARGV: workflow ID, requested next-ready time (s),
/// now (ms).
///
/// Replies `1` when the partition record is missing and `2` after garbage
/// collecting an empty partition (no indexed items, no in-progress leases).
/// Otherwise the lease clears and the next-ready time becomes the earliest
/// unleased item, found by paging through the whole ready index in score
/// order; only when every indexed item is under a live lease does the
/// caller's requested time win.
pub fn partition_requeue() -> Script {
    with_ulid_helpers(
        r#"
        local encoded = redis.call("HGET", KEYS[1], ARGV[1])
        if encoded == false then
            return 1
        end

        local item_count = redis.call("ZCARD", KEYS[4])
        local in_progress = tonumber(redis.call("HGET", KEYS[3], "n")) or 0
        if item_count == 0 and in_progress == 0 then
            redis.call("HDEL", KEYS[1], ARGV[1])
            redis.call("ZREM", KEYS[2], ARGV[1])
            redis.call("DEL", KEYS[3])
            return 2
        end

        local partition = cjson.decode(encoded)
        partition.leaseID = nil

        local at_s = tonumber(ARGV[2])
        local now_ms = tonumber(ARGV[3])
        local offset = 0
        local page = 100
        while true do
            local entries = redis.call(
                "ZRANGE", KEYS[4], offset, offset + page - 1, "WITHSCORES")
            if entries[1] == nil then
                break
            end
            local hit = nil
            local i = 1
            while entries[i] ~= nil do
                local item_encoded = redis.call("HGET", KEYS[5], entries[i])
                if item_encoded ~= false then
                    local item = cjson.decode(item_encoded)
                    if not lease_live(item.leaseID, now_ms) then
                        hit = math.floor(tonumber(entries[i + 1]) / 1000)
                        break
                    end
                end
                i = i + 2
            end
            if hit ~= nil then
                at_s = hit
                break
            end
            offset = offset + page
        end

        partition.atS = at_s
        redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(partition))
        redis.call("ZADD", KEYS[2], at_s, ARGV[1])
        return 0
        "#,
    )
}

/// Rewrite a partition's cached priority. KEYS: partition hash. ARGV:
/// workflow ID, priority. Replies `1` when missing. The partition index
/// score is untouched: priority only biases peek sampling.
pub fn partition_reprioritize() -> Script {
    Script::new(
        r#"
        local encoded = redis.call("HGET", KEYS[1], ARGV[1])
        if encoded == false then
            return 1
        end
        local partition = cjson.decode(encoded)
        partition.priority = tonumber(ARGV[2])
        redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(partition))
        return 0
        "#,
    )
}

/// Claim or extend the process-wide sequential-scanner lease.
///
/// KEYS: sequential key. ARGV: new lease token, caller's current token (may
/// be empty), now (ms). Replies `1` when a live lease is held by someone
/// else; presenting the matching token renews it.
pub fn lease_sequential() -> Script {
    with_ulid_helpers(
        r#"
        local current = redis.call("GET", KEYS[1])
        if current ~= false and lease_live(current, tonumber(ARGV[3]))
            and current ~= ARGV[2] then
            return 1
        end
        redis.call("SET", KEYS[1], ARGV[1])
        return 0
        "#,
    )
}
