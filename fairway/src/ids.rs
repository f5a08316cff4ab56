//! Lease tokens, item IDs, and the injectable clock.
//!
//! Every token is a ULID: 48 bits of millisecond timestamp followed by 80
//! bits of randomness, lexicographically sortable as a string. Lease tokens
//! reuse the timestamp as the lease *expiry*, so comparing a token's embedded
//! time against "now" is the whole liveness check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Injectable time source. Operations read it exactly once per call so a test
/// clock can be stepped deterministically.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Mints a lease token whose embedded timestamp is `expiry_ms`.
pub(crate) fn new_lease_id<R: Rng + ?Sized>(expiry_ms: i64, rng: &mut R) -> Ulid {
    Ulid::from_parts(expiry_ms.max(0) as u64, rng.random::<u128>())
}

/// Mints a fresh item ID stamped with the enqueue time.
pub(crate) fn new_item_id<R: Rng + ?Sized>(now_ms: i64, rng: &mut R) -> Ulid {
    Ulid::from_parts(now_ms.max(0) as u64, rng.random::<u128>())
}

/// Derives the deterministic item ID for a caller-supplied idempotency key:
/// the first 16 bytes of SHA-256 over the key. The same key always maps to
/// the same ID, which is what the idempotency gate keys off.
pub(crate) fn hashed_item_id(key: &str) -> Ulid {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Ulid(u128::from_be_bytes(bytes))
}

/// The expiry instant embedded in a lease token.
pub fn lease_expiry(lease_id: &Ulid) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(lease_id.timestamp_ms() as i64)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// A lease is live until strictly after its embedded timestamp.
pub fn lease_expired(lease_id: &Ulid, now: DateTime<Utc>) -> bool {
    now.timestamp_millis() > lease_id.timestamp_ms() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_lease_token_embeds_expiry() {
        let mut rng = StdRng::seed_from_u64(1);
        let expiry = Utc::now() + Duration::seconds(30);
        let token = new_lease_id(expiry.timestamp_millis(), &mut rng);

        assert_eq!(
            lease_expiry(&token).timestamp_millis(),
            expiry.timestamp_millis()
        );
        assert!(!lease_expired(&token, expiry - Duration::seconds(1)));
        assert!(!lease_expired(&token, expiry));
        assert!(lease_expired(&token, expiry + Duration::milliseconds(1)));
    }

    #[test]
    fn test_tokens_are_unique_per_draw() {
        let mut rng = StdRng::seed_from_u64(2);
        let ms = Utc::now().timestamp_millis();
        let a = new_lease_id(ms, &mut rng);
        let b = new_lease_id(ms, &mut rng);
        assert_ne!(a, b);
    }

    #[test]
    fn test_item_ids_sort_by_time() {
        let mut rng = StdRng::seed_from_u64(3);
        let early = new_item_id(1_000_000, &mut rng);
        let late = new_item_id(2_000_000, &mut rng);
        assert!(early.to_string() < late.to_string());
    }

    #[test]
    fn test_hashed_id_is_deterministic() {
        let a = hashed_item_id("once");
        let b = hashed_item_id("once");
        let c = hashed_item_id("twice");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
