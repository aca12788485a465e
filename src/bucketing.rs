//! Stable rollout bucketing.
//!
//! A user's bucket for a feature must never change between requests or
//! deployments, otherwise rollout membership flickers. The bucket is derived
//! from a 64-bit xxh3 hash of `feature_key:user_id` reduced into `[0, 100)`.
//! Feature keys cannot contain `:`, so the concatenation is unambiguous.

use xxhash_rust::xxh3::Xxh3;

/// Number of rollout buckets. Percentages are compared against `[0, BUCKETS)`.
pub const BUCKETS: u64 = 100;

/// Map a (feature, user) pair onto a bucket in `[0, 100)`.
pub fn bucket(feature_key: &str, user_id: &str) -> u8 {
    let mut hasher = Xxh3::new();
    hasher.update(feature_key.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    (hasher.digest() % BUCKETS) as u8
}
