use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CREATE_CHECKOUT_SESSION: &str = "create_checkout_session";

/// Fixed-width time buckets used to scope idempotency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyWindow {
    width_secs: i64,
}

impl IdempotencyWindow {
    pub fn new(width_secs: i64) -> Self {
        Self {
            width_secs: width_secs.max(1),
        }
    }

    pub fn bucket(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.width_secs)
    }

    /// First instant after the bucket containing `now`.
    pub fn bucket_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let end = (self.bucket(now) + 1) * self.width_secs;
        Utc.timestamp_opt(end, 0).single().unwrap_or(now)
    }
}

/// Inputs identifying one logical checkout attempt.
#[derive(Debug, Clone, Copy)]
pub struct IdempotencyKeyParts<'a> {
    pub operation: &'a str,
    pub event_id: Uuid,
    /// User id when the guest is signed in, attendance id otherwise
    pub subject_id: Uuid,
    pub amount: i64,
    pub currency: &'a str,
}

/// Deterministic key: identical parts in the same bucket yield the same key.
pub fn derive_key(parts: &IdempotencyKeyParts<'_>, bucket: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.operation.as_bytes());
    hasher.update(b"|");
    hasher.update(parts.event_id.as_bytes());
    hasher.update(b"|");
    hasher.update(parts.subject_id.as_bytes());
    hasher.update(b"|");
    hasher.update(parts.amount.to_be_bytes());
    hasher.update(b"|");
    hasher.update(parts.currency.to_ascii_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_be_bytes());
    hex::encode(hasher.finalize())
}
