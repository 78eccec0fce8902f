use crate::clock::Clock;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Field separator in the serialized tag forms. The mutex name is always
/// the last field so it may itself contain the delimiter.
pub const FIELD_DELIMITER: char = ':';

/// The serialized record representing a lock's current claim: who holds
/// it, for how long, and until when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    expiry_time: i64,
    lease_seconds: u32,
    owner_id: String,
    name: String,
}

impl Tag {
    pub fn new(
        expiry_time: i64,
        lease_seconds: u32,
        owner_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Tag {
            expiry_time,
            lease_seconds,
            owner_id: owner_id.into(),
            name: name.into(),
        }
    }

    /// Unix timestamp at which the lease ends.
    pub fn expiry_time(&self) -> i64 {
        self.expiry_time
    }

    pub fn lease_seconds(&self) -> u32 {
        self.lease_seconds
    }

    /// Per-attempt token identifying the acquisition that wrote this tag.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A tag is live while its lease has not yet run out.
    pub fn is_live(&self, now_secs: i64) -> bool {
        self.expiry_time >= now_secs
    }

    /// Unix timestamp at which the lock was granted.
    pub fn started_at(&self) -> i64 {
        self.expiry_time - i64::from(self.lease_seconds)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.expiry_time, 0)
            .single()
            .unwrap_or_default()
    }
}

/// Derive the stable storage identifier for a mutex name.
///
/// Collision-free for practical purposes; truncated so file names and
/// table keys stay short.
pub fn tag_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..40].to_string()
}

/// Generate a fresh owner token for one acquisition attempt.
///
/// Not a stable process identity: two attempts by the same code path get
/// different tokens, which is what lets the verify step tell them apart.
pub fn owner_token(clock: &dyn Clock) -> String {
    let micros = clock.now().timestamp_micros();
    let nonce: u32 = rand::thread_rng().gen();
    format!("{}-{:08x}", micros, nonce)
}
