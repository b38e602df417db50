// src/store/mod.rs
//
// Index-store seam. The guardian's shared state (band indexes, scores,
// caches, sync cursor, whitelists) lives in a Redis-compatible server; this
// trait is the thin adapter the rest of the engine talks to, with the
// pipelined multi-key operations the matcher and learner lean on. The
// in-memory implementation backs tests and Redis-less development runs.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out")]
    Timeout,
}

#[async_trait]
pub trait IndexStore: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), StoreError>;

    // Scalars.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    /// SET NX EX in one shot; `false` when the key already existed.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    // Sets.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // Pipelined multi-key operations (one round trip each).
    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, StoreError>;
    async fn smembers_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>, StoreError>;
    async fn expire_many(&self, keys: &[String], ttl: Duration) -> Result<(), StoreError>;
    /// SADD each (key, member) pair, refreshing each key's TTL when given.
    async fn sadd_many(
        &self,
        entries: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;
    /// SET each key to the literal "1" with no TTL.
    async fn set_flags(&self, keys: &[String]) -> Result<(), StoreError>;
    async fn del_many(&self, keys: &[String]) -> Result<(), StoreError>;
    /// SCAN-walk and delete every key under `prefix`. Returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;
}

// ── Keyspace ──────────────────────────────────────────────────────────────────

/// Key builders for the guardian's Redis layout. Prefixes are part of the
/// on-the-wire contract with existing deployments and must not change.
pub mod keys {
    pub const GLOBAL_BAND_PREFIX: &str = "mi_f:";
    pub const LOCAL_BAND_PREFIX: &str = "lg_f:";
    pub const LOCAL_SCORE_PREFIX: &str = "lg_s:";
    pub const ORACLE_BAND_PREFIX: &str = "oc_f:";
    pub const ORACLE_VERDICT_PREFIX: &str = "mi:oracle_cache:";
    pub const SCAN_RECORD_PREFIX: &str = "mi:msgid:";
    pub const REPORT_GUARD_PREFIX: &str = "mi:rpt:";
    pub const WHITELIST_DOMAIN: &str = "mi:whitelist:domain";
    pub const WHITELIST_EMAIL: &str = "mi:whitelist:email";
    pub const NODE_ID: &str = "mi_meta:id";
    pub const SYNC_SEQ: &str = "mi_meta:v";

    pub fn global_band(band: &str) -> String {
        format!("{GLOBAL_BAND_PREFIX}{band}")
    }

    pub fn local_band(band: &str) -> String {
        format!("{LOCAL_BAND_PREFIX}{band}")
    }

    pub fn local_score(digest: &str) -> String {
        format!("{LOCAL_SCORE_PREFIX}{digest}")
    }

    pub fn oracle_band(band: &str) -> String {
        format!("{ORACLE_BAND_PREFIX}{band}")
    }

    pub fn oracle_verdict(digest: &str) -> String {
        format!("{ORACLE_VERDICT_PREFIX}{digest}")
    }

    pub fn scan_record(message_id_hash: &str) -> String {
        format!("{SCAN_RECORD_PREFIX}{message_id_hash}")
    }

    pub fn report_guard(message_id_hash: &str, report_type: &str) -> String {
        format!("{REPORT_GUARD_PREFIX}{message_id_hash}:{report_type}")
    }
}

/// Hex SHA-1 of a message-id, the key derivation shared by the scan-record
/// writer and the report pipeline.
pub fn message_id_hash(message_id: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(message_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_builders_use_contract_prefixes() {
        assert_eq!(keys::global_band("1:AABBCC"), "mi_f:1:AABBCC");
        assert_eq!(keys::local_band("1:AABBCC"), "lg_f:1:AABBCC");
        assert_eq!(keys::local_score("T1AA"), "lg_s:T1AA");
        assert_eq!(keys::oracle_band("2:DDEEFF"), "oc_f:2:DDEEFF");
        assert_eq!(keys::oracle_verdict("T1AA"), "mi:oracle_cache:T1AA");
        assert_eq!(keys::report_guard("abc", "spam"), "mi:rpt:abc:spam");
    }

    #[test]
    fn message_id_hash_is_stable_hex_sha1() {
        let h = message_id_hash("<m1@x>");
        assert_eq!(h.len(), 40);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, message_id_hash("<m1@x>"));
        assert_ne!(h, message_id_hash("<m2@x>"));
    }
}
