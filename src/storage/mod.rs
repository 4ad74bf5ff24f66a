//! Key-value storage backends
//!
//! The verification service needs an opaque key→value map with per-key TTL
//! and an atomic read-and-delete. Two backends implement the contract: a
//! local sharded cache and a remote Redis client.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("ttl must be positive: {0}")]
    InvalidTtl(i64),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// KV store contract consumed by the verification service.
///
/// `take` is the linearization point of the whole system: under concurrent
/// callers at most one may observe the key present.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomic read-and-delete. Returns `None` when the key is absent or
    /// expired; no two concurrent calls may both receive the value.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `value` with an absolute TTL. Rejects non-positive TTLs.
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), StoreError>;
}
