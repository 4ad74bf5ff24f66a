//! In-memory store
//!
//! A sharded `HashMap` with per-shard mutexes. Shard selection doubles as
//! the lock stripe for `take`: `nonce:` keys map directly through their
//! first two hex characters, so unrelated nonces never contend on one lock.
//! Expiry is lazy: expired entries are treated as absent and removed on the
//! next read.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{Store, StoreError};

const SHARD_COUNT: usize = 256;

struct Entry {
    value: String,
    expires_at: i64,
}

pub struct MemoryStore {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        &self.shards[shard_index(key)]
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_index(key: &str) -> usize {
    // nonce keys carry their own uniform randomness in the first two hex
    // characters; use them directly instead of hashing.
    const NONCE_PREFIX: &str = "nonce:";
    let bytes = key.as_bytes();
    if bytes.len() >= NONCE_PREFIX.len() + 2 && key.starts_with(NONCE_PREFIX) {
        let hi = from_hex_nibble(bytes[NONCE_PREFIX.len()]);
        let lo = from_hex_nibble(bytes[NONCE_PREFIX.len() + 1]);
        if let (Some(hi), Some(lo)) = (hi, lo) {
            return ((hi << 4) | lo) as usize;
        }
    }
    fnv1a(bytes) as usize % SHARD_COUNT
}

fn from_hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now().timestamp();
        let mut shard = self.shard(key).lock().expect("store shard poisoned");
        match shard.get(key) {
            Some(entry) if now >= entry.expires_at => {
                shard.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now().timestamp();
        let mut shard = self.shard(key).lock().expect("store shard poisoned");
        match shard.remove(key) {
            Some(entry) if now >= entry.expires_at => Ok(None),
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), StoreError> {
        if ttl_seconds <= 0 {
            return Err(StoreError::InvalidTtl(ttl_seconds));
        }
        let entry = Entry {
            value: value.to_string(),
            expires_at: Utc::now().timestamp() + ttl_seconds,
        };
        let mut shard = self.shard(key).lock().expect("store shard poisoned");
        shard.insert(key.to_string(), entry);
        Ok(())
    }
}
