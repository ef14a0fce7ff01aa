//! Coordination store contract

use std::time::Duration;

use async_trait::async_trait;
use waypoint_types::LeaseId;

use crate::error::StoreResult;
use crate::watch::WatchStream;

/// A key/value pair read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,

    /// Lease the key is bound to, if any.
    pub lease: Option<LeaseId>,

    /// Store revision at which the key was created.
    pub create_revision: i64,

    /// Store revision of the last write to the key.
    pub mod_revision: i64,
}

/// Networked key/value store with leases and prefix watches.
///
/// Implementations must be safe to share across tasks; the registry holds one
/// `Arc<dyn CoordinationStore>` for the whole process.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease that expires after `ttl` unless renewed.
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Write `value` under `key`, bound to `lease` when given.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Write only if `key` does not exist. Returns whether the write happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool>;

    /// Read `key`, or every key starting with `key` when `with_prefix` is set.
    /// Results are ordered by key.
    async fn get(&self, key: &str, with_prefix: bool) -> StoreResult<Vec<KeyValue>>;

    /// Delete `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Renew `lease` once. Returns the TTL it was renewed for.
    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<Duration>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Stream put/delete events for keys under `prefix`.
    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream>;
}
