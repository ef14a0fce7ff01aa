//! Store calls under a deadline

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use waypoint_store::{CoordinationStore, KeyValue, StoreResult, WatchStream};
use waypoint_types::LeaseId;

use crate::error::{RegistryError, Result};

/// Shared store handle that bounds every call by `timeout`.
#[derive(Clone)]
pub(crate) struct TimedStore {
    inner: Arc<dyn CoordinationStore>,
    timeout: Duration,
}

impl TimedStore {
    pub(crate) fn new(inner: Arc<dyn CoordinationStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RegistryError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }

    pub(crate) async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.call("grant", self.inner.grant(ttl)).await
    }

    pub(crate) async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        self.call("put", self.inner.put(key, value, lease)).await
    }

    pub(crate) async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        self.call("put_if_absent", self.inner.put_if_absent(key, value, lease))
            .await
    }

    pub(crate) async fn get(&self, key: &str, with_prefix: bool) -> Result<Vec<KeyValue>> {
        self.call("get", self.inner.get(key, with_prefix)).await
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<bool> {
        self.call("delete", self.inner.delete(key)).await
    }

    pub(crate) async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration> {
        self.call("keep_alive", self.inner.keep_alive_once(lease))
            .await
    }

    pub(crate) async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.call("revoke", self.inner.revoke(lease)).await
    }

    pub(crate) async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.call("watch", self.inner.watch(prefix)).await
    }
}
