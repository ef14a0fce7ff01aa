//! etcd-backed coordination store

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use waypoint_types::LeaseId;

use crate::error::{StoreError, StoreResult};
use crate::traits::{CoordinationStore, KeyValue};
use crate::watch::{WatchEvent, WatchEventKind, WatchStream};

/// Connection settings for an etcd cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdOptions {
    pub endpoints: Vec<String>,

    #[serde(with = "secs")]
    pub dial_timeout: Duration,

    /// HTTP/2 keep-alive ping interval.
    #[serde(with = "secs")]
    pub keep_alive: Duration,

    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(30),
            username: None,
            password: None,
        }
    }
}

impl EtcdOptions {
    pub fn validate(&self) -> StoreResult<()> {
        if self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(StoreError::InvalidConfig(
                "at least one non-empty etcd endpoint is required".into(),
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(StoreError::InvalidConfig("dial_timeout must be positive".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(StoreError::InvalidConfig(
                "username and password must be set together".into(),
            ));
        }
        Ok(())
    }

    fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(self.dial_timeout)
            .with_keep_alive(self.keep_alive, self.dial_timeout);
        if let (Some(user), Some(password)) = (&self.username, &self.password) {
            options = options.with_user(user.clone(), password.clone());
        }
        options
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// [`CoordinationStore`] over an etcd v3 cluster.
///
/// `etcd_client::Client` is a cheap handle over a shared channel, so each call
/// clones it rather than serialising callers behind a lock.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(options: &EtcdOptions) -> StoreResult<Self> {
        options.validate()?;
        let client = Client::connect(options.endpoints.clone(), Some(options.connect_options()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to etcd: {e}")))?;

        info!(endpoints = ?options.endpoints, "Connected to etcd");
        Ok(Self { client })
    }
}

fn map_err(e: etcd_client::Error) -> StoreError {
    match e {
        etcd_client::Error::GRpcStatus(status) => StoreError::Unavailable(status.to_string()),
        etcd_client::Error::InvalidArgs(msg) => StoreError::InvalidArgument(msg),
        other => StoreError::Backend(other.to_string()),
    }
}

fn map_lease_err(lease: LeaseId, e: etcd_client::Error) -> StoreError {
    if e.to_string().contains("lease not found") {
        StoreError::LeaseNotFound(lease)
    } else {
        map_err(e)
    }
}

/// etcd leases are granted in whole seconds.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

fn put_options(lease: Option<LeaseId>) -> Option<PutOptions> {
    lease.map(|l| PutOptions::new().with_lease(l.get()))
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        lease: LeaseId::new(kv.lease()),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let resp = self
            .client
            .clone()
            .lease_grant(ttl_secs(ttl), None)
            .await
            .map_err(map_err)?;
        LeaseId::new(resp.id())
            .ok_or_else(|| StoreError::Backend("etcd granted lease id 0".into()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        self.client
            .clone()
            .put(key, value, put_options(lease))
            .await
            .map_err(|e| match lease {
                Some(l) => map_lease_err(l, e),
                None => map_err(e),
            })?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, put_options(lease))]);
        let resp = self.client.clone().txn(txn).await.map_err(|e| match lease {
            Some(l) => map_lease_err(l, e),
            None => map_err(e),
        })?;
        Ok(resp.succeeded())
    }

    async fn get(&self, key: &str, with_prefix: bool) -> StoreResult<Vec<KeyValue>> {
        let options = with_prefix.then(|| GetOptions::new().with_prefix());
        let resp = self
            .client
            .clone()
            .get(key, options)
            .await
            .map_err(map_err)?;
        Ok(resp.kvs().iter().map(to_key_value).collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let resp = self
            .client
            .clone()
            .delete(key, None)
            .await
            .map_err(map_err)?;
        Ok(resp.deleted() > 0)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<Duration> {
        let (mut keeper, mut stream) = self
            .client
            .clone()
            .lease_keep_alive(lease.get())
            .await
            .map_err(|e| map_lease_err(lease, e))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| map_lease_err(lease, e))?;

        match stream.message().await.map_err(|e| map_lease_err(lease, e))? {
            // etcd answers an unknown lease with a zero TTL rather than an error.
            Some(resp) if resp.ttl() <= 0 => Err(StoreError::LeaseNotFound(lease)),
            Some(resp) => Ok(Duration::from_secs(resp.ttl().unsigned_abs())),
            None => Err(StoreError::Unavailable("keep-alive stream closed".into())),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.client
            .clone()
            .lease_revoke(lease.get())
            .await
            .map_err(|e| map_lease_err(lease, e))?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let (mut watcher, mut events) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;

        let (tx, stream) = WatchStream::channel();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = events.message() => match message {
                        Ok(Some(resp)) if resp.canceled() => {
                            let reason = resp.cancel_reason().to_string();
                            warn!(prefix = %prefix, reason = %reason, "etcd cancelled watch");
                            let _ = tx.send(Err(StoreError::WatchClosed(reason)));
                            break;
                        }
                        Ok(Some(resp)) => {
                            let batch: Vec<WatchEvent> = resp
                                .events()
                                .iter()
                                .filter_map(|event| {
                                    let kv = event.kv()?;
                                    let kind = match event.event_type() {
                                        EventType::Put => WatchEventKind::Put,
                                        EventType::Delete => WatchEventKind::Delete,
                                    };
                                    Some(WatchEvent {
                                        kind,
                                        key: String::from_utf8_lossy(kv.key()).into_owned(),
                                        revision: kv.mod_revision(),
                                    })
                                })
                                .collect();
                            if !batch.is_empty() && tx.send(Ok(batch)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = tx.send(Err(StoreError::WatchClosed("etcd watch stream ended".into())));
                            break;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(map_err(e)));
                            break;
                        }
                    },
                }
            }
            if let Err(e) = watcher.cancel().await {
                debug!(prefix = %prefix, error = %e, "Failed to cancel etcd watch");
            }
        });

        Ok(stream)
    }
}
