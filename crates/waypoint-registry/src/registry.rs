//! Registry client.
//!
//! The [`Registry`] is the one long-lived handle a process uses to register
//! itself and discover others. Build it once at startup and clone it into
//! whatever needs it; every clone shares the same store connection and the
//! same set of background tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use waypoint_store::CoordinationStore;
use waypoint_types::{service_prefix, ServiceRecord};

use crate::config::RegistryConfig;
use crate::discovery::{fetch, InstanceSet, Subscription, Watcher};
use crate::error::{RegistryError, Result};
use crate::heartbeat;
use crate::lock::StoreLocker;
use crate::registration::{deregister, Registration};
use crate::timed::TimedStore;

struct Inner {
    store: TimedStore,
    config: RegistryConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Handle onto the service registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create a registry over `store`.
    pub fn new(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let store = TimedStore::new(store, config.request_timeout);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(RegistryError::ShuttingDown);
        }
        Ok(())
    }

    /// Register `record` and keep it alive until cancelled or shut down.
    ///
    /// Registering the same record twice without unregistering in between
    /// yields two independent leases and heartbeats on the same key.
    pub async fn register(&self, record: ServiceRecord) -> Result<Registration> {
        let cancel = self.inner.shutdown.child_token();
        self.register_inner(record, cancel).await
    }

    /// Like [`register`](Self::register), but the heartbeat also stops (and
    /// deregisters) when `lifecycle` is cancelled.
    pub async fn register_with_lifecycle(
        &self,
        record: ServiceRecord,
        lifecycle: &CancellationToken,
    ) -> Result<Registration> {
        self.register_inner(record, lifecycle.child_token()).await
    }

    #[instrument(name = "register", skip_all, fields(service = %record.name, endpoint = %record.endpoint()))]
    async fn register_inner(
        &self,
        record: ServiceRecord,
        cancel: CancellationToken,
    ) -> Result<Registration> {
        self.ensure_running()?;
        record.validate()?;

        let store = &self.inner.store;
        let key = record.key(&self.inner.config.prefix);
        let value = record.encode()?;

        let lease = store.grant(record.ttl).await?;
        if let Err(e) = store.put(&key, value, Some(lease)).await {
            if let Err(revoke_err) = store.revoke(lease).await {
                debug!(lease = %lease, error = %revoke_err, "Failed to revoke lease after write failure");
            }
            return Err(e);
        }

        let ttl = record.ttl;
        let registration = Registration::new(record, key, lease, cancel);
        self.inner.tasks.spawn(heartbeat::run(
            store.clone(),
            registration.shared().clone(),
            self.inner.config.heartbeat.clone(),
            self.inner.shutdown.clone(),
        ));

        info!(key = %registration.key(), lease = %lease, ?ttl, "Service registered");
        Ok(registration)
    }

    /// Delete the registration's key and revoke its lease.
    ///
    /// A no-op when no lease is held, including after the heartbeat has
    /// already cleaned up. The heartbeat task notices on its next tick and
    /// exits. An error means the key is still present and the call can be
    /// retried; once the key is deleted a failed revoke is only logged and
    /// the lease is left to expire.
    #[instrument(skip_all, fields(key = %registration.key()))]
    pub async fn unregister(&self, registration: &Registration) -> Result<()> {
        deregister(&self.inner.store, registration.shared(), true).await
    }

    /// One-shot read of every live instance of `service`.
    #[instrument(skip(self))]
    pub async fn discover(&self, service: &str) -> Result<InstanceSet> {
        ServiceRecord::validate_name(service)?;
        let prefix = service_prefix(&self.inner.config.prefix, service);
        fetch(&self.inner.store, service, &prefix).await
    }

    /// Deliver the instance set of `service` to `callback` now and after
    /// every change.
    ///
    /// The first invocation happens before this returns; read or watch
    /// failures at that point are returned. Invocations for one subscription
    /// never overlap.
    #[instrument(skip(self, callback))]
    pub async fn subscribe<F>(&self, service: &str, mut callback: F) -> Result<Subscription>
    where
        F: FnMut(InstanceSet) + Send + 'static,
    {
        self.ensure_running()?;
        ServiceRecord::validate_name(service)?;

        let store = &self.inner.store;
        let prefix = service_prefix(&self.inner.config.prefix, service);

        // Open the watch first so nothing between the read and the watch is missed.
        let stream = store.watch(&prefix).await?;
        let initial = fetch(store, service, &prefix).await?;
        info!(instances = initial.len(), "Subscribed");
        callback(initial);

        let cancel = self.inner.shutdown.child_token();
        let watcher = Watcher {
            store: store.clone(),
            service: service.to_string(),
            prefix,
            config: self.inner.config.watch.clone(),
            callback,
            cancel: cancel.clone(),
        };
        self.inner.tasks.spawn(watcher.run(stream));

        Ok(Subscription::new(service.to_string(), cancel))
    }

    /// Lock helper sharing this registry's store. `ttl` bounds how long a
    /// crashed holder keeps the lock.
    pub fn locker(&self, ttl: Duration) -> StoreLocker {
        StoreLocker::new(
            self.inner.store.clone(),
            self.inner.config.lock_prefix.clone(),
            ttl,
        )
    }

    /// Stop every heartbeat and watch, waiting for heartbeats to deregister.
    ///
    /// Waits at most `shutdown_timeout`. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!(tasks = self.inner.tasks.len(), "Shutting down registry");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();

        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.tasks.len(),
                ?timeout,
                "Background tasks still running after shutdown timeout"
            );
        } else {
            info!("Registry shut down");
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("prefix", &self.inner.config.prefix)
            .field("tasks", &self.inner.tasks.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
