//! Local node: one registration plus a subscription per watched service.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use waypoint_registry::{
    CoordinationStore, InstanceSet, MemoryStore, Registration, Registry, ServiceRecord, Strategy,
    Subscription,
};

use crate::config::{DaemonConfig, StoreConfig};
use crate::error::{DaemonError, DaemonResult};

/// Connect to the configured coordination store.
pub async fn connect_store(config: &StoreConfig) -> DaemonResult<Arc<dyn CoordinationStore>> {
    match config {
        StoreConfig::Memory => {
            warn!("Using in-memory store; registrations are visible to this process only");
            let store: Arc<dyn CoordinationStore> = MemoryStore::new();
            Ok(store)
        }
        #[cfg(feature = "etcd")]
        StoreConfig::Etcd {
            endpoints,
            dial_timeout_secs,
            keep_alive_secs,
            username,
            password,
        } => {
            let options = waypoint_store::EtcdOptions {
                endpoints: endpoints.clone(),
                dial_timeout: std::time::Duration::from_secs(*dial_timeout_secs),
                keep_alive: std::time::Duration::from_secs(*keep_alive_secs),
                username: username.clone(),
                password: password.clone(),
            };
            let store: Arc<dyn CoordinationStore> =
                Arc::new(waypoint_store::EtcdStore::connect(&options).await?);
            Ok(store)
        }
        #[cfg(not(feature = "etcd"))]
        StoreConfig::Etcd { .. } => Err(DaemonError::Config(
            "etcd store requested but waypointd was built without the `etcd` feature".into(),
        )),
    }
}

type Views = Arc<RwLock<HashMap<String, InstanceSet>>>;

/// Running registration and subscriptions for this process.
pub struct Node {
    registration: Option<Registration>,
    subscriptions: Vec<Subscription>,
    views: Views,
}

impl Node {
    pub async fn start(registry: &Registry, config: &DaemonConfig) -> DaemonResult<Self> {
        let registration = match &config.service {
            Some(service) => Some(registry.register(service.to_record()).await?),
            None => None,
        };

        let views: Views = Arc::default();
        let mut subscriptions = Vec::with_capacity(config.watch.services.len());
        for name in &config.watch.services {
            let strategy = config.watch.strategy.build();
            let views = views.clone();
            let subscription = registry
                .subscribe(name, move |set: InstanceSet| {
                    let records = set.records();
                    let target = strategy.select(&records).map(ServiceRecord::endpoint);
                    info!(
                        service = %set.service(),
                        instances = set.len(),
                        endpoints = ?set.endpoints(),
                        next = ?target,
                        "Discovered instances"
                    );
                    views.write().insert(set.service().to_string(), set);
                })
                .await?;
            subscriptions.push(subscription);
        }

        Ok(Self {
            registration,
            subscriptions,
            views,
        })
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Last instance set seen for `service`.
    pub fn instances(&self, service: &str) -> Option<InstanceSet> {
        self.views.read().get(service).cloned()
    }

    /// Cancel subscriptions. The registration is left to registry shutdown
    /// so it deregisters within the shutdown budget.
    pub fn stop(&self) {
        for subscription in &self.subscriptions {
            subscription.cancel();
        }
        if let Some(registration) = &self.registration {
            info!(key = %registration.key(), "Stopping node");
        }
    }
}
