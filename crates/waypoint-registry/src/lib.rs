//! Waypoint Registry - Lease-based service registration and discovery
//!
//! A service instance announces itself by writing its [`ServiceRecord`] under
//! `<prefix>/<name>/<address>:<port>`, bound to a lease that a background
//! heartbeat keeps renewing. If the process dies or cannot reach the store,
//! the lease lapses and the record disappears; absence from discovery is the
//! liveness signal.
//!
//! Consumers subscribe to a service name and receive the full instance set
//! on every change, then pick an instance with a [`Strategy`].
//!
//! ```ignore
//! let registry = Registry::new(store, RegistryConfig::default())?;
//!
//! let me = ServiceRecord::new("orders", "10.0.0.5", 8080, Duration::from_secs(5));
//! let registration = registry.register(me).await?;
//!
//! let rr = RoundRobin::new();
//! let subscription = registry
//!     .subscribe("payments", move |set| {
//!         if let Some(target) = rr.select(&set.records()) {
//!             tracing::info!(endpoint = %target.endpoint(), "next payments target");
//!         }
//!     })
//!     .await?;
//!
//! // ...
//! subscription.cancel();
//! registry.shutdown().await;
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod discovery;
pub mod error;
mod heartbeat;
pub mod lock;
pub mod registration;
pub mod registry;
pub mod strategy;
mod timed;

// Re-exports
pub use config::{HeartbeatConfig, RegistryConfig, WatchConfig};
pub use discovery::{InstanceSet, Subscription};
pub use error::{RegistryError, Result};
pub use lock::{Locker, StoreLocker};
pub use registration::{HeartbeatState, Registration};
pub use registry::Registry;
pub use strategy::{LoadBalanceStrategy, RandomChoice, RoundRobin, Strategy};

pub use tokio_util::sync::CancellationToken;
pub use waypoint_store::{CoordinationStore, MemoryStore};
pub use waypoint_types::{LeaseId, RecordError, ServiceRecord};
