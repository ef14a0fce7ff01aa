//! Waypoint Store - Coordination store contract and backends
//!
//! The registry never talks to a concrete store directly. It consumes the
//! [`CoordinationStore`] trait, which captures the primitives a lease-based
//! registry needs:
//!
//! - **Leases**: `grant`, `keep_alive_once`, `revoke`
//! - **Keys**: `put` (optionally bound to a lease), `put_if_absent`, `get`, `delete`
//! - **Watches**: `watch` a key prefix for put/delete events
//!
//! ## Backends
//!
//! - [`MemoryStore`]: in-process store with real lease expiry and watch
//!   fan-out, suitable for tests and single-process deployments.
//! - `EtcdStore` (feature `etcd`): backed by an etcd cluster.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod memory;
pub mod traits;
pub mod watch;

#[cfg(feature = "etcd")]
pub mod etcd;

// Re-exports
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use traits::{CoordinationStore, KeyValue};
pub use watch::{WatchEvent, WatchEventKind, WatchStream};

#[cfg(feature = "etcd")]
pub use etcd::{EtcdOptions, EtcdStore};

pub use waypoint_types::LeaseId;
