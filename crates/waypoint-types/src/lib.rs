//! Waypoint Types - Core data for service registration and discovery
//!
//! A [`ServiceRecord`] is the datum a process publishes to advertise one live
//! instance of a service and the datum subscribers decode back out of the
//! coordination store.
//!
//! ## Key layout
//!
//! Every record maps to exactly one key:
//!
//! ```text
//! <prefix>/<name>/<address>:<port>
//! ```
//!
//! Two records with the same name, address and port share a key, so the
//! last writer wins.
//!
//! ## Wire format
//!
//! Records are stored as a flat JSON object with `name`, `addr` and `port`.
//! Lease handles, TTLs and heartbeat timestamps are local to the owning
//! process and never leave it.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod ids;
pub mod record;

pub use error::{RecordError, RecordResult};
pub use ids::LeaseId;
pub use record::{service_prefix, ServiceRecord, KEY_SEPARATOR, MAX_TTL};
