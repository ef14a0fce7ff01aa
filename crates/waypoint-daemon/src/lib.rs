//! Waypoint daemon library
//!
//! Pieces of `waypointd` that are useful on their own:
//! - Layered configuration
//! - Store construction from configuration
//! - A node that registers the local service and tracks watched services
//! - Signal-driven shutdown

pub mod config;
pub mod error;
pub mod node;
pub mod shutdown;

pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult};
pub use node::{connect_store, Node};
pub use shutdown::shutdown_signal;
