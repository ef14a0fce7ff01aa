//! Opaque handles assigned by the coordination store

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle for a time-bound lease granted by the coordination store.
///
/// Keys written under a lease are deleted by the store once the lease
/// expires without being renewed. Zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(i64);

impl LeaseId {
    /// Wrap a raw store lease id. Returns `None` for zero.
    pub fn new(raw: i64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease:{:x}", self.0)
    }
}
