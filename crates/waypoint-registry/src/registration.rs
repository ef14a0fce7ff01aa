//! Handle for a registered service instance

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waypoint_types::{LeaseId, ServiceRecord};

use crate::error::Result;
use crate::timed::TimedStore;

/// Heartbeat task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    /// Last renewal succeeded.
    Healthy,

    /// `attempt` consecutive renewals have failed.
    Retrying { attempt: u32 },

    /// Task has exited and will never renew again.
    Terminated,
}

pub(crate) struct Shared {
    record: ServiceRecord,
    key: String,
    lease: AtomicI64,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    state: watch::Sender<HeartbeatState>,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.record.name
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn ttl(&self) -> std::time::Duration {
        self.record.ttl
    }

    pub(crate) fn lease(&self) -> Option<LeaseId> {
        LeaseId::new(self.lease.load(Ordering::SeqCst))
    }

    /// Take the lease so exactly one caller cleans it up.
    pub(crate) fn take_lease(&self) -> Option<LeaseId> {
        LeaseId::new(self.lease.swap(0, Ordering::SeqCst))
    }

    /// Put a taken lease back after a failed cleanup, unless someone else
    /// has stored one since.
    pub(crate) fn restore_lease(&self, lease: LeaseId) {
        let _ = self
            .lease
            .compare_exchange(0, lease.get(), Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn mark_alive(&self, at: DateTime<Utc>) {
        *self.last_heartbeat.lock() = Some(at);
    }

    pub(crate) fn set_state(&self, state: HeartbeatState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

/// A live registration returned by [`Registry::register`](crate::Registry::register).
///
/// Cloning is cheap; all clones observe the same heartbeat.
#[derive(Clone)]
pub struct Registration {
    shared: Arc<Shared>,
}

impl Registration {
    pub(crate) fn new(
        record: ServiceRecord,
        key: String,
        lease: LeaseId,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(HeartbeatState::Healthy);
        Self {
            shared: Arc::new(Shared {
                record,
                key,
                lease: AtomicI64::new(lease.get()),
                last_heartbeat: Mutex::new(Some(Utc::now())),
                state,
                cancel,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Snapshot of the record with its current lease and last heartbeat.
    pub fn record(&self) -> ServiceRecord {
        let mut record = self.shared.record.clone();
        record.lease_id = self.shared.lease();
        record.last_heartbeat = *self.shared.last_heartbeat.lock();
        record
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Store key the record is written under.
    pub fn key(&self) -> &str {
        self.shared.key()
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.shared.lease()
    }

    pub fn is_registered(&self) -> bool {
        self.shared.lease().is_some()
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_heartbeat.lock()
    }

    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        self.is_registered() && self.record().is_healthy(now)
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        *self.shared.state.borrow()
    }

    /// Wait until the heartbeat task has exited.
    pub async fn terminated(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == HeartbeatState::Terminated).await;
    }

    /// Stop the heartbeat. The task deregisters the record on its way out.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.shared.key)
            .field("lease_id", &self.shared.lease())
            .field("state", &self.heartbeat_state())
            .finish()
    }
}

/// Delete the record's key and revoke its lease.
///
/// Only the caller that takes the lease does any store work, so concurrent
/// calls from `unregister` and the heartbeat's exit path cannot collide.
pub(crate) async fn deregister(
    store: &TimedStore,
    shared: &Shared,
    restore_on_failure: bool,
) -> Result<()> {
    let Some(lease) = shared.take_lease() else {
        debug!(key = %shared.key(), "No lease held, nothing to unregister");
        return Ok(());
    };

    if let Err(e) = store.delete(shared.key()).await {
        if restore_on_failure {
            shared.restore_lease(lease);
        }
        return Err(e);
    }

    match store.revoke(lease).await {
        Ok(()) => {}
        Err(e) if e.is_lease_expired() => {
            debug!(key = %shared.key(), lease = %lease, "Lease already gone");
        }
        Err(e) => {
            // Key is gone; the lease lapses on its own.
            warn!(
                key = %shared.key(),
                lease = %lease,
                error = %e,
                "Failed to revoke lease, leaving it to expire"
            );
        }
    }

    info!(service = %shared.name(), key = %shared.key(), "Service unregistered");
    Ok(())
}
