//! Distributed mutual exclusion on a store key.
//!
//! A [`StoreLocker`] owns a session lease for as long as it is contending for
//! or holding a lock. The lock key is written create-only under that lease,
//! so a crashed holder's lock disappears when its session lease lapses.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use waypoint_types::LeaseId;

use crate::error::{RegistryError, Result};
use crate::heartbeat;
use crate::timed::TimedStore;

/// Mutual exclusion over a named key.
#[async_trait]
pub trait Locker: Send {
    /// Try to take the lock on `key`, waiting at most `wait`.
    ///
    /// Returns `Ok(false)` when the wait elapses without the lock.
    async fn acquire(&mut self, key: &str, wait: Duration) -> Result<bool>;

    /// Release the lock taken by the last successful `acquire`.
    async fn release(&mut self) -> Result<()>;
}

struct Held {
    key: String,
    session: Session,
}

struct Session {
    lease: LeaseId,
    stop: CancellationToken,
    keepalive: JoinHandle<()>,
}

impl Session {
    async fn end(self, store: &TimedStore) -> Result<()> {
        self.stop.cancel();
        let _ = self.keepalive.await;
        match store.revoke(self.lease).await {
            Err(e) if !e.is_lease_expired() => Err(e),
            _ => Ok(()),
        }
    }
}

/// [`Locker`] backed by the registry's coordination store.
pub struct StoreLocker {
    store: TimedStore,
    lock_prefix: String,
    ttl: Duration,
    held: Option<Held>,
}

impl StoreLocker {
    pub(crate) fn new(store: TimedStore, lock_prefix: String, ttl: Duration) -> Self {
        Self {
            store,
            lock_prefix,
            ttl,
            held: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Full store key of the held lock.
    pub fn held_key(&self) -> Option<&str> {
        self.held.as_ref().map(|h| h.key.as_str())
    }

    fn lock_key(&self, key: &str) -> Result<String> {
        let name = key.trim_matches('/');
        if name.is_empty() {
            return Err(RegistryError::InvalidLockKey(key.to_string()));
        }
        Ok(format!("{}/{}", self.lock_prefix.trim_end_matches('/'), name))
    }

    async fn open_session(&self) -> Result<Session> {
        let lease = self.store.grant(self.ttl).await?;
        let stop = CancellationToken::new();
        let keepalive = tokio::spawn(keep_session_alive(
            self.store.clone(),
            lease,
            (self.ttl / 3).max(Duration::from_millis(10)),
            stop.clone(),
        ));
        Ok(Session {
            lease,
            stop,
            keepalive,
        })
    }

    async fn contend(&self, key: &str, lease: LeaseId, deadline: Instant) -> Result<bool> {
        let owner = lease.to_string().into_bytes();
        let mut watch = self.store.watch(key).await?;

        loop {
            if self
                .store
                .put_if_absent(key, owner.clone(), Some(lease))
                .await?
            {
                return Ok(true);
            }
            debug!(key = %key, "Lock busy, waiting");

            match tokio::time::timeout_at(deadline, watch.next()).await {
                Err(_) => return Ok(false),
                Ok(Some(Ok(_))) => {
                    let _ = watch.drain_pending();
                }
                Ok(Some(Err(_))) | Ok(None) => {
                    watch = self.store.watch(key).await?;
                }
            }
        }
    }
}

#[async_trait]
impl Locker for StoreLocker {
    #[instrument(skip(self))]
    async fn acquire(&mut self, key: &str, wait: Duration) -> Result<bool> {
        if let Some(held) = &self.held {
            return Err(RegistryError::LockAlreadyHeld(held.key.clone()));
        }
        let key = self.lock_key(key)?;
        let deadline = heartbeat::deadline(Instant::now(), wait);

        let session = self.open_session().await?;
        match self.contend(&key, session.lease, deadline).await {
            Ok(true) => {
                info!(key = %key, lease = %session.lease, "Lock acquired");
                self.held = Some(Held { key, session });
                Ok(true)
            }
            outcome => {
                if let Err(e) = session.end(&self.store).await {
                    debug!(error = %e, "Failed to end lock session");
                }
                if matches!(outcome, Ok(false)) {
                    info!(key = %key, ?wait, "Lock not acquired within wait");
                }
                outcome
            }
        }
    }

    #[instrument(skip(self))]
    async fn release(&mut self) -> Result<()> {
        let held = self.held.take().ok_or(RegistryError::LockNotHeld)?;
        // Revoking the session lease deletes the lock key.
        held.session.end(&self.store).await?;
        info!(key = %held.key, "Lock released");
        Ok(())
    }
}

impl Drop for StoreLocker {
    fn drop(&mut self) {
        // The lock lapses with the session lease.
        if let Some(held) = self.held.take() {
            held.session.stop.cancel();
        }
    }
}

async fn keep_session_alive(
    store: TimedStore,
    lease: LeaseId,
    period: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        match store.keep_alive_once(lease).await {
            Ok(_) => {}
            Err(e) if e.is_lease_expired() => {
                warn!(lease = %lease, "Lock session lease lost");
                return;
            }
            Err(e) => warn!(lease = %lease, error = %e, "Lock session renewal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use waypoint_store::{CoordinationStore, MemoryStore};

    fn locker(memory: &Arc<MemoryStore>) -> StoreLocker {
        StoreLocker::new(
            TimedStore::new(memory.clone(), Duration::from_secs(5)),
            "/locks".into(),
            Duration::from_secs(3),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_release() {
        let memory = MemoryStore::new();
        let mut a = locker(&memory);

        assert!(a.acquire("jobs", Duration::from_secs(1)).await.unwrap());
        assert_eq!(a.held_key(), Some("/locks/jobs"));
        assert_eq!(memory.get("/locks/jobs", false).await.unwrap().len(), 1);

        a.release().await.unwrap();
        assert!(memory.get("/locks/jobs", false).await.unwrap().is_empty());
        assert!(matches!(a.release().await, Err(RegistryError::LockNotHeld)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_acquire_times_out() {
        let memory = MemoryStore::new();
        let mut a = locker(&memory);
        let mut b = locker(&memory);

        assert!(a.acquire("jobs", Duration::from_secs(1)).await.unwrap());
        assert!(!b.acquire("jobs", Duration::from_secs(5)).await.unwrap());
        assert!(!b.is_held());

        // Holder's session survives well past its ttl.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(memory.get("/locks/jobs", false).await.unwrap().len(), 1);
        // Only the holder's session lease remains.
        assert_eq!(memory.lease_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lock_after_release() {
        let memory = MemoryStore::new();
        let mut a = locker(&memory);
        assert!(a.acquire("jobs", Duration::from_secs(1)).await.unwrap());

        let waiter = {
            let memory = memory.clone();
            tokio::spawn(async move {
                let mut b = locker(&memory);
                let got = b.acquire("jobs", Duration::from_secs(30)).await.unwrap();
                (got, b)
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        a.release().await.unwrap();

        let (got, b) = waiter.await.unwrap();
        assert!(got);
        assert!(b.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_acquire_rejected() {
        let memory = MemoryStore::new();
        let mut a = locker(&memory);
        assert!(a.acquire("jobs", Duration::from_secs(1)).await.unwrap());
        assert!(matches!(
            a.acquire("other", Duration::from_secs(1)).await,
            Err(RegistryError::LockAlreadyHeld(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_key_reported_as_given() {
        let memory = MemoryStore::new();
        match locker(&memory).acquire("//", Duration::from_secs(1)).await {
            Err(RegistryError::InvalidLockKey(key)) => assert_eq!(key, "//"),
            other => panic!("expected InvalidLockKey, got {other:?}"),
        }
        assert_eq!(memory.lease_count(), 0);
    }
}
