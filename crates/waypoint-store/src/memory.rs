//! In-memory coordination store
//!
//! Keeps real lease semantics: keys bound to a lease disappear once the lease
//! outlives its TTL without renewal, and every change is fanned out to the
//! matching watchers. Time is read from `tokio::time`, so tests running with
//! a paused clock see deterministic expiry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use waypoint_types::LeaseId;

use crate::error::{StoreError, StoreResult};
use crate::traits::{CoordinationStore, KeyValue};
use crate::watch::{WatchEvent, WatchEventKind, WatchSender, WatchStream};

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    create_revision: i64,
    mod_revision: i64,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: WatchSender,
}

#[derive(Default)]
struct State {
    data: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    revision: i64,
    next_lease: i64,
    watchers: Vec<Watcher>,
}

impl State {
    fn notify(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|w| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key.starts_with(&w.prefix))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !w.tx.is_closed();
            }
            w.tx.send(Ok(batch)).is_ok()
        });
    }

    fn remove_key(&mut self, key: &str) -> Option<WatchEvent> {
        let entry = self.data.remove(key)?;
        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        self.revision += 1;
        Some(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
            revision: self.revision,
        })
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let events: Vec<WatchEvent> = lease
            .keys
            .iter()
            .filter_map(|key| self.remove_key(key))
            .collect();
        self.notify(events);
        true
    }

    /// Drop every lease past its deadline. Returns the next deadline.
    fn expire(&mut self, now: Instant) -> Option<Instant> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = %id, "Lease expired");
            self.drop_lease(id);
        }
        self.leases.values().map(|l| l.expires_at).min()
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> StoreResult<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(StoreError::LeaseNotFound(id)),
            _ => Ok(()),
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) {
        self.revision += 1;
        let revision = self.revision;

        let previous = self.data.insert(
            key.to_string(),
            Entry {
                value,
                lease,
                create_revision: revision,
                mod_revision: revision,
            },
        );
        if let Some(prev) = previous {
            if let Some(entry) = self.data.get_mut(key) {
                entry.create_revision = prev.create_revision;
            }
            if prev.lease != lease {
                if let Some(old) = prev.lease.and_then(|id| self.leases.get_mut(&id)) {
                    old.keys.remove(key);
                }
            }
        }
        if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.insert(key.to_string());
        }

        self.notify(vec![WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            revision,
        }]);
    }
}

/// In-process [`CoordinationStore`] with lease expiry and prefix watches.
///
/// Carries fault injection switches for exercising failure paths.
pub struct MemoryStore {
    state: Mutex<State>,
    wake: Arc<Notify>,
    unavailable: AtomicBool,
    keep_alive_failing: AtomicBool,
    keep_alive_calls: AtomicU64,
}

impl MemoryStore {
    /// Create a store. When called inside a Tokio runtime, a background task
    /// deletes expired leases as they lapse so watchers see the deletes
    /// without anyone touching the store.
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            state: Mutex::new(State {
                next_lease: 1,
                ..State::default()
            }),
            wake: Arc::new(Notify::new()),
            unavailable: AtomicBool::new(false),
            keep_alive_failing: AtomicBool::new(false),
            keep_alive_calls: AtomicU64::new(0),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap(Arc::downgrade(&store), store.wake.clone()));
        }
        store
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make lease renewals fail while leaving everything else working.
    pub fn set_keep_alive_failing(&self, failing: bool) {
        self.keep_alive_failing.store(failing, Ordering::SeqCst);
    }

    /// Break every open watch, as a store restart would.
    pub fn close_watches(&self) {
        let watchers = std::mem::take(&mut self.state.lock().watchers);
        for w in watchers {
            let _ = w
                .tx
                .send(Err(StoreError::WatchClosed("watch cancelled by store".into())));
        }
    }

    /// Renewal attempts seen so far, failed ones included.
    pub fn keep_alive_calls(&self) -> u64 {
        self.keep_alive_calls.load(Ordering::SeqCst)
    }

    /// Leases currently alive.
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.leases.len()
    }

    fn available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn lock(&self) -> StoreResult<parking_lot::MutexGuard<'_, State>> {
        self.available()?;
        let mut state = self.state.lock();
        state.expire(Instant::now());
        Ok(state)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

async fn reap(store: Weak<MemoryStore>, wake: Arc<Notify>) {
    loop {
        let next = match store.upgrade() {
            Some(store) => store.state.lock().expire(Instant::now()),
            None => break,
        };
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
    trace!("Memory store reaper stopped");
}

fn expiry(ttl: Duration) -> StoreResult<Instant> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| StoreError::InvalidArgument(format!("lease ttl {ttl:?} out of range")))
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidArgument("lease ttl must be positive".into()));
        }
        let expires_at = expiry(ttl)?;
        let id = {
            let mut state = self.lock()?;
            let raw = state.next_lease;
            state.next_lease += 1;
            let id = LeaseId::new(raw)
                .ok_or_else(|| StoreError::Backend("lease id space exhausted".into()))?;
            state.leases.insert(
                id,
                Lease {
                    ttl,
                    expires_at,
                    keys: BTreeSet::new(),
                },
            );
            id
        };
        self.wake.notify_one();
        Ok(id)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.check_lease(lease)?;
        state.write(key, value, lease);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        state.check_lease(lease)?;
        if state.data.contains_key(key) {
            return Ok(false);
        }
        state.write(key, value, lease);
        Ok(true)
    }

    async fn get(&self, key: &str, with_prefix: bool) -> StoreResult<Vec<KeyValue>> {
        let state = self.lock()?;
        let to_kv = |(k, e): (&String, &Entry)| KeyValue {
            key: k.clone(),
            value: e.value.clone(),
            lease: e.lease,
            create_revision: e.create_revision,
            mod_revision: e.mod_revision,
        };

        let kvs = if with_prefix {
            state
                .data
                .range::<str, _>((std::ops::Bound::Included(key), std::ops::Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(key))
                .map(to_kv)
                .collect()
        } else {
            state.data.get_key_value(key).map(to_kv).into_iter().collect()
        };
        Ok(kvs)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.remove_key(key) {
            Some(event) => {
                state.notify(vec![event]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<Duration> {
        self.keep_alive_calls.fetch_add(1, Ordering::SeqCst);
        if self.keep_alive_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("keep-alive rejected".into()));
        }

        let mut state = self.lock()?;
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.expires_at = expiry(entry.ttl)?;
        trace!(lease = %lease, "Lease renewed");
        Ok(entry.ttl)
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut state = self.lock()?;
        let (tx, stream) = WatchStream::channel();
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_put_get_with_prefix() {
        let store = MemoryStore::new();
        store.put("/s/orders/a:1", b"a".to_vec(), None).await.unwrap();
        store.put("/s/orders/b:1", b"b".to_vec(), None).await.unwrap();
        store.put("/s/orders-v2/c:1", b"c".to_vec(), None).await.unwrap();

        let kvs = store.get("/s/orders/", true).await.unwrap();
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/s/orders/a:1", "/s/orders/b:1"]);

        let single = store.get("/s/orders/a:1", false).await.unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].value, b"a");
        assert!(store.get("/s/orders/", false).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_keeps_create_revision() {
        let store = MemoryStore::new();
        store.put("/k", b"1".to_vec(), None).await.unwrap();
        store.put("/k", b"2".to_vec(), None).await.unwrap();

        let kv = &store.get("/k", false).await.unwrap()[0];
        assert_eq!(kv.value, b"2");
        assert!(kv.mod_revision > kv.create_revision);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put("/k", b"v".to_vec(), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.get("/k", false).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get("/k", false).await.unwrap().is_empty());
        assert!(matches!(
            store.keep_alive_once(lease).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put("/k", b"v".to_vec(), Some(lease)).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            assert_eq!(store.keep_alive_once(lease).await.unwrap(), TTL);
        }
        assert_eq!(store.get("/k", false).await.unwrap().len(), 1);
        assert_eq!(store.keep_alive_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_with_unknown_lease() {
        let store = MemoryStore::new();
        let lease = LeaseId::new(99).unwrap();
        assert!(store.put("/k", vec![], Some(lease)).await.unwrap_err().is_lease_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_deletes_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put("/a", vec![], Some(lease)).await.unwrap();
        store.put("/b", vec![], Some(lease)).await.unwrap();
        store.put("/c", vec![], None).await.unwrap();

        store.revoke(lease).await.unwrap();
        let keys: Vec<_> = store
            .get("/", true)
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/c"]);
        assert!(store.revoke(lease).await.unwrap_err().is_lease_not_found());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_if_absent() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("/lock", b"a".to_vec(), None).await.unwrap());
        assert!(!store.put_if_absent("/lock", b"b".to_vec(), None).await.unwrap());
        assert_eq!(store.get("/lock", false).await.unwrap()[0].value, b"a");

        assert!(store.delete("/lock").await.unwrap());
        assert!(!store.delete("/lock").await.unwrap());
        assert!(store.put_if_absent("/lock", b"b".to_vec(), None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sees_puts_and_expiry() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/s/orders/").await.unwrap();

        let lease = store.grant(TTL).await.unwrap();
        store.put("/s/orders/a:1", vec![], Some(lease)).await.unwrap();
        store.put("/s/other/b:1", vec![], None).await.unwrap();

        let batch = watch.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, WatchEventKind::Put);

        // Nobody touches the store; the reaper must deliver the delete.
        let batch = watch.next().await.unwrap().unwrap();
        assert_eq!(batch[0].kind, WatchEventKind::Delete);
        assert_eq!(batch[0].key, "/s/orders/a:1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.grant(TTL).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get("/", true).await.is_err());

        store.set_unavailable(false);
        assert!(store.grant(TTL).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_watches() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/").await.unwrap();
        store.close_watches();

        assert!(matches!(
            watch.next().await,
            Some(Err(StoreError::WatchClosed(_)))
        ));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.grant(Duration::ZERO).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.grant(Duration::from_secs(u64::MAX)).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert_eq!(store.lease_count(), 0);
    }
}
