//! Watch-driven discovery.
//!
//! A subscription keeps one watch open on `<prefix>/<name>/`. Any event under
//! the prefix triggers a full re-read of the prefix, and the callback always
//! receives the complete current set, never a diff. Bursts of events that
//! arrive while a refresh is running are folded into a single re-read.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use waypoint_store::WatchStream;
use waypoint_types::ServiceRecord;

use crate::config::WatchConfig;
use crate::error::Result;
use crate::timed::TimedStore;

/// Decoded instances currently registered for one service, keyed by store key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSet {
    service: String,
    records: BTreeMap<String, ServiceRecord>,
}

impl InstanceSet {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ServiceRecord> {
        self.records.get(key)
    }

    /// Whether an instance listening on `<address>:<port>` is present.
    pub fn contains_endpoint(&self, endpoint: &str) -> bool {
        self.records.values().any(|r| r.endpoint() == endpoint)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ServiceRecord> {
        self.records.iter()
    }

    /// Records in key order.
    pub fn records(&self) -> Vec<ServiceRecord> {
        self.records.values().cloned().collect()
    }

    pub fn into_records(self) -> Vec<ServiceRecord> {
        self.records.into_values().collect()
    }

    /// Endpoints in key order.
    pub fn endpoints(&self) -> Vec<String> {
        self.records.values().map(ServiceRecord::endpoint).collect()
    }

    pub(crate) fn insert(&mut self, key: String, record: ServiceRecord) {
        self.records.insert(key, record);
    }
}

impl<'a> IntoIterator for &'a InstanceSet {
    type Item = (&'a String, &'a ServiceRecord);
    type IntoIter = btree_map::Iter<'a, String, ServiceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Handle for a running subscription.
///
/// Dropping the handle leaves the watch running until registry shutdown;
/// call [`cancel`](Subscription::cancel) to stop it earlier.
#[derive(Debug, Clone)]
pub struct Subscription {
    service: String,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(service: String, cancel: CancellationToken) -> Self {
        Self { service, cancel }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Stop the watch task. No callback starts after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Read every record under `prefix`. Entries that fail to decode are skipped.
pub(crate) async fn fetch(store: &TimedStore, service: &str, prefix: &str) -> Result<InstanceSet> {
    let mut set = InstanceSet::new(service);
    for kv in store.get(prefix, true).await? {
        match ServiceRecord::decode(&kv.value) {
            Ok(mut record) => {
                record.lease_id = kv.lease;
                set.insert(kv.key, record);
            }
            Err(e) => {
                warn!(service = %service, key = %kv.key, error = %e, "Skipping undecodable record");
            }
        }
    }
    Ok(set)
}

/// Body of a subscription's background task.
pub(crate) struct Watcher<F> {
    pub(crate) store: TimedStore,
    pub(crate) service: String,
    pub(crate) prefix: String,
    pub(crate) config: WatchConfig,
    pub(crate) callback: F,
    pub(crate) cancel: CancellationToken,
}

impl<F> Watcher<F>
where
    F: FnMut(InstanceSet) + Send + 'static,
{
    #[instrument(name = "watch", skip_all, fields(service = %self.service))]
    pub(crate) async fn run(mut self, stream: WatchStream) {
        let mut stream = Some(stream);
        let mut reconnect_delay = self.config.reconnect_backoff;

        loop {
            let Some(watch) = stream.as_mut() else {
                let woke = tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    _ = tokio::time::sleep(reconnect_delay) => true,
                };
                if !woke {
                    break;
                }
                match self.store.watch(&self.prefix).await {
                    Ok(reopened) => {
                        info!("Watch re-established");
                        stream = Some(reopened);
                        reconnect_delay = self.config.reconnect_backoff;
                        self.refresh().await;
                    }
                    Err(e) => {
                        reconnect_delay = next_delay(reconnect_delay, self.config.max_reconnect_backoff);
                        warn!(error = %e, retry_in = ?reconnect_delay, "Failed to re-open watch");
                    }
                }
                continue;
            };

            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.resync_interval, watch.next()) => next,
            };

            match next {
                Err(_) => debug!("No watch events within resync interval, refreshing"),
                Ok(Some(Ok(batch))) => match watch.drain_pending() {
                    Ok(more) => debug!(events = batch.len() + more, "Watch events received"),
                    Err(e) => {
                        warn!(error = %e, "Watch broke while draining, will re-open");
                        stream = None;
                    }
                },
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Watch failed, will re-open");
                    stream = None;
                    continue;
                }
                Ok(None) => {
                    warn!("Watch closed by store, will re-open");
                    stream = None;
                    continue;
                }
            }

            self.refresh().await;
        }

        debug!("Watch task stopped");
    }

    async fn refresh(&mut self) {
        match fetch(&self.store, &self.service, &self.prefix).await {
            Ok(set) => {
                if self.cancel.is_cancelled() {
                    return;
                }
                debug!(instances = set.len(), "Discovery refreshed");
                (self.callback)(set);
            }
            // Next event or resync retries.
            Err(e) => warn!(error = %e, "Discovery refresh failed"),
        }
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(addr: &str) -> ServiceRecord {
        ServiceRecord::new("orders", addr, 80, Duration::from_secs(5))
    }

    #[test]
    fn test_instance_set_is_key_ordered() {
        let mut set = InstanceSet::new("orders");
        set.insert("/s/orders/b:80".into(), record("b"));
        set.insert("/s/orders/a:80".into(), record("a"));

        assert_eq!(set.endpoints(), vec!["a:80", "b:80"]);
        assert!(set.contains_endpoint("b:80"));
        assert!(!set.contains_endpoint("c:80"));
        assert_eq!(set.iter().next().map(|(k, _)| k.as_str()), Some("/s/orders/a:80"));
        assert_eq!(set.into_records().len(), 2);
    }

    #[test]
    fn test_reconnect_delay_caps() {
        let max = Duration::from_secs(30);
        assert_eq!(next_delay(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_delay(Duration::from_secs(20), max), max);
    }
}
