//! Lease renewal task.
//!
//! One task per registration renews the lease every `ttl / 2`. Failed
//! renewals are retried with exponential back-off as long as the retry lands
//! before the next tick; otherwise the next tick is the retry. The failure
//! count carries across ticks and resets on success, so the task never makes
//! more than `max_attempts` consecutive failed renewals before giving up.
//!
//! Every exit path except "someone else already unregistered" deregisters
//! the record before the task returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::HeartbeatConfig;
use crate::registration::{deregister, HeartbeatState, Shared};
use crate::timed::TimedStore;

const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Cap for deadlines that would not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub(crate) fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after).unwrap_or_else(|| from + FAR_FUTURE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    Exhausted,
    LeaseLost,
    Unregistered,
}

#[instrument(name = "heartbeat", skip_all, fields(key = %shared.key()))]
pub(crate) async fn run(
    store: TimedStore,
    shared: Arc<Shared>,
    config: HeartbeatConfig,
    shutdown: CancellationToken,
) {
    let period = (shared.ttl() / 2).max(MIN_PERIOD);
    let exit = beat(&store, &shared, &config, &shutdown, period).await;

    match exit {
        Exit::Unregistered => debug!("Lease released elsewhere, heartbeat stopping"),
        Exit::Cancelled => info!("Heartbeat cancelled, deregistering"),
        Exit::Exhausted | Exit::LeaseLost => warn!(?exit, "Heartbeat failed, deregistering"),
    }

    if exit != Exit::Unregistered {
        if let Err(e) = deregister(&store, &shared, false).await {
            error!(error = %e, "Failed to deregister after heartbeat exit");
        }
    }
    shared.set_state(HeartbeatState::Terminated);
}

async fn stopped(shared: &Shared, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        _ = shutdown.cancelled() => {}
    }
}

/// Sleep until `deadline`. Returns `false` if cancelled first.
async fn sleep_until(shared: &Shared, shutdown: &CancellationToken, deadline: Instant) -> bool {
    tokio::select! {
        _ = stopped(shared, shutdown) => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

async fn beat(
    store: &TimedStore,
    shared: &Shared,
    config: &HeartbeatConfig,
    shutdown: &CancellationToken,
    period: Duration,
) -> Exit {
    let mut next_tick = deadline(Instant::now(), period);
    let mut failures: u32 = 0;

    loop {
        if !sleep_until(shared, shutdown, next_tick).await {
            return Exit::Cancelled;
        }
        next_tick = deadline(Instant::now().max(next_tick), period);

        loop {
            let Some(lease) = shared.lease() else {
                return Exit::Unregistered;
            };

            match store.keep_alive_once(lease).await {
                Ok(_) => {
                    if failures > 0 {
                        info!(lease = %lease, after = failures, "Lease renewal recovered");
                    }
                    trace!(lease = %lease, "Lease renewed");
                    failures = 0;
                    shared.mark_alive(Utc::now());
                    shared.set_state(HeartbeatState::Healthy);
                    break;
                }
                Err(e) if e.is_lease_expired() => {
                    error!(lease = %lease, error = %e, "Lease no longer exists");
                    return Exit::LeaseLost;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= config.max_attempts {
                        error!(
                            lease = %lease,
                            attempt = failures,
                            error = %e,
                            "Lease renewal retries exhausted"
                        );
                        return Exit::Exhausted;
                    }
                    shared.set_state(HeartbeatState::Retrying { attempt: failures });

                    let retry_at = deadline(Instant::now(), config.backoff(failures));
                    if retry_at >= next_tick {
                        warn!(
                            lease = %lease,
                            attempt = failures,
                            error = %e,
                            "Lease renewal failed, retrying at next tick"
                        );
                        break;
                    }
                    warn!(
                        lease = %lease,
                        attempt = failures,
                        backoff = ?config.backoff(failures),
                        error = %e,
                        "Lease renewal failed, backing off"
                    );
                    if !sleep_until(shared, shutdown, retry_at).await {
                        return Exit::Cancelled;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::Registration;
    use waypoint_store::{CoordinationStore, MemoryStore};
    use waypoint_types::ServiceRecord;

    const TTL: Duration = Duration::from_secs(4);

    async fn setup() -> (Arc<MemoryStore>, TimedStore, Registration) {
        setup_with_lease(TTL).await
    }

    async fn setup_with_lease(lease_ttl: Duration) -> (Arc<MemoryStore>, TimedStore, Registration) {
        let memory = MemoryStore::new();
        let store = TimedStore::new(memory.clone(), Duration::from_secs(1));
        let record = ServiceRecord::new("orders", "h", 1, TTL);
        let key = record.key("/s");
        let lease = store.grant(lease_ttl).await.unwrap();
        store
            .put(&key, record.encode().unwrap(), Some(lease))
            .await
            .unwrap();
        let reg = Registration::new(record, key, lease, CancellationToken::new());
        (memory, store, reg)
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(deadline(now, TTL), now + TTL);
        assert_eq!(deadline(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_every_half_ttl() {
        let (memory, store, reg) = setup().await;
        let shutdown = CancellationToken::new();
        tokio::spawn(run(
            store,
            reg.shared().clone(),
            HeartbeatConfig::default(),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(memory.keep_alive_calls(), 4);
        assert_eq!(reg.heartbeat_state(), HeartbeatState::Healthy);

        shutdown.cancel();
        reg.terminated().await;
        assert!(memory.get(reg.key(), false).await.unwrap().is_empty());
        assert_eq!(memory.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_budget_is_bounded() {
        let (memory, store, reg) = setup().await;
        memory.set_keep_alive_failing(true);
        tokio::spawn(run(
            store,
            reg.shared().clone(),
            HeartbeatConfig::default(),
            CancellationToken::new(),
        ));

        reg.terminated().await;
        assert_eq!(memory.keep_alive_calls(), 3);
        assert!(!reg.is_registered());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(memory.keep_alive_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        // Long store lease so the third attempt at 4s finds it alive.
        let (memory, store, reg) = setup_with_lease(Duration::from_secs(10)).await;
        memory.set_keep_alive_failing(true);
        tokio::spawn(run(
            store,
            reg.shared().clone(),
            HeartbeatConfig::default(),
            CancellationToken::new(),
        ));

        // First renewal at 2s fails, retry at 3s fails.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(reg.heartbeat_state(), HeartbeatState::Retrying { attempt: 2 });

        memory.set_keep_alive_failing(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reg.heartbeat_state(), HeartbeatState::Healthy);
        assert!(reg.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_lease_is_terminal() {
        let (memory, store, reg) = setup().await;
        memory.revoke(reg.lease_id().unwrap()).await.unwrap();
        tokio::spawn(run(
            store,
            reg.shared().clone(),
            HeartbeatConfig::default(),
            CancellationToken::new(),
        ));

        reg.terminated().await;
        assert_eq!(memory.keep_alive_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_quietly_when_unregistered_elsewhere() {
        let (memory, store, reg) = setup().await;
        reg.shared().take_lease();
        tokio::spawn(run(
            store,
            reg.shared().clone(),
            HeartbeatConfig::default(),
            CancellationToken::new(),
        ));

        reg.terminated().await;
        assert_eq!(memory.keep_alive_calls(), 0);
        // The key was left alone.
        assert_eq!(memory.get(reg.key(), false).await.unwrap().len(), 1);
    }
}
