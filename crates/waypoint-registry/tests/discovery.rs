//! Watch-driven discovery against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use waypoint_registry::{
    CoordinationStore, InstanceSet, MemoryStore, Registry, RegistryConfig, RoundRobin,
    ServiceRecord, Strategy,
};

fn setup() -> (Arc<MemoryStore>, Registry) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let memory = MemoryStore::new();
    let registry = Registry::new(memory.clone(), RegistryConfig::default()).unwrap();
    (memory, registry)
}

fn instance(name: &str, addr: &str, port: u16) -> ServiceRecord {
    ServiceRecord::new(name, addr, port, Duration::from_secs(5))
}

async fn subscribe(
    registry: &Registry,
    service: &str,
) -> (waypoint_registry::Subscription, mpsc::UnboundedReceiver<InstanceSet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = registry
        .subscribe(service, move |set| {
            let _ = tx.send(set);
        })
        .await
        .unwrap();
    (sub, rx)
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<InstanceSet>,
    pred: impl Fn(&InstanceSet) -> bool,
) -> InstanceSet {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let set = rx.recv().await.expect("subscription closed");
            if pred(&set) {
                return set;
            }
        }
    })
    .await
    .expect("no matching instance set")
}

#[tokio::test(start_paused = true)]
async fn test_initial_callback_before_subscribe_returns() {
    let (_memory, registry) = setup();
    registry.register(instance("orders", "a", 1)).await.unwrap();

    let (_sub, mut rx) = subscribe(&registry, "orders").await;
    let first = rx.try_recv().unwrap();
    assert_eq!(first.service(), "orders");
    assert_eq!(first.endpoints(), vec!["a:1"]);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_sees_new_instance() {
    let (_memory, registry) = setup();
    let (_sub, mut rx) = subscribe(&registry, "orders").await;
    assert!(rx.recv().await.unwrap().is_empty());

    registry.register(instance("orders", "10.0.0.7", 9000)).await.unwrap();
    let set = wait_for(&mut rx, |s| s.contains_endpoint("10.0.0.7:9000")).await;
    assert_eq!(set.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_sees_unregister() {
    let (_memory, registry) = setup();
    let a = registry.register(instance("orders", "a", 1)).await.unwrap();
    registry.register(instance("orders", "b", 1)).await.unwrap();

    let (_sub, mut rx) = subscribe(&registry, "orders").await;
    assert_eq!(rx.recv().await.unwrap().len(), 2);

    registry.unregister(&a).await.unwrap();
    let set = wait_for(&mut rx, |s| !s.contains_endpoint("a:1")).await;
    assert_eq!(set.endpoints(), vec!["b:1"]);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_record_is_skipped() {
    let (memory, registry) = setup();
    registry.register(instance("orders", "a", 1)).await.unwrap();
    memory
        .put("/waypoint/services/orders/garbage", b"{not json".to_vec(), None)
        .await
        .unwrap();

    let set = registry.discover("orders").await.unwrap();
    assert_eq!(set.endpoints(), vec!["a:1"]);

    let (_sub, mut rx) = subscribe(&registry, "orders").await;
    assert_eq!(rx.recv().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_similar_names_do_not_leak() {
    let (_memory, registry) = setup();
    registry.register(instance("orders", "a", 1)).await.unwrap();
    registry.register(instance("orders-v2", "b", 1)).await.unwrap();

    let set = registry.discover("orders").await.unwrap();
    assert_eq!(set.endpoints(), vec!["a:1"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_subscription_stops_callbacks() {
    let (_memory, registry) = setup();
    let (sub, mut rx) = subscribe(&registry, "orders").await;
    assert!(rx.recv().await.unwrap().is_empty());

    sub.cancel();
    assert!(sub.is_cancelled());
    registry.register(instance("orders", "a", 1)).await.unwrap();

    // The callback (and with it the sender) is dropped once the task exits.
    let rest = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert!(rest.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_watch_recovers_after_store_drops_it() {
    let (memory, registry) = setup();
    let (_sub, mut rx) = subscribe(&registry, "orders").await;
    assert!(rx.recv().await.unwrap().is_empty());

    memory.close_watches();
    registry.register(instance("orders", "a", 1)).await.unwrap();

    // Re-opened after the reconnect back-off, followed by a full refresh.
    let set = wait_for(&mut rx, |s| s.contains_endpoint("a:1")).await;
    assert_eq!(set.len(), 1);

    registry.register(instance("orders", "b", 1)).await.unwrap();
    wait_for(&mut rx, |s| s.len() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_over_discovered_set() {
    let (_memory, registry) = setup();
    for addr in ["c", "a", "b"] {
        registry.register(instance("orders", addr, 80)).await.unwrap();
    }

    let records = registry.discover("orders").await.unwrap().into_records();
    let rr = RoundRobin::new();
    let picked: Vec<String> = (0..4)
        .map(|_| rr.select(&records).unwrap().address.clone())
        .collect();
    assert_eq!(picked, vec!["a", "b", "c", "a"]);

    let empty = registry.discover("payments").await.unwrap().into_records();
    assert!(rr.select(&empty).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_orders_scenario() {
    let (memory, registry) = setup();
    let (_sub, mut rx) = subscribe(&registry, "orders").await;
    assert!(rx.recv().await.unwrap().is_empty());

    let reg = registry
        .register(ServiceRecord::new(
            "orders",
            "10.0.0.5",
            8080,
            Duration::from_secs(5),
        ))
        .await
        .unwrap();

    let set = wait_for(&mut rx, |s| !s.is_empty()).await;
    assert_eq!(set.len(), 1);
    let only = set.records().remove(0);
    assert_eq!(only.name, "orders");
    assert_eq!(only.address, "10.0.0.5");
    assert_eq!(only.port, 8080);
    assert_eq!(only.lease_id, reg.lease_id());

    // The process stops renewing.
    memory.set_keep_alive_failing(true);
    tokio::time::sleep(Duration::from_secs(6)).await;

    let set = wait_for(&mut rx, InstanceSet::is_empty).await;
    assert!(set.is_empty());
    assert!(registry.discover("orders").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_crashed_writer_expires_from_discovery() {
    let (memory, registry) = setup();
    let (_sub, mut rx) = subscribe(&registry, "orders").await;
    assert!(rx.recv().await.unwrap().is_empty());

    // Another process registers and then dies without cleaning up.
    let record = instance("orders", "10.0.0.5", 8080);
    let lease = memory.grant(record.ttl).await.unwrap();
    memory
        .put(
            &record.key("/waypoint/services"),
            record.encode().unwrap(),
            Some(lease),
        )
        .await
        .unwrap();

    wait_for(&mut rx, |s| s.len() == 1).await;
    let before = tokio::time::Instant::now();
    wait_for(&mut rx, InstanceSet::is_empty).await;
    assert!(before.elapsed() <= Duration::from_secs(5));
}
