//! Registrar and watcher working together over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use beacon_discovery::{
    AddressSet, Backend, Lease, MemoryBackend, Registrar, RegistrationState, Resolver,
    ServiceInstance, Update,
};

fn instance(host: &str) -> ServiceInstance {
    ServiceInstance::new("greeter", host, 9000).unwrap()
}

fn lease() -> Lease {
    Lease::new(Duration::from_secs(3), Duration::from_secs(1)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_register_resolve_deregister() {
    let store = Arc::new(MemoryBackend::new());
    let registrar = Registrar::new(store.clone(), lease());
    let mut watcher = Resolver::new("greeter").resolve_with(store.clone()).unwrap();
    let mut addrs = AddressSet::new();

    let a = registrar.start(instance("10.0.0.1")).await.unwrap();
    let updates = watcher.next().await;
    assert_eq!(updates, vec![Update::add("10.0.0.1:9000")]);
    addrs.apply(&updates);

    let b = registrar.start(instance("10.0.0.2")).await.unwrap();
    let updates = watcher.next().await;
    assert_eq!(updates, vec![Update::add("10.0.0.2:9000")]);
    addrs.apply(&updates);

    a.deregister().await.unwrap();
    let updates = watcher.next().await;
    assert_eq!(updates, vec![Update::delete("10.0.0.1:9000")]);
    addrs.apply(&updates);

    let listed: AddressSet = store.list("greeter").await.unwrap().addrs.into_iter().collect();
    assert_eq!(addrs, listed);
    assert_eq!(b.state(), RegistrationState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_watcher_started_before_registration() {
    let store = Arc::new(MemoryBackend::new());
    let mut watcher = Resolver::new("greeter").resolve_with(store.clone()).unwrap();
    let pending = tokio::spawn(async move { watcher.next().await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let _registration = Registrar::new(store, lease())
        .start(instance("10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(pending.await.unwrap(), vec![Update::add("10.0.0.1:9000")]);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_are_silent() {
    let store = Arc::new(MemoryBackend::new());
    let _registration = Registrar::new(store.clone(), lease())
        .start(instance("10.0.0.1"))
        .await
        .unwrap();
    let mut watcher = Resolver::new("greeter").resolve_with(store).unwrap();
    assert_eq!(watcher.next().await, vec![Update::add("10.0.0.1:9000")]);

    let quiet = tokio::time::timeout(Duration::from_secs(10), watcher.next()).await;
    assert!(quiet.is_err(), "heartbeats produced {quiet:?}");
}

#[tokio::test(start_paused = true)]
async fn test_recovers_from_external_removal() {
    let store = Arc::new(MemoryBackend::new());
    let registration = Registrar::new(store.clone(), lease())
        .start(instance("10.0.0.1"))
        .await
        .unwrap();
    let mut watcher = Resolver::new("greeter").resolve_with(store.clone()).unwrap();
    assert_eq!(watcher.next().await, vec![Update::add("10.0.0.1:9000")]);

    assert!(store.evict(registration.instance()));
    assert_eq!(watcher.next().await, vec![Update::delete("10.0.0.1:9000")]);

    // The next heartbeat publishes the record again.
    assert_eq!(watcher.next().await, vec![Update::add("10.0.0.1:9000")]);
    assert_eq!(registration.state(), RegistrationState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_registration_expires() {
    let store = Arc::new(MemoryBackend::new());
    let registration = Registrar::new(store.clone(), lease())
        .start(instance("10.0.0.1"))
        .await
        .unwrap();
    let mut watcher = Resolver::new("greeter").resolve_with(store).unwrap();
    assert_eq!(watcher.next().await, vec![Update::add("10.0.0.1:9000")]);

    drop(registration);
    let started = tokio::time::Instant::now();
    assert_eq!(watcher.next().await, vec![Update::delete("10.0.0.1:9000")]);
    assert!(started.elapsed() <= Duration::from_secs(3));
}
