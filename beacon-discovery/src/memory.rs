//! In-process coordination store.
//!
//! Implements the same contract as the networked stores, including TTL
//! expiry and blocking queries, so the registrar and watcher can run
//! without external infrastructure in tests and single-node deployments.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{DiscoveryError, Lease, ServiceInstance, WatchCursor};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::backend::{Backend, Snapshot};

/// Configuration for the in-memory store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Longest time a blocking query waits before returning unchanged state.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(60),
        }
    }
}

impl MemoryConfig {
    /// Set the blocking query timeout.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// In-memory store with per-service change indexes.
pub struct MemoryBackend {
    config: MemoryConfig,
    services: DashMap<String, Arc<ServiceBucket>>,
}

struct ServiceBucket {
    state: Mutex<BucketState>,
    /// Broadcasts the index after every change.
    index_tx: watch::Sender<u64>,
}

#[derive(Default)]
struct BucketState {
    records: BTreeMap<String, Record>,
    index: u64,
}

struct Record {
    addr: String,
    expires: Instant,
}

impl ServiceBucket {
    fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(BucketState::default()),
            index_tx,
        }
    }

    fn bump(&self, state: &mut BucketState) {
        state.index += 1;
        self.index_tx.send_replace(state.index);
    }

    /// Drop expired records, returning true if any was reaped.
    fn reap(&self, state: &mut BucketState, now: Instant) -> bool {
        let before = state.records.len();
        state.records.retain(|_, record| record.expires > now);
        let reaped = state.records.len() != before;
        if reaped {
            self.bump(state);
        }
        reaped
    }

    /// Current addresses plus the instant the next record expires.
    fn snapshot(&self, now: Instant) -> (Snapshot, Option<Instant>) {
        let mut state = self.state.lock();
        self.reap(&mut state, now);

        let addrs = state
            .records
            .values()
            .map(|record| record.addr.clone())
            .collect();
        let next_expiry = state.records.values().map(|record| record.expires).min();

        (
            Snapshot::new(addrs, WatchCursor::new(state.index)),
            next_expiry,
        )
    }
}

impl MemoryBackend {
    /// Create an empty store with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create an empty store with custom configuration.
    #[must_use]
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            config,
            services: DashMap::new(),
        }
    }

    /// Bucket of a service, if it was ever written or watched.
    fn existing(&self, service: &str) -> Option<Arc<ServiceBucket>> {
        self.services.get(service).map(|bucket| bucket.clone())
    }

    fn bucket(&self, service: &str) -> Arc<ServiceBucket> {
        self.services
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceBucket::new()))
            .clone()
    }

    /// Delete a record behind its owner's back, as TTL expiry or an operator would.
    ///
    /// Returns false if the record did not exist.
    pub fn evict(&self, instance: &ServiceInstance) -> bool {
        let Some(bucket) = self.existing(instance.name()) else {
            return false;
        };
        let mut state = bucket.state.lock();
        if state.records.remove(&instance.id()).is_some() {
            bucket.bump(&mut state);
            true
        } else {
            false
        }
    }

    /// Current change index of a service.
    #[must_use]
    pub fn index(&self, service: &str) -> WatchCursor {
        match self.existing(service) {
            Some(bucket) => {
                let index = bucket.state.lock().index;
                WatchCursor::new(index)
            }
            None => WatchCursor::ZERO,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    async fn publish(&self, instance: &ServiceInstance, lease: &Lease) -> Result<(), DiscoveryError> {
        let bucket = self.bucket(instance.name());
        let mut state = bucket.state.lock();
        state.records.insert(
            instance.id(),
            Record {
                addr: instance.addr(),
                expires: Instant::now() + lease.ttl(),
            },
        );
        bucket.bump(&mut state);
        Ok(())
    }

    async fn refresh(&self, instance: &ServiceInstance, lease: &Lease) -> Result<(), DiscoveryError> {
        let bucket = self.bucket(instance.name());
        let now = Instant::now();
        let mut state = bucket.state.lock();
        bucket.reap(&mut state, now);

        match state.records.get_mut(&instance.id()) {
            Some(record) => record.expires = now + lease.ttl(),
            None => {
                tracing::debug!(instance = %instance, "record missing, re-publishing");
                state.records.insert(
                    instance.id(),
                    Record {
                        addr: instance.addr(),
                        expires: now + lease.ttl(),
                    },
                );
                bucket.bump(&mut state);
            }
        }
        Ok(())
    }

    async fn remove(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        if self.evict(instance) {
            Ok(())
        } else {
            Err(DiscoveryError::NotFound(instance.id()))
        }
    }

    async fn list(&self, service: &str) -> Result<Snapshot, DiscoveryError> {
        Ok(self
            .existing(service)
            .map(|bucket| bucket.snapshot(Instant::now()).0)
            .unwrap_or_default())
    }

    async fn block_until_changed(
        &self,
        service: &str,
        cursor: WatchCursor,
    ) -> Result<Snapshot, DiscoveryError> {
        // Watchers need a bucket to subscribe to, even before the first publish.
        let bucket = self.bucket(service);
        // Subscribe before reading so a change between the two is not lost.
        let mut index_rx = bucket.index_tx.subscribe();
        let deadline = Instant::now() + self.config.wait_timeout;

        loop {
            let (snapshot, next_expiry) = bucket.snapshot(Instant::now());
            if snapshot.cursor > cursor {
                return Ok(snapshot);
            }
            if Instant::now() >= deadline {
                return Ok(snapshot);
            }

            let wake = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                changed = index_rx.changed() => {
                    if changed.is_err() {
                        return Err(DiscoveryError::Transport("store closed".to_string()));
                    }
                }
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
