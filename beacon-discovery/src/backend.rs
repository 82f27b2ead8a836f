//! Capability set every coordination store adapter implements.

use std::future::Future;

use beacon_core::{DiscoveryError, Lease, ServiceInstance, WatchCursor};

/// Addresses of a service as observed by the store at one position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// `host:port` addresses, without duplicates.
    pub addrs: Vec<String>,

    /// Store position of this observation.
    pub cursor: WatchCursor,
}

impl Snapshot {
    /// Create a snapshot, dropping repeated addresses but keeping first-seen order.
    #[must_use]
    pub fn new(addrs: Vec<String>, cursor: WatchCursor) -> Self {
        let mut seen = std::collections::HashSet::with_capacity(addrs.len());
        let addrs = addrs
            .into_iter()
            .filter(|addr| seen.insert(addr.clone()))
            .collect();
        Self { addrs, cursor }
    }

    /// Check if no address is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Store-specific half of the discovery protocol.
///
/// The registrar drives the write path (`publish`, `refresh`, `remove`) and
/// the watcher drives the read path (`list`, `block_until_changed`). Both are
/// written once against this trait, so supporting a new store only takes a
/// new implementation.
///
/// ## Example
///
/// ```rust,ignore
/// use beacon_discovery::{Backend, MemoryBackend};
/// use beacon_core::{Lease, ServiceInstance};
///
/// let backend = MemoryBackend::new();
/// let instance = ServiceInstance::new("greeter", "10.0.0.1", 9000)?;
///
/// backend.publish(&instance, &Lease::default()).await?;
/// let snapshot = backend.list("greeter").await?;
/// assert_eq!(snapshot.addrs, vec!["10.0.0.1:9000".to_string()]);
/// ```
pub trait Backend: Send + Sync + 'static {
    /// Write the instance record and attach its lease.
    ///
    /// Must succeed if a record from a previous registration attempt exists.
    fn publish(
        &self,
        instance: &ServiceInstance,
        lease: &Lease,
    ) -> impl Future<Output = Result<(), DiscoveryError>> + Send;

    /// Extend the lease of a published instance.
    ///
    /// A live record is refreshed without waking watchers; a record that
    /// expired or was deleted externally is published again.
    fn refresh(
        &self,
        instance: &ServiceInstance,
        lease: &Lease,
    ) -> impl Future<Output = Result<(), DiscoveryError>> + Send;

    /// Delete the instance record.
    fn remove(
        &self,
        instance: &ServiceInstance,
    ) -> impl Future<Output = Result<(), DiscoveryError>> + Send;

    /// Read the current addresses of a service without blocking.
    fn list(&self, service: &str) -> impl Future<Output = Result<Snapshot, DiscoveryError>> + Send;

    /// Wait for a change newer than `cursor`, then read the addresses.
    ///
    /// Stores may also return after an internal wait timeout with unchanged
    /// addresses. Errors are transient: callers back off and retry.
    fn block_until_changed(
        &self,
        service: &str,
        cursor: WatchCursor,
    ) -> impl Future<Output = Result<Snapshot, DiscoveryError>> + Send;
}

/// Backends that can be built from a store address string.
pub trait Connect: Backend + Sized {
    /// Build a client for `target` without performing network I/O.
    fn connect(target: &str) -> Result<Self, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_dedup() {
        let snapshot = Snapshot::new(
            vec!["b:2".into(), "a:1".into(), "b:2".into()],
            WatchCursor::new(3),
        );
        assert_eq!(snapshot.addrs, vec!["b:2".to_string(), "a:1".to_string()]);
        assert_eq!(snapshot.cursor, WatchCursor::new(3));
        assert!(!snapshot.is_empty());
        assert!(Snapshot::default().is_empty());
    }
}
