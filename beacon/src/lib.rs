//! # Beacon
//!
//! Service discovery for RPC micro-services.
//!
//! Beacon provides:
//! - **Registration** with a liveness lease that is refreshed in the background
//!   and removed on shutdown
//! - **Resolution** that streams a service's address set as minimal
//!   `Add`/`Delete` batches, ready to feed a client-side load balancer
//! - **Multiple stores**: etcd v2 keys API, Consul agent/health APIs, and an
//!   in-memory store for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use beacon::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), DiscoveryError> {
//! let store = Arc::new(MemoryBackend::new());
//!
//! // Server side: publish this process under a lease.
//! let registration = Registrar::new(store.clone(), Lease::default())
//!     .start(ServiceInstance::new("greeter", "127.0.0.1", 9000)?)
//!     .await?;
//!
//! // Client side: watch the service and mirror its addresses.
//! let mut watcher = Resolver::new("greeter").resolve_with(store)?;
//! let mut addrs = AddressSet::new();
//! addrs.apply(&watcher.next().await);
//! assert!(addrs.contains("127.0.0.1:9000"));
//!
//! registration.deregister().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `etcd` (default) - etcd v2 keys API backend
//! - `consul` (default) - Consul backend
//!
//! ## Architecture
//!
//! Beacon is composed of several crates:
//!
//! - [`beacon-core`] - Core types, error taxonomy and the diff engine
//! - [`beacon-discovery`] - Backends, registrar, watcher and resolver

// Re-export core types
pub use beacon_core::{
    diff, AddressSet, DiscoveryError, Lease, Op, ServiceInstance, Update, WatchCursor,
};

// Re-export discovery
pub use beacon_discovery::{
    shutdown_signal, Backend, Connect, MemoryBackend, MemoryConfig, Registrar, Registration,
    RegistrationState, Resolver, Snapshot, Watcher, WatcherConfig,
};

#[cfg(feature = "etcd")]
pub use beacon_discovery::{EtcdBackend, EtcdConfig};

#[cfg(feature = "consul")]
pub use beacon_discovery::{ConsulBackend, ConsulConfig};

/// Prelude module for convenient imports.
///
/// ```rust
/// use beacon::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AddressSet, Backend, DiscoveryError, Lease, MemoryBackend, Registrar, Resolver,
        ServiceInstance, Update, Watcher,
    };

    #[cfg(feature = "etcd")]
    pub use crate::EtcdBackend;

    #[cfg(feature = "consul")]
    pub use crate::ConsulBackend;
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backends_follow_features() {
        #[cfg(feature = "etcd")]
        assert!(EtcdBackend::new("http://127.0.0.1:2379").is_ok());

        #[cfg(feature = "consul")]
        assert!(ConsulBackend::new("127.0.0.1:8500").is_ok());

        // The in-memory store is always available.
        let _ = MemoryBackend::new();
        assert!(!VERSION.is_empty());
    }
}
