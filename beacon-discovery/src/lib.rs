//! # beacon-discovery
//!
//! Service registration and resolution over a shared coordination store.
//!
//! This crate provides:
//! - `Backend` trait implemented per store family
//! - `EtcdBackend` for the etcd v2 keys API (feature `etcd`)
//! - `ConsulBackend` for the Consul agent and health APIs (feature `consul`)
//! - `MemoryBackend` for tests and single-process setups
//! - `Registrar` publishing an instance and heartbeating its lease
//! - `Resolver` and `Watcher` streaming address changes as diff batches

mod backend;
mod memory;
mod registrar;
mod resolver;
mod signal;
mod watcher;

#[cfg(any(feature = "etcd", feature = "consul"))]
mod http;

#[cfg(feature = "etcd")]
mod etcd;

#[cfg(feature = "consul")]
mod consul;

pub use backend::{Backend, Connect, Snapshot};
pub use memory::{MemoryBackend, MemoryConfig};
pub use registrar::{Registrar, Registration, RegistrationState};
pub use resolver::Resolver;
pub use signal::shutdown_signal;
pub use watcher::{Watcher, WatcherConfig};

pub use beacon_core::{
    diff, AddressSet, DiscoveryError, Lease, Op, ServiceInstance, Update, WatchCursor,
};

#[cfg(feature = "etcd")]
pub use etcd::{EtcdBackend, EtcdConfig};

#[cfg(feature = "consul")]
pub use consul::{ConsulBackend, ConsulConfig};
