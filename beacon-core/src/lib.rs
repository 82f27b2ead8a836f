//! # beacon-core
//!
//! Core types and error definitions for beacon service discovery.
//!
//! This crate provides:
//! - Error types (`DiscoveryError`)
//! - Published identities (`ServiceInstance`, `Lease`)
//! - Membership updates (`Update`, `Op`, `AddressSet`, `WatchCursor`)
//! - The `diff` engine shared by every store backend

mod error;
mod instance;
mod update;

pub use error::{DiscoveryError, Result};
pub use instance::{Lease, ServiceInstance};
pub use update::{diff, AddressSet, Op, Update, WatchCursor};
