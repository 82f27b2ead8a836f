//! Service instances and their liveness leases.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DiscoveryError;

/// One running process advertising a service.
///
/// The instance id `{name}-{host}-{port}` is the record identifier used by
/// every store, so re-registering the same process overwrites its previous
/// record instead of creating a sibling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInstance {
    name: String,
    host: String,
    port: u16,
}

impl ServiceInstance {
    /// Create a new instance, validating its fields.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, DiscoveryError> {
        let name = name.into();
        let host = host.into();

        if name.is_empty() {
            return Err(DiscoveryError::invalid_argument("no service name provided"));
        }
        if name.contains('/') {
            return Err(DiscoveryError::invalid_argument(format!(
                "service name must not contain '/': {name}"
            )));
        }
        if host.is_empty() {
            return Err(DiscoveryError::invalid_argument("no service host provided"));
        }
        if port == 0 {
            return Err(DiscoveryError::invalid_argument("service port must be positive"));
        }

        Ok(Self { name, host, port })
    }

    /// Service name this instance advertises.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Advertised port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Store record identifier.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.name, self.host, self.port)
    }

    /// Address handed to resolvers, `host:port`.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// A time-bounded liveness claim on a published record.
///
/// The record is reaped by the store unless it is refreshed within `ttl`,
/// so `refresh_interval` is always strictly shorter than `ttl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "LeaseSpec")]
pub struct Lease {
    ttl: Duration,
    refresh_interval: Duration,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(3),
        }
    }
}

impl Lease {
    /// Create a lease, validating that it can be kept alive.
    pub fn new(ttl: Duration, refresh_interval: Duration) -> Result<Self, DiscoveryError> {
        // Stores express TTLs in whole seconds.
        if ttl < Duration::from_secs(1) {
            return Err(DiscoveryError::invalid_argument(format!(
                "lease ttl must be at least one second, got {ttl:?}"
            )));
        }
        if refresh_interval.is_zero() {
            return Err(DiscoveryError::invalid_argument(
                "lease refresh interval must be positive",
            ));
        }
        if refresh_interval >= ttl {
            return Err(DiscoveryError::invalid_argument(format!(
                "refresh interval {refresh_interval:?} must be shorter than ttl {ttl:?}"
            )));
        }

        Ok(Self {
            ttl,
            refresh_interval,
        })
    }

    /// Time after which an unrefreshed record is reaped.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// TTL rounded up to whole seconds, as sent to the stores.
    #[must_use]
    pub fn ttl_secs(&self) -> u64 {
        let secs = self.ttl.as_secs();
        if self.ttl.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Interval between heartbeats.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }
}

/// Unvalidated lease as it appears in configuration files.
#[derive(Deserialize)]
struct LeaseSpec {
    #[serde(with = "humantime_serde")]
    ttl: Duration,
    #[serde(with = "humantime_serde")]
    refresh_interval: Duration,
}

impl TryFrom<LeaseSpec> for Lease {
    type Error = DiscoveryError;

    fn try_from(spec: LeaseSpec) -> Result<Self, Self::Error> {
        Self::new(spec.ttl, spec.refresh_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_identity() {
        let instance = ServiceInstance::new("hello_service", "127.0.0.1", 1701).unwrap();
        assert_eq!(instance.id(), "hello_service-127.0.0.1-1701");
        assert_eq!(instance.addr(), "127.0.0.1:1701");
        assert_eq!(instance.to_string(), "hello_service@127.0.0.1:1701");
    }

    #[test]
    fn test_instance_validation() {
        assert!(matches!(
            ServiceInstance::new("", "127.0.0.1", 80),
            Err(DiscoveryError::InvalidArgument(_))
        ));
        assert!(ServiceInstance::new("svc", "", 80).is_err());
        assert!(ServiceInstance::new("svc", "127.0.0.1", 0).is_err());
        assert!(ServiceInstance::new("a/b", "127.0.0.1", 80).is_err());
    }

    #[test]
    fn test_lease_validation() {
        assert!(Lease::new(Duration::from_secs(5), Duration::from_secs(3)).is_ok());
        assert!(Lease::new(Duration::from_secs(5), Duration::from_secs(5)).is_err());
        assert!(Lease::new(Duration::from_millis(500), Duration::from_millis(100)).is_err());
        assert!(Lease::new(Duration::from_secs(5), Duration::ZERO).is_err());
    }

    #[test]
    fn test_lease_ttl_rounds_up() {
        let lease = Lease::new(Duration::from_millis(2500), Duration::from_secs(1)).unwrap();
        assert_eq!(lease.ttl_secs(), 3);
        assert_eq!(Lease::default().ttl_secs(), 5);
    }

    #[test]
    fn test_lease_from_config() {
        let lease: Lease =
            serde_json::from_str(r#"{"ttl": "10s", "refresh_interval": "4s"}"#).unwrap();
        assert_eq!(lease.ttl(), Duration::from_secs(10));
        assert_eq!(lease.refresh_interval(), Duration::from_secs(4));

        let invalid = serde_json::from_str::<Lease>(r#"{"ttl": "2s", "refresh_interval": "4s"}"#);
        assert!(invalid.is_err());
    }
}
