//! Entry point turning a service name into a [`Watcher`].

use std::sync::Arc;

use beacon_core::DiscoveryError;

use crate::backend::{Backend, Connect};
use crate::watcher::{Watcher, WatcherConfig};

/// Resolves one service name against a coordination store.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use beacon_discovery::{MemoryBackend, Resolver};
///
/// let resolver = Resolver::new("greeter");
/// let watcher = resolver.resolve_with(Arc::new(MemoryBackend::new())).unwrap();
/// assert_eq!(watcher.service(), "greeter");
///
/// assert!(Resolver::new("").resolve_with(Arc::new(MemoryBackend::new())).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Resolver {
    service: String,
    config: WatcherConfig,
}

impl Resolver {
    /// Create a resolver for `service`.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            config: WatcherConfig::default(),
        }
    }

    /// Configure the watchers this resolver creates.
    #[must_use]
    pub fn with_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Service name being resolved.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Connect to the store at `target` and bind a watcher to it.
    ///
    /// Only builds the client; the store is first contacted by
    /// [`Watcher::next`].
    pub fn resolve<B: Connect>(&self, target: &str) -> Result<Watcher<B>, DiscoveryError> {
        self.validate()?;
        let backend = B::connect(target)?;
        Ok(Watcher::with_config(
            Arc::new(backend),
            self.service.clone(),
            self.config,
        ))
    }

    /// Bind a watcher to an existing backend.
    pub fn resolve_with<B: Backend>(&self, backend: Arc<B>) -> Result<Watcher<B>, DiscoveryError> {
        self.validate()?;
        Ok(Watcher::with_config(backend, self.service.clone(), self.config))
    }

    fn validate(&self) -> Result<(), DiscoveryError> {
        if self.service.is_empty() {
            return Err(DiscoveryError::invalid_argument("no service name provided"));
        }
        if self.service.contains('/') {
            return Err(DiscoveryError::invalid_argument(format!(
                "service name must not contain '/': {}",
                self.service
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::MemoryBackend;

    #[test]
    fn test_empty_name_rejected() {
        let result = Resolver::new("").resolve_with(Arc::new(MemoryBackend::new()));
        assert!(matches!(result, Err(DiscoveryError::InvalidArgument(_))));
    }

    #[test]
    fn test_nested_name_rejected() {
        let result = Resolver::new("a/b").resolve_with(Arc::new(MemoryBackend::new()));
        assert!(matches!(result, Err(DiscoveryError::InvalidArgument(_))));
    }

    #[test]
    fn test_resolve_with_binds_service() {
        let resolver = Resolver::new("greeter")
            .with_config(WatcherConfig::default().backoff(Duration::from_millis(200)));
        let watcher = resolver
            .resolve_with(Arc::new(MemoryBackend::new()))
            .unwrap();
        assert_eq!(watcher.service(), "greeter");
        assert_eq!(watcher.cursor(), None);
        assert!(watcher.addrs().is_empty());
    }

    #[cfg(feature = "etcd")]
    #[test]
    fn test_resolve_reports_bad_target() {
        use crate::etcd::EtcdBackend;

        let result = Resolver::new("greeter").resolve::<EtcdBackend>("ftp://127.0.0.1:2379");
        assert!(matches!(result, Err(DiscoveryError::ConnectionSetup(_))));

        let result = Resolver::new("").resolve::<EtcdBackend>("http://127.0.0.1:2379");
        assert!(matches!(result, Err(DiscoveryError::InvalidArgument(_))));

        assert!(Resolver::new("greeter")
            .resolve::<EtcdBackend>("http://127.0.0.1:2379")
            .is_ok());
    }
}
